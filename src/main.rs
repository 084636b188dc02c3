use clap::{Parser, Subcommand};
use md_forge::cli;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "md-forge")]
#[command(about = "Master/detail calculation core: formula cascades, aggregation and save projections")]
#[command(long_about = "md-forge - Master/detail calculation core

Compiles a page's calc, aggregate and broadcast rules, replays edits against
in-memory rows and prints the minimal save payload.

COMMANDS:
  check   - Compile the page rules and report problems
  run     - Load rows, calculate, apply edits, validate, print the payload

EXAMPLES:
  md-forge check session.yaml
  md-forge run session.yaml --precision 4
  RUST_LOG=md_forge=debug md-forge run session.yaml -v")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the page rules of a session file and report problems
    Check {
        /// Path to a session file (.yaml, .yml or .json)
        file: PathBuf,
    },

    #[command(long_about = "Run a session file end to end.

Loads the master rows (details are fetched lazily from 'detailStore'),
recalculates everything, applies the 'edits' in order, validates the
dirty rows and prints the save payload as JSON.

EDIT STEPS:
  {op: set, master: 1, field: apexPl, value: 200}
  {op: set, master: 1, tab: yl, row: 10, field: price, value: 6}
  {op: addRow, master: 1, tab: yl, record: {price: 5}}
  {op: deleteRow, master: 1, tab: yl, row: 10}
  {op: broadcast, master: 1}")]
    /// Replay a session file and print the save payload
    Run {
        /// Path to a session file (.yaml, .yml or .json)
        file: PathBuf,

        /// Decimal places for computed values (overrides the session's engine)
        #[arg(short, long, env = "MD_FORGE_PRECISION")]
        precision: Option<u32>,

        /// Show the fields changed by every step
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "md_forge=error".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => cli::check(file)?,
        Commands::Run {
            file,
            precision,
            verbose,
        } => cli::run(file, precision, verbose).await?,
    }
    Ok(())
}

//! Calculation engine: expressions, rule compilation, cascades and aggregation

pub mod aggregate;
pub mod broadcast;
pub mod cascade;
pub mod compiler;
pub mod dirty;
pub mod expression;

pub use aggregate::{Aggregator, Algorithm, CompiledAggregate, PostAssignment, RowFilter};
pub use broadcast::{DetailSource, MemoryDetailSource, RefreshSink};
pub use cascade::{DeclaredDependencies, DependencyTest, ExpressionMentions, RuleEvaluator};
pub use compiler::{CompiledRule, RuleSet};
pub use dirty::DirtyTracker;
pub use expression::CompiledExpr;

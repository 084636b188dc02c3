//! Expression tokenizer
//!
//! Converts rule expressions like "batchQty * perHl + (mode == 'B' ? 2 : 0)"
//! into a sequence of tokens that can be parsed into an AST.

use std::iter::Peekable;
use std::str::Chars;

/// A token in a rule expression
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A numeric literal (e.g., 123, 45.67, 1.5e10)
    Number(f64),
    /// A string literal (e.g., "hello" or 'world')
    Text(String),
    /// A field reference or function name
    Identifier(String),
    /// Arithmetic, comparison and logical operators, normalized:
    /// `==`/`===` become `=`, `!=`/`!==` become `<>`
    Operator(String),
    OpenParen,
    CloseParen,
    Comma,
    /// `?` of a conditional
    Question,
    /// `:` of a conditional
    Colon,
}

/// Error during tokenization
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizeError {
    pub message: String,
    pub position: usize,
}

impl TokenizeError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl std::fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tokenize error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for TokenizeError {}

/// Tokenizer for rule expressions
pub struct Tokenizer<'a> {
    chars: Peekable<Chars<'a>>,
    position: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(expression: &'a str) -> Self {
        // Spreadsheet-style "=a+b" is accepted too
        let trimmed = expression.trim_start();
        let expression = match trimmed.strip_prefix('=') {
            Some(rest) if !rest.starts_with('=') => rest,
            _ => trimmed,
        };
        Self {
            chars: expression.chars().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire expression into a vector of tokens
    pub fn tokenize(mut self) -> Result<Vec<Token>, TokenizeError> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>, TokenizeError> {
        self.skip_whitespace();

        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let token = match c {
            '"' | '\'' => self.read_string()?,

            '(' => self.single(Token::OpenParen),
            ')' => self.single(Token::CloseParen),
            ',' => self.single(Token::Comma),
            '?' => self.single(Token::Question),
            ':' => self.single(Token::Colon),

            '+' | '-' | '*' | '/' | '^' | '%' => {
                self.advance();
                Token::Operator(c.to_string())
            }

            '<' => self.read_less_than_operator(),
            '>' => self.read_greater_than_operator(),
            '=' => self.read_equality_operator(),
            '!' => self.read_bang_operator(),
            '&' => self.read_doubled('&', "&&")?,
            '|' => self.read_doubled('|', "||")?,

            c if c.is_ascii_digit() || c == '.' => self.read_number()?,

            c if c.is_alphabetic() || c == '_' || c == '$' => self.read_identifier(),

            c => {
                return Err(TokenizeError::new(
                    format!("Unexpected character: '{}'", c),
                    self.position,
                ));
            }
        };

        Ok(Some(token))
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c.is_some() {
            self.position += 1;
        }
        c
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Read a string literal (double or single quoted, doubled quote escapes)
    fn read_string(&mut self) -> Result<Token, TokenizeError> {
        let start_pos = self.position;
        let Some(quote) = self.advance() else {
            return Err(TokenizeError::new("Expected string literal", start_pos));
        };
        let mut value = String::new();

        loop {
            match self.advance() {
                None => {
                    return Err(TokenizeError::new("Unterminated string literal", start_pos));
                }
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(c) => value.push(c),
            }
        }

        Ok(Token::Text(value))
    }

    fn push_digits(&mut self, out: &mut String) {
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            out.push(c);
            self.advance();
        }
    }

    /// Read a number (integer, decimal, or scientific notation)
    fn read_number(&mut self) -> Result<Token, TokenizeError> {
        let start_pos = self.position;
        let mut num_str = String::new();

        self.push_digits(&mut num_str);

        if self.peek() == Some('.') {
            num_str.push('.');
            self.advance();
            self.push_digits(&mut num_str);
        }

        if let Some(e @ ('e' | 'E')) = self.peek() {
            num_str.push(e);
            self.advance();
            if let Some(sign @ ('+' | '-')) = self.peek() {
                num_str.push(sign);
                self.advance();
            }
            self.push_digits(&mut num_str);
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| TokenizeError::new(format!("Invalid number: {}", num_str), start_pos))
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }

        Token::Identifier(ident)
    }

    fn read_less_than_operator(&mut self) -> Token {
        self.advance();
        match self.peek() {
            Some('=') => self.single(Token::Operator("<=".to_string())),
            Some('>') => self.single(Token::Operator("<>".to_string())),
            _ => Token::Operator("<".to_string()),
        }
    }

    fn read_greater_than_operator(&mut self) -> Token {
        self.advance();
        match self.peek() {
            Some('=') => self.single(Token::Operator(">=".to_string())),
            _ => Token::Operator(">".to_string()),
        }
    }

    /// `=`, `==` and `===` all mean equality
    fn read_equality_operator(&mut self) -> Token {
        self.advance();
        for _ in 0..2 {
            if self.peek() == Some('=') {
                self.advance();
            }
        }
        Token::Operator("=".to_string())
    }

    /// `!` is logical not, `!=` and `!==` mean inequality
    fn read_bang_operator(&mut self) -> Token {
        self.advance();
        if self.peek() != Some('=') {
            return Token::Operator("!".to_string());
        }
        self.advance();
        if self.peek() == Some('=') {
            self.advance();
        }
        Token::Operator("<>".to_string())
    }

    fn read_doubled(&mut self, c: char, op: &str) -> Result<Token, TokenizeError> {
        let start_pos = self.position;
        self.advance();
        if self.peek() == Some(c) {
            self.advance();
            Ok(Token::Operator(op.to_string()))
        } else {
            Err(TokenizeError::new(
                format!("Expected '{}' after '{}'", c, c),
                start_pos,
            ))
        }
    }
}

/// Convenience function to tokenize an expression string
pub fn tokenize(expression: &str) -> Result<Vec<Token>, TokenizeError> {
    Tokenizer::new(expression).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(s: &str) -> Token {
        Token::Operator(s.to_string())
    }

    fn ident(s: &str) -> Token {
        Token::Identifier(s.to_string())
    }

    #[test]
    fn test_tokenize_numbers() {
        assert_eq!(tokenize("42").unwrap(), vec![Token::Number(42.0)]);
        assert_eq!(tokenize("3.567").unwrap(), vec![Token::Number(3.567)]);
        assert_eq!(tokenize(".5").unwrap(), vec![Token::Number(0.5)]);
        assert_eq!(tokenize("2E-5").unwrap(), vec![Token::Number(2e-5)]);
    }

    #[test]
    fn test_tokenize_strings() {
        assert_eq!(
            tokenize("'B'").unwrap(),
            vec![Token::Text("B".to_string())]
        );
        assert_eq!(
            tokenize("\"say \"\"hi\"\"\"").unwrap(),
            vec![Token::Text("say \"hi\"".to_string())]
        );
    }

    #[test]
    fn test_tokenize_field_arithmetic() {
        let tokens = tokenize("batchQty * perHl").unwrap();
        assert_eq!(tokens, vec![ident("batchQty"), op("*"), ident("perHl")]);
    }

    #[test]
    fn test_tokenize_equality_variants_normalize() {
        for source in ["a = 1", "a == 1", "a === 1"] {
            assert_eq!(
                tokenize(source).unwrap(),
                vec![ident("a"), op("="), Token::Number(1.0)],
                "{}",
                source
            );
        }
        for source in ["a <> 1", "a != 1", "a !== 1"] {
            assert_eq!(
                tokenize(source).unwrap(),
                vec![ident("a"), op("<>"), Token::Number(1.0)],
                "{}",
                source
            );
        }
    }

    #[test]
    fn test_tokenize_conditional_and_logic() {
        let tokens = tokenize("a > 0 && !b ? x : y").unwrap();
        assert_eq!(
            tokens,
            vec![
                ident("a"),
                op(">"),
                Token::Number(0.0),
                op("&&"),
                op("!"),
                ident("b"),
                Token::Question,
                ident("x"),
                Token::Colon,
                ident("y"),
            ]
        );
    }

    #[test]
    fn test_tokenize_leading_equals_sign() {
        assert_eq!(
            tokenize("=a+b").unwrap(),
            vec![ident("a"), op("+"), ident("b")]
        );
    }

    #[test]
    fn test_tokenize_errors() {
        let err = tokenize("a # b").unwrap_err();
        assert_eq!(err.position, 2);
        assert!(err.message.contains('#'));

        assert!(tokenize("'open").is_err());
        assert!(tokenize("a & b").is_err());
    }
}

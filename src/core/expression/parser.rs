//! Expression parser
//!
//! Converts a sequence of tokens into an Abstract Syntax Tree (AST).
//! Uses recursive descent parsing with operator precedence.

use super::tokenizer::Token;

/// Abstract Syntax Tree node for rule expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A numeric literal
    Number(f64),
    /// A string literal
    Text(String),
    /// A field reference
    Reference(String),
    /// Function call: NAME(arg1, arg2, ...)
    FunctionCall { name: String, args: Vec<Expr> },
    /// Binary operation: left op right
    BinaryOp {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary operation: -expr, +expr, !expr
    UnaryOp { op: String, operand: Box<Expr> },
    /// condition ? then : otherwise
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Visit every field reference in evaluation order
    pub fn walk_references<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        match self {
            Expr::Number(_) | Expr::Text(_) => {}
            Expr::Reference(name) => visit(name),
            Expr::FunctionCall { args, .. } => {
                for arg in args {
                    arg.walk_references(visit);
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                left.walk_references(visit);
                right.walk_references(visit);
            }
            Expr::UnaryOp { operand, .. } => operand.walk_references(visit),
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.walk_references(visit);
                then.walk_references(visit);
                otherwise.walk_references(visit);
            }
        }
    }
}

/// Error during parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parse error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseError {}

/// Parser for expression tokens
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse the tokens into an AST
    pub fn parse(mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new("Empty expression", 0));
        }
        let expr = self.expression()?;

        if !self.is_at_end() {
            return Err(ParseError::new(
                format!("Unexpected token after expression: {:?}", self.peek()),
                self.position,
            ));
        }

        Ok(expr)
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.position += 1;
        }
    }

    fn match_token(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_any_operator(&mut self, ops: &[&str]) -> Option<String> {
        if let Some(Token::Operator(s)) = self.peek() {
            if ops.contains(&s.as_str()) {
                let op = s.clone();
                self.advance();
                return Some(op);
            }
        }
        None
    }

    fn expect(&mut self, expected: Token, message: &str) -> Result<(), ParseError> {
        if self.match_token(&expected) {
            Ok(())
        } else {
            Err(ParseError::new(message, self.position))
        }
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.conditional()
    }

    /// Conditional: or ( "?" expression ":" expression )?   (right-associative)
    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let condition = self.or()?;

        if !self.match_token(&Token::Question) {
            return Ok(condition);
        }
        let then = self.expression()?;
        self.expect(Token::Colon, "Expected ':' in conditional expression")?;
        let otherwise = self.expression()?;

        Ok(Expr::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    /// Left-associative chain of one precedence level
    fn binary_chain(
        &mut self,
        ops: &[&str],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;

        while let Some(op) = self.match_any_operator(ops) {
            let right = next(self)?;
            left = Expr::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(&["||"], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(&["&&"], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(&["=", "<>", "<", ">", "<=", ">="], Self::term)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(&["+", "-"], Self::factor)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(&["*", "/", "%"], Self::power)
    }

    /// Power: unary ( "^" power )?   (right-associative)
    fn power(&mut self) -> Result<Expr, ParseError> {
        let left = self.unary()?;

        if self.match_any_operator(&["^"]).is_some() {
            let right = self.power()?;
            Ok(Expr::BinaryOp {
                op: "^".to_string(),
                left: Box::new(left),
                right: Box::new(right),
            })
        } else {
            Ok(left)
        }
    }

    /// Unary: ( "-" | "+" | "!" ) unary | call
    fn unary(&mut self) -> Result<Expr, ParseError> {
        if let Some(op) = self.match_any_operator(&["-", "+", "!"]) {
            let operand = self.unary()?;
            Ok(Expr::UnaryOp {
                op,
                operand: Box::new(operand),
            })
        } else {
            self.call()
        }
    }

    /// Call: IDENTIFIER "(" arguments? ")" | primary
    fn call(&mut self) -> Result<Expr, ParseError> {
        let expr = self.primary()?;

        if !self.match_token(&Token::OpenParen) {
            return Ok(expr);
        }

        let Expr::Reference(name) = expr else {
            return Err(ParseError::new(
                "Only named functions can be called",
                self.position,
            ));
        };
        let args = self.arguments()?;
        self.expect(Token::CloseParen, "Expected ')' after function arguments")?;

        Ok(Expr::FunctionCall { name, args })
    }

    /// Arguments: ( expr ( "," expr )* )?
    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();

        if let Some(Token::CloseParen) = self.peek() {
            return Ok(args);
        }

        args.push(self.expression()?);
        while self.match_token(&Token::Comma) {
            args.push(self.expression()?);
        }

        Ok(args)
    }

    /// Primary: NUMBER | STRING | IDENTIFIER | "(" expr ")"
    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().cloned();

        match token {
            Some(Token::Number(n)) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Some(Token::Text(s)) => {
                self.advance();
                Ok(Expr::Text(s))
            }
            Some(Token::Identifier(name)) => {
                self.advance();
                Ok(Expr::Reference(name))
            }
            Some(Token::OpenParen) => {
                self.advance();
                let expr = self.expression()?;
                self.expect(Token::CloseParen, "Expected ')' after expression")?;
                Ok(expr)
            }
            Some(token) => Err(ParseError::new(
                format!("Unexpected token: {:?}", token),
                self.position,
            )),
            None => Err(ParseError::new(
                "Unexpected end of expression",
                self.position,
            )),
        }
    }
}

/// Convenience function to parse tokens into an AST
pub fn parse(tokens: Vec<Token>) -> Result<Expr, ParseError> {
    Parser::new(tokens).parse()
}

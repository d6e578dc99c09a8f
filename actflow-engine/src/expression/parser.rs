// Expression Engine Parser
// Parses tokens into an AST for workflow expressions

use crate::expression::lexer::{LexError, Lexer, Spanned, Token};

use std::fmt;

/// Functions whose presence in a condition disables the implicit `success()` guard
pub const STATUS_FUNCTIONS: [&str; 4] = ["success", "failure", "always", "cancelled"];

/// Abstract Syntax Tree node for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Null literal
    Null,

    /// Boolean literal
    Bool(bool),

    /// Number literal
    Number(f64),

    /// String literal
    String(String),

    /// Context reference: github.ref, steps['build'].outputs, needs.*.result
    Reference(Reference),

    /// Function call: contains(a, b), format('{0}', x)
    FunctionCall { name: String, args: Vec<Expr> },

    /// Index access on a computed value: fromJSON(x)[0]
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Member access on a computed value: fromJSON(x).key
    Member { object: Box<Expr>, property: String },

    /// Object filter on a computed value: fromJSON(x).*
    Filter { object: Box<Expr> },

    /// Unary operation: !expr
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Binary operation: a == b, a && b
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Reference to a context value (github, steps, needs, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<ReferencePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferencePart {
    /// Property access by name
    Property(String),
    /// Index access by key/index
    Index(Box<Expr>),
    /// `.*` object filter
    Wildcard,
}

impl Reference {
    pub fn new(name: String) -> Self {
        Self {
            parts: vec![ReferencePart::Property(name)],
        }
    }

    pub fn with_property(mut self, name: String) -> Self {
        self.parts.push(ReferencePart::Property(name));
        self
    }

    pub fn with_index(mut self, index: Expr) -> Self {
        self.parts.push(ReferencePart::Index(Box::new(index)));
        self
    }

    pub fn with_wildcard(mut self) -> Self {
        self.parts.push(ReferencePart::Wildcard);
        self
    }

    /// Top-level context name, e.g. `steps` for `steps.a.outputs.b`
    pub fn root(&self) -> Option<&str> {
        match self.parts.first() {
            Some(ReferencePart::Property(name)) => Some(name),
            _ => None,
        }
    }
}

impl Expr {
    /// Visit this node and every descendant, parents first
    pub fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Reference(reference) => {
                for part in &reference.parts {
                    if let ReferencePart::Index(index) = part {
                        index.walk(f);
                    }
                }
            }
            Expr::FunctionCall { args, .. } => args.iter().for_each(|a| a.walk(f)),
            Expr::Index { object, index } => {
                object.walk(f);
                index.walk(f);
            }
            Expr::Member { object, .. } | Expr::Filter { object } => object.walk(f),
            Expr::Unary { expr, .. } => expr.walk(f),
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) => {}
        }
    }

    /// Names of every function called anywhere in the expression
    pub fn function_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(&mut |e| {
            if let Expr::FunctionCall { name, .. } = e {
                names.push(name.clone());
            }
        });
        names
    }

    /// True when the expression calls success(), failure(), always() or cancelled()
    pub fn uses_status_function(&self) -> bool {
        self.function_names().iter().any(|name| {
            STATUS_FUNCTIONS
                .iter()
                .any(|status| name.eq_ignore_ascii_case(status))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not, // !
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Comparison
    Eq, // ==
    Ne, // !=
    Lt, // <
    Le, // <=
    Gt, // >
    Ge, // >=

    // Logical
    And, // &&
    Or,  // ||
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Le => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Ge => write!(f, ">="),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}

/// Parser error
#[derive(Debug, Clone)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Recursive descent parser for workflow expressions
pub struct ExprParser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse expression from string
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let mut lexer = Lexer::new(input);
        let tokens = lexer.tokenize_spanned()?;
        let mut parser = Self::new(tokens);
        parser.parse()
    }

    /// Parse the token stream into an expression
    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty expression"));
        }

        let expr = self.parse_or()?;

        if !self.check(&Token::Eof) {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Equality: == !=
    // 4. Comparison: < <= > >=
    // 5. Unary: !
    // 6. Postfix: . [] .* ()

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_equality()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };

            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.check(&Token::Dot) {
                self.advance();
                if self.check(&Token::Star) {
                    self.advance();
                    expr = Expr::Filter {
                        object: Box::new(expr),
                    };
                } else {
                    let property = self.property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
            } else if self.check(&Token::LBracket) {
                self.advance();
                let index = self.parse_or()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        match self.peek().clone() {
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            Token::Identifier(name) => {
                self.advance();

                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(Expr::FunctionCall { name, args });
                }

                let mut reference = Reference::new(name);

                while self.check(&Token::Dot) || self.check(&Token::LBracket) {
                    if self.check(&Token::Dot) {
                        self.advance();
                        if self.check(&Token::Star) {
                            self.advance();
                            reference = reference.with_wildcard();
                        } else {
                            let prop = self.property_name()?;
                            reference = reference.with_property(prop);
                        }
                    } else {
                        self.advance();
                        let index = self.parse_or()?;
                        self.expect(&Token::RBracket, "expected ']'")?;
                        reference = reference.with_index(index);
                    }
                }

                Ok(Expr::Reference(reference))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            token => Err(self.error(&format!("unexpected token: {}", token))),
        }
    }

    fn property_name(&mut self) -> Result<String, ParseExprError> {
        let name = match self.peek() {
            Token::Identifier(name) => name.clone(),
            // keywords are valid property names: inputs.true
            Token::Null | Token::True | Token::False => self.peek().to_string(),
            _ => return Err(self.error("expected property name after '.'")),
        };
        self.advance();
        Ok(name)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&Token::LParen, "expected '('")?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_or()?);

            while self.check(&Token::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }

        self.expect(&Token::RParen, "expected ')'")?;
        Ok(args)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseExprError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn error(&self, message: &str) -> ParseExprError {
        let position = self
            .tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0);
        ParseExprError {
            message: message.to_string(),
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(ExprParser::parse_str("null").unwrap(), Expr::Null);
        assert_eq!(ExprParser::parse_str("true").unwrap(), Expr::Bool(true));
        assert_eq!(ExprParser::parse_str("42").unwrap(), Expr::Number(42.0));
        assert_eq!(ExprParser::parse_str("-1").unwrap(), Expr::Number(-1.0));
        assert_eq!(
            ExprParser::parse_str("'hello'").unwrap(),
            Expr::String("hello".to_string())
        );
    }

    #[test]
    fn test_parse_reference() {
        let expr = ExprParser::parse_str("steps.build-step.outputs.version").unwrap();

        let Expr::Reference(r) = expr else {
            panic!("expected reference");
        };
        assert_eq!(r.parts.len(), 4);
        assert_eq!(r.root(), Some("steps"));
        assert_eq!(r.parts[1], ReferencePart::Property("build-step".to_string()));
    }

    #[test]
    fn test_parse_index_and_wildcard() {
        let expr = ExprParser::parse_str("github['event'].commits.*.message").unwrap();

        let Expr::Reference(r) = expr else {
            panic!("expected reference");
        };
        assert!(matches!(r.parts[1], ReferencePart::Index(_)));
        assert_eq!(r.parts[3], ReferencePart::Wildcard);
    }

    #[test]
    fn test_parse_postfix_on_function_result() {
        let expr = ExprParser::parse_str("fromJSON(needs.a.outputs.list)[0].name").unwrap();
        assert!(matches!(expr, Expr::Member { .. }));
    }

    #[test]
    fn test_parse_function_call() {
        let expr = ExprParser::parse_str("contains(github.ref, 'main')").unwrap();

        if let Expr::FunctionCall { name, args } = expr {
            assert_eq!(name, "contains");
            assert_eq!(args.len(), 2);
        } else {
            panic!("expected function call");
        }
    }

    #[test]
    fn test_parse_operator_precedence() {
        // && should bind tighter than ||
        let expr = ExprParser::parse_str("a || b && c").unwrap();

        if let Expr::Binary {
            op: BinaryOp::Or,
            right,
            ..
        } = expr
        {
            assert!(matches!(
                *right,
                Expr::Binary {
                    op: BinaryOp::And,
                    ..
                }
            ));
        } else {
            panic!("expected or expression");
        }
    }

    #[test]
    fn test_parse_not_binds_tighter_than_equality() {
        let expr = ExprParser::parse_str("!a == b").unwrap();
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Eq);
        assert!(matches!(*left, Expr::Unary { .. }));
    }

    #[test]
    fn test_uses_status_function() {
        let expr = ExprParser::parse_str("always() && github.ref == 'main'").unwrap();
        assert!(expr.uses_status_function());

        let expr = ExprParser::parse_str("!Failure()").unwrap();
        assert!(expr.uses_status_function());

        let expr = ExprParser::parse_str("github.ref == 'main'").unwrap();
        assert!(!expr.uses_status_function());
    }

    #[test]
    fn test_parse_errors_carry_position() {
        let err = ExprParser::parse_str("a == ").unwrap_err();
        assert_eq!(err.position, 5);

        let err = ExprParser::parse_str("(a").unwrap_err();
        assert!(err.message.contains("')'"));

        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
    }
}

// Expression Engine Lexer
// Tokenizes `${{ }}` expression bodies and splits templates into text and expression parts

use std::fmt;

/// Token types for workflow expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    // Identifiers and references
    Identifier(String),

    // Operators
    Star,  // *
    Eq,    // ==
    Ne,    // !=
    Lt,    // <
    Le,    // <=
    Gt,    // >
    Ge,    // >=
    And,   // &&
    Or,    // ||
    Not,   // !
    Dot,   // .
    Comma, // ,

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Star => write!(f, "*"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// A token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for LexError {}

/// Lexer for workflow expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
    len: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
            len: input.len(),
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        Ok(self.tokenize_spanned()?.into_iter().map(|s| s.token).collect())
    }

    /// Tokenize, keeping the offset of every token
    pub fn tokenize_spanned(&mut self) -> Result<Vec<Spanned>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            let position = if done { self.len } else { self.position };
            tokens.push(Spanned { token, position });
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '*' => self.single(Token::Star),
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),

            '=' => self.pair('=', Token::Eq, None, "expected '==' operator"),
            '!' => self.pair('=', Token::Ne, Some(Token::Not), ""),
            '<' => self.pair('=', Token::Le, Some(Token::Lt), ""),
            '>' => self.pair('=', Token::Ge, Some(Token::Gt), ""),
            '&' => self.pair('&', Token::And, None, "expected '&&' operator"),
            '|' => self.pair('|', Token::Or, None, "expected '||' operator"),

            '\'' => self.read_string(),

            '0'..='9' => self.read_number(false),
            '-' => {
                self.advance();
                match self.peek_char() {
                    Some(c) if c.is_ascii_digit() => self.read_number(true),
                    _ => Err(LexError {
                        message: "unexpected character: '-'".to_string(),
                        position: pos,
                    }),
                }
            }

            'a'..='z' | 'A'..='Z' | '_' => self.read_identifier(),

            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    fn single(&mut self, token: Token) -> Result<Token, LexError> {
        self.advance();
        Ok(token)
    }

    fn pair(
        &mut self,
        second: char,
        matched: Token,
        alone: Option<Token>,
        message: &str,
    ) -> Result<Token, LexError> {
        let pos = self.position;
        self.advance();
        if self.peek_char() == Some(second) {
            self.advance();
            return Ok(matched);
        }
        alone.ok_or_else(|| LexError {
            message: message.to_string(),
            position: pos,
        })
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // consume opening quote

        let mut value = String::new();

        loop {
            match self.chars.peek() {
                Some(&(_, '\'')) => {
                    self.advance();
                    // '' is an escaped quote
                    if self.peek_char() == Some('\'') {
                        value.push('\'');
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(&(_, ch)) => {
                    value.push(ch);
                    self.advance();
                }
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self, negative: bool) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();
        if negative {
            num_str.push('-');
        }

        if self.peek_char() == Some('0') {
            let mut ahead = self.chars.clone();
            ahead.next();
            if matches!(ahead.peek(), Some(&(_, 'x'))) {
                self.advance();
                self.advance();
                let mut hex = String::new();
                while let Some(ch) = self.peek_char().filter(char::is_ascii_hexdigit) {
                    hex.push(ch);
                    self.advance();
                }
                return i64::from_str_radix(&hex, 16)
                    .map(|n| Token::Number(if negative { -(n as f64) } else { n as f64 }))
                    .map_err(|_| LexError {
                        message: format!("invalid hex number: 0x{}", hex),
                        position: start,
                    });
            }
        }

        self.read_digits(&mut num_str);

        // Only a '.' followed by a digit continues the number; `1.foo` is not a decimal
        if self.peek_char() == Some('.') {
            let mut ahead = self.chars.clone();
            ahead.next();
            if matches!(ahead.peek(), Some(&(_, c)) if c.is_ascii_digit()) {
                num_str.push('.');
                self.advance();
                self.read_digits(&mut num_str);
            }
        }

        if matches!(self.peek_char(), Some('e' | 'E')) {
            num_str.push('e');
            self.advance();
            if let Some(sign @ ('+' | '-')) = self.peek_char() {
                num_str.push(sign);
                self.advance();
            }
            self.read_digits(&mut num_str);
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number: {}", num_str),
                position: start,
            })
    }

    fn read_digits(&mut self, out: &mut String) {
        while let Some(ch) = self.peek_char().filter(char::is_ascii_digit) {
            out.push(ch);
            self.advance();
        }
    }

    fn read_identifier(&mut self) -> Result<Token, LexError> {
        let mut ident = String::new();

        // Hyphens are legal inside identifiers (`steps.build-step.outputs`)
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let token = match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        };

        Ok(token)
    }
}

/// Piece of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Plain text copied through unchanged
    Text(String),
    /// Body of a `${{ ... }}` block, trimmed
    Expression(String),
}

/// Split a string into literal text and `${{ }}` expression bodies.
/// An unterminated `${{` is kept as text.
pub fn extract_expressions(input: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("${{") {
        let body_start = start + 3;
        match find_closing(&rest[body_start..]) {
            Some(len) => {
                text.push_str(&rest[..start]);
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                let body = &rest[body_start..body_start + len];
                parts.push(TemplatePart::Expression(body.trim().to_string()));
                rest = &rest[body_start + len + 2..];
            }
            None => break,
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }

    parts
}

/// True when the string contains at least one `${{ }}` block
pub fn contains_expression(input: &str) -> bool {
    extract_expressions(input)
        .iter()
        .any(|p| matches!(p, TemplatePart::Expression(_)))
}

// Offset of the `}}` closing the block, skipping any inside string literals
fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }

    None
}

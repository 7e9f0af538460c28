use crate::error::{AtmarkError, Span};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenType {
    // Single-character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Colon,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character tokens
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals
    Identifier,
    String,
    Integer,
    Double,

    // Keywords
    And,
    Else,
    False,
    For,
    If,
    In,
    Nil,
    Not,
    Or,
    True,
    While,

    // Special
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub token_type: TokenType,
    pub lexeme: String,
    pub span: Span,
}

impl Token {
    pub fn new(token_type: TokenType, lexeme: String, span: Span) -> Self {
        Self {
            token_type,
            lexeme,
            span,
        }
    }
}

/// Lexer for embedded host code: the expressions inside `@(...)` and
/// control conditions, and the statements inside `@{...}`.
pub struct Lexer {
    source: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    keywords: HashMap<&'static str, TokenType>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        let mut keywords = HashMap::new();
        keywords.insert("and", TokenType::And);
        keywords.insert("else", TokenType::Else);
        keywords.insert("false", TokenType::False);
        keywords.insert("for", TokenType::For);
        keywords.insert("if", TokenType::If);
        keywords.insert("in", TokenType::In);
        keywords.insert("nil", TokenType::Nil);
        keywords.insert("not", TokenType::Not);
        keywords.insert("or", TokenType::Or);
        keywords.insert("true", TokenType::True);
        keywords.insert("while", TokenType::While);

        Self {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            keywords,
        }
    }

    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, AtmarkError> {
        while !self.is_at_end() {
            self.start = self.current;
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenType::Eof,
            String::new(),
            Span::single(self.current),
        ));

        Ok(std::mem::take(&mut self.tokens))
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn scan_token(&mut self) -> Result<(), AtmarkError> {
        let c = self.advance();

        match c {
            '(' => self.add_token(TokenType::LeftParen),
            ')' => self.add_token(TokenType::RightParen),
            '{' => self.add_token(TokenType::LeftBrace),
            '}' => self.add_token(TokenType::RightBrace),
            '[' => self.add_token(TokenType::LeftBracket),
            ']' => self.add_token(TokenType::RightBracket),
            ',' => self.add_token(TokenType::Comma),
            ':' => self.add_token(TokenType::Colon),
            '.' => self.add_token(TokenType::Dot),
            '-' => self.add_token(TokenType::Minus),
            '+' => self.add_token(TokenType::Plus),
            ';' => self.add_token(TokenType::Semicolon),
            '*' => self.add_token(TokenType::Star),
            '!' => {
                let token_type = if self.match_char('=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.add_token(token_type);
            }
            '=' => {
                let token_type = if self.match_char('=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.add_token(token_type);
            }
            '<' => {
                let token_type = if self.match_char('=') {
                    TokenType::LessEqual
                } else {
                    TokenType::Less
                };
                self.add_token(token_type);
            }
            '>' => {
                let token_type = if self.match_char('=') {
                    TokenType::GreaterEqual
                } else {
                    TokenType::Greater
                };
                self.add_token(token_type);
            }
            '/' => {
                if self.match_char('/') {
                    // Comment goes until end of line
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else {
                    self.add_token(TokenType::Slash);
                }
            }
            ' ' | '\r' | '\t' | '\n' => {
                // Whitespace is insignificant
            }
            '"' | '\'' => self.string(c)?,
            c if c.is_ascii_digit() => self.number()?,
            c if c.is_alphabetic() || c == '_' => self.identifier(),
            _ => {
                return Err(AtmarkError::syntax(
                    Span::single(self.current.saturating_sub(1)),
                    format!("Unexpected character: '{}'", c),
                ));
            }
        }

        Ok(())
    }

    fn advance(&mut self) -> char {
        let c = self.source.get(self.current).copied().unwrap_or('\0');
        self.current += 1;
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.peek() != expected {
            false
        } else {
            self.advance();
            true
        }
    }

    fn peek(&self) -> char {
        self.source.get(self.current).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.source.get(self.current + 1).copied().unwrap_or('\0')
    }

    fn string(&mut self, quote: char) -> Result<(), AtmarkError> {
        // Triple quotes are atomic and may span lines without escapes
        // getting in the way of the closing run.
        let triple = self.peek() == quote && self.peek_next() == quote;
        if triple {
            self.advance();
            self.advance();
        }

        let mut content = String::new();
        loop {
            if self.is_at_end() {
                return Err(AtmarkError::syntax(
                    Span::new(self.start, self.current),
                    "Unterminated string".to_string(),
                ));
            }
            let c = self.advance();
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == quote && self.peek_next() == quote {
                    self.advance();
                    self.advance();
                    break;
                }
                content.push(c);
            } else if c == '\\' {
                content.push(self.escape_char()?);
            } else {
                content.push(c);
            }
        }

        self.add_token_with_content(TokenType::String, content);
        Ok(())
    }

    fn escape_char(&mut self) -> Result<char, AtmarkError> {
        if self.is_at_end() {
            return Err(AtmarkError::syntax(
                Span::new(self.start, self.current),
                "Unterminated string escape".to_string(),
            ));
        }
        let c = self.advance();
        match c {
            'n' => Ok('\n'),
            't' => Ok('\t'),
            'r' => Ok('\r'),
            '0' => Ok('\0'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            'x' => {
                let hi = self.advance();
                let lo = self.advance();
                let code = u32::from_str_radix(&format!("{}{}", hi, lo), 16).map_err(|_| {
                    AtmarkError::syntax(
                        Span::new(self.start, self.current),
                        "Invalid hex escape in string".to_string(),
                    )
                })?;
                char::from_u32(code).ok_or_else(|| {
                    AtmarkError::syntax(
                        Span::new(self.start, self.current),
                        "Hex escape out of range".to_string(),
                    )
                })
            }
            _ => Err(AtmarkError::syntax(
                Span::new(self.start, self.current),
                format!("Unknown string escape: '\\{}'", c),
            )),
        }
    }

    fn number(&mut self) -> Result<(), AtmarkError> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        let mut is_double = false;

        // Look for fractional part
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            is_double = true;
            // Consume the "."
            self.advance();

            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let number_slice: String = self.source[self.start..self.current].iter().collect();

        if is_double {
            if number_slice.parse::<f64>().is_err() {
                return Err(AtmarkError::syntax(
                    Span::new(self.start, self.current),
                    format!("Invalid double: {}", number_slice),
                ));
            }
            self.add_token_with_content(TokenType::Double, number_slice);
        } else {
            if number_slice.parse::<i64>().is_err() {
                return Err(AtmarkError::syntax(
                    Span::new(self.start, self.current),
                    format!("Invalid integer: {}", number_slice),
                ));
            }
            self.add_token_with_content(TokenType::Integer, number_slice);
        }

        Ok(())
    }

    fn identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let token_type = self
            .keywords
            .get(text.as_str())
            .cloned()
            .unwrap_or(TokenType::Identifier);

        self.add_token(token_type);
    }

    fn add_token(&mut self, token_type: TokenType) {
        let text: String = self.source[self.start..self.current].iter().collect();
        self.add_token_with_content(token_type, text);
    }

    fn add_token_with_content(&mut self, token_type: TokenType, lexeme: String) {
        self.tokens.push(Token::new(
            token_type,
            lexeme,
            Span::new(self.start, self.current),
        ));
    }
}

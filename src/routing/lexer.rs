//! Path template lexer.
//!
//! # Responsibilities
//! - Tokenize `google.api.http` path templates
//! - Reject unknown characters and unterminated variables
//!
//! # Grammar
//! ```text
//! Template  = "/" Segments [ Verb ] ;
//! Segments  = Segment { "/" Segment } ;
//! Segment   = "*" | "**" | LITERAL | Variable ;
//! Variable  = "{" FieldPath [ "=" Segments ] "}" ;
//! FieldPath = IDENT { "." IDENT } ;
//! Verb      = ":" LITERAL ;
//! ```
//!
//! Every character of the template ends up in exactly one token, so
//! concatenating token values reproduces the input.

use std::fmt;

/// Kind of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Slash,
    Star,
    StarStar,
    VariableStart,
    VariableEnd,
    Equal,
    Value,
    Dot,
    Verb,
    Eof,
}

/// A single lexed token with the text it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub val: String,
}

impl Token {
    fn new(kind: TokenKind, val: impl Into<String>) -> Self {
        Self {
            kind,
            val: val.into(),
        }
    }
}

/// Lexical error with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{msg} at offset {pos} in {template:?}")]
pub struct LexError {
    pub template: String,
    pub pos: usize,
    pub msg: String,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Slash => "slash",
            TokenKind::Star => "star",
            TokenKind::StarStar => "starstar",
            TokenKind::VariableStart => "variable start",
            TokenKind::VariableEnd => "variable end",
            TokenKind::Equal => "equal",
            TokenKind::Value => "value",
            TokenKind::Dot => "dot",
            TokenKind::Verb => "verb",
            TokenKind::Eof => "eof",
        };
        f.write_str(name)
    }
}

/// Tokenize a path template.
pub fn lex(template: &str) -> Result<Vec<Token>, LexError> {
    Lexer {
        input: template,
        pos: 0,
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn run(mut self) -> Result<Vec<Token>, LexError> {
        if self.peek() != Some('/') {
            return Err(self.error("template must start with '/'"));
        }
        self.emit(TokenKind::Slash, 1);
        self.segments(false)?;

        if self.peek() == Some(':') {
            self.emit(TokenKind::Verb, 1);
            self.literal()?;
        }
        if let Some(c) = self.peek() {
            return Err(self.error(&format!("unexpected character {c:?}")));
        }
        self.tokens.push(Token::new(TokenKind::Eof, ""));
        Ok(self.tokens)
    }

    fn segments(&mut self, in_variable: bool) -> Result<(), LexError> {
        loop {
            self.segment(in_variable)?;
            if self.peek() != Some('/') {
                return Ok(());
            }
            self.emit(TokenKind::Slash, 1);
        }
    }

    fn segment(&mut self, in_variable: bool) -> Result<(), LexError> {
        match self.peek() {
            Some('*') => {
                if self.peek_at(1) == Some('*') {
                    self.emit(TokenKind::StarStar, 2);
                } else {
                    self.emit(TokenKind::Star, 1);
                }
                Ok(())
            }
            Some('{') if in_variable => Err(self.error("nested variables are not allowed")),
            Some('{') => self.variable(),
            Some(c) if is_literal(c) => self.literal(),
            Some(c) => Err(self.error(&format!("unexpected character {c:?}"))),
            None => Err(self.error("unexpected end of template")),
        }
    }

    fn variable(&mut self) -> Result<(), LexError> {
        self.emit(TokenKind::VariableStart, 1);
        self.ident()?;
        while self.peek() == Some('.') {
            self.emit(TokenKind::Dot, 1);
            self.ident()?;
        }
        if self.peek() == Some('=') {
            self.emit(TokenKind::Equal, 1);
            self.segments(true)?;
        }
        match self.peek() {
            Some('}') => {
                self.emit(TokenKind::VariableEnd, 1);
                Ok(())
            }
            Some(c) => Err(self.error(&format!("unexpected character {c:?} in variable"))),
            None => Err(self.error("unterminated variable")),
        }
    }

    fn ident(&mut self) -> Result<(), LexError> {
        let rest = &self.input[self.pos..];
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return Err(self.error("expected field name")),
        }
        let len = chars
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map_or(rest.len(), |(i, _)| i);
        self.emit(TokenKind::Value, len);
        Ok(())
    }

    fn literal(&mut self) -> Result<(), LexError> {
        let rest = &self.input[self.pos..];
        let len = rest
            .char_indices()
            .find(|(_, c)| !is_literal(*c))
            .map_or(rest.len(), |(i, _)| i);
        if len == 0 {
            return Err(self.error("expected literal"));
        }
        self.emit(TokenKind::Value, len);
        Ok(())
    }

    fn emit(&mut self, kind: TokenKind, len: usize) {
        let val = &self.input[self.pos..self.pos + len];
        self.tokens.push(Token::new(kind, val));
        self.pos += len;
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(offset)
    }

    fn error(&self, msg: &str) -> LexError {
        LexError {
            template: self.input.to_string(),
            pos: self.pos,
            msg: msg.to_string(),
        }
    }
}

/// Characters allowed in literal segments and verbs.
fn is_literal(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%')
}

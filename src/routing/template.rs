//! Path template parser.
//!
//! Turns the lexer's token stream into route-construction instructions:
//! literal segments, capturing variables and an optional verb.

use std::sync::Arc;

use crate::routing::lexer::{lex, LexError, Token, TokenKind};

/// One instruction for building a route in the trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal path segment without the leading slash.
    Literal(String),
    /// Capturing variable. Bare `*` and `**` segments are variables with an
    /// empty field path whose capture is discarded.
    Variable(VariableSpec),
}

/// A variable's field path and the token pattern it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub field_path: Vec<String>,
    pub pattern: Arc<[Token]>,
}

impl VariableSpec {
    /// Dotted field path, empty for anonymous wildcards.
    pub fn name(&self) -> String {
        self.field_path.join(".")
    }

    /// Textual form of the pattern, e.g. `shelves/*`.
    pub fn pattern_text(&self) -> String {
        self.pattern.iter().map(|t| t.val.as_str()).collect()
    }
}

/// Parsed path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub segments: Vec<Segment>,
    pub verb: Option<String>,
}

/// Lex and parse a template string.
pub fn parse(template: &str) -> Result<Template, LexError> {
    let tokens = lex(template)?;
    Parser {
        template,
        tokens: &tokens,
        pos: 0,
    }
    .parse()
}

struct Parser<'a> {
    template: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse(mut self) -> Result<Template, LexError> {
        let mut segments = Vec::new();
        let mut verb = None;

        loop {
            let token = self.next();
            match token.kind {
                TokenKind::Slash => segments.push(self.segment()?),
                TokenKind::Verb => {
                    let value = self.expect(TokenKind::Value)?;
                    verb = Some(value.val.clone());
                }
                TokenKind::Eof => break,
                kind => return Err(self.error(&format!("unexpected {kind}"))),
            }
        }
        Ok(Template { segments, verb })
    }

    fn segment(&mut self) -> Result<Segment, LexError> {
        let token = self.next();
        match token.kind {
            TokenKind::Value => Ok(Segment::Literal(token.val.clone())),
            TokenKind::Star | TokenKind::StarStar => Ok(Segment::Variable(VariableSpec {
                field_path: Vec::new(),
                pattern: Arc::from(vec![token.clone()]),
            })),
            TokenKind::VariableStart => self.variable(),
            kind => Err(self.error(&format!("unexpected {kind}"))),
        }
    }

    fn variable(&mut self) -> Result<Segment, LexError> {
        let mut field_path = vec![self.expect(TokenKind::Value)?.val.clone()];
        let mut pattern = Vec::new();
        loop {
            let token = self.next();
            match token.kind {
                TokenKind::Dot => field_path.push(self.expect(TokenKind::Value)?.val.clone()),
                TokenKind::Equal => {
                    loop {
                        let token = self.next();
                        match token.kind {
                            TokenKind::Slash
                            | TokenKind::Star
                            | TokenKind::StarStar
                            | TokenKind::Value => pattern.push(token.clone()),
                            TokenKind::VariableEnd => break,
                            kind => return Err(self.error(&format!("unexpected {kind}"))),
                        }
                    }
                    break;
                }
                TokenKind::VariableEnd => break,
                kind => return Err(self.error(&format!("unexpected {kind}"))),
            }
        }
        if pattern.is_empty() {
            pattern.push(Token {
                kind: TokenKind::Star,
                val: "*".to_string(),
            });
        }
        Ok(Segment::Variable(VariableSpec {
            field_path,
            pattern: Arc::from(pattern),
        }))
    }

    fn next(&mut self) -> &'a Token {
        let tokens = self.tokens;
        let token = &tokens[self.pos.min(tokens.len() - 1)];
        self.pos += 1;
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&'a Token, LexError> {
        let token = self.next();
        if token.kind != kind {
            return Err(self.error(&format!("expected {kind}, found {}", token.kind)));
        }
        Ok(token)
    }

    fn error(&self, msg: &str) -> LexError {
        let pos = self.tokens[..self.pos.min(self.tokens.len())]
            .iter()
            .map(|t| t.val.len())
            .sum();
        LexError {
            template: self.template.to_string(),
            pos,
            msg: msg.to_string(),
        }
    }
}

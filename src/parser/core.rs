//! Core parser struct and helper methods.

use crate::ast::{Chunk, Name, NodeId, NodeIdGen};
use crate::error::ParserError;
use crate::lexer::{Token, TokenKind};
use crate::span::Span;

pub type ParseResult<T> = Result<T, ParserError>;

/// Maximum syntactic nesting before the parser fails closed instead of
/// risking stack exhaustion on pathological input.
pub(crate) const MAX_DEPTH: usize = 200;

/// The parser. Consumes the token stream, produces the AST, and performs
/// syntax validation only; names are bound later by the resolver.
pub struct Parser {
    pub(crate) tokens: Vec<Token>,
    pub(crate) current: usize,
    pub(crate) ids: NodeIdGen,
    pub(crate) depth: usize,
    /// Whether `...` is legal at the current nesting; the chunk itself is a
    /// vararg function.
    pub(crate) vararg_ok: Vec<bool>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            ids: NodeIdGen::new(),
            depth: 0,
            vararg_ok: vec![true],
        }
    }

    /// Parse a complete chunk.
    pub fn parse(&mut self) -> ParseResult<Chunk> {
        let block = self.parse_block()?;
        if !self.is_at_end() {
            return Err(ParserError::unexpected_token(
                "a statement",
                format!("{}", self.peek().kind),
                self.current_span(),
            ));
        }
        Ok(Chunk {
            block,
            id_bound: self.ids.bound(),
        })
    }

    // ===== Token manipulation =====

    pub(crate) fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens[self.current - 1].clone()
    }

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    pub(crate) fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        if self.is_at_end() {
            *kind == TokenKind::Eof
        } else {
            std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
        }
    }

    pub(crate) fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: &TokenKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else if self.is_at_end() {
            Err(ParserError::unexpected_eof(self.current_span()))
        } else {
            Err(ParserError::unexpected_token(
                format!("'{}'", kind),
                format!("{}", self.peek().kind),
                self.current_span(),
            ))
        }
    }

    pub(crate) fn expect_name(&mut self) -> ParseResult<Name> {
        match &self.peek().kind {
            TokenKind::Identifier(text) => {
                let text = text.clone();
                let span = self.current_span();
                self.advance();
                Ok(Name::new(text, self.node_id(), span))
            }
            TokenKind::Eof => Err(ParserError::unexpected_eof(self.current_span())),
            other => Err(ParserError::unexpected_token(
                "a name",
                format!("{}", other),
                self.current_span(),
            )),
        }
    }

    pub(crate) fn node_id(&mut self) -> NodeId {
        self.ids.fresh()
    }

    pub(crate) fn current_span(&self) -> Span {
        self.peek().span
    }

    pub(crate) fn previous_span(&self) -> Span {
        self.previous().span
    }

    pub(crate) fn enter_nested(&mut self) -> ParseResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParserError::TooDeep(self.current_span()));
        }
        Ok(())
    }

    pub(crate) fn exit_nested(&mut self) {
        self.depth -= 1;
    }
}

//! Error types for all pipeline stages.

use crate::span::Span;
use thiserror::Error;

/// Lexer errors.
#[derive(Debug, Error)]
pub enum LexerError {
    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, Span),

    #[error("Unterminated string at {0}")]
    UnterminatedString(Span),

    #[error("Unterminated long comment at {0}")]
    UnterminatedComment(Span),

    #[error("Invalid escape sequence '\\{0}' at {1}")]
    InvalidEscape(char, Span),

    #[error("Invalid number '{0}' at {1}")]
    InvalidNumber(String, Span),
}

impl LexerError {
    pub fn unexpected_char(c: char, span: Span) -> Self {
        Self::UnexpectedChar(c, span)
    }

    pub fn unterminated_string(span: Span) -> Self {
        Self::UnterminatedString(span)
    }

    pub fn invalid_escape(c: char, span: Span) -> Self {
        Self::InvalidEscape(c, span)
    }

    pub fn invalid_number(s: impl Into<String>, span: Span) -> Self {
        Self::InvalidNumber(s.into(), span)
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedChar(_, span) => *span,
            Self::UnterminatedString(span) => *span,
            Self::UnterminatedComment(span) => *span,
            Self::InvalidEscape(_, span) => *span,
            Self::InvalidNumber(_, span) => *span,
        }
    }
}

/// Parser errors. The parser never recovers; the first error aborts the build.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("Unexpected token '{found}', expected {expected} at {span}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("Expected an expression, found '{found}' at {span}")]
    ExpectedExpression { found: String, span: Span },

    #[error("Unexpected end of file at {0}")]
    UnexpectedEof(Span),

    #[error("Nesting too deep at {0}")]
    TooDeep(Span),
}

impl ParserError {
    pub fn unexpected_token(
        expected: impl Into<String>,
        found: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::UnexpectedToken {
            expected: expected.into(),
            found: found.into(),
            span,
        }
    }

    pub fn expected_expression(found: impl Into<String>, span: Span) -> Self {
        Self::ExpectedExpression {
            found: found.into(),
            span,
        }
    }

    pub fn unexpected_eof(span: Span) -> Self {
        Self::UnexpectedEof(span)
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedToken { span, .. } => *span,
            Self::ExpectedExpression { span, .. } => *span,
            Self::UnexpectedEof(span) => *span,
            Self::TooDeep(span) => *span,
        }
    }
}

/// Scope resolution errors. Bounds come from the instruction encoding:
/// registers are u8-indexed, so a function keeps at most 200 named locals
/// and leaves the rest of the register file for temporaries.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Too many local variables in function (limit {limit}) at {span}")]
    TooManyLocals { limit: usize, span: Span },

    #[error("Too many upvalues in function (limit {limit}) at {span}")]
    TooManyUpvalues { limit: usize, span: Span },

    #[error("'break' outside of a loop at {0}")]
    BreakOutsideLoop(Span),
}

impl ResolveError {
    pub fn span(&self) -> Span {
        match self {
            Self::TooManyLocals { span, .. } => *span,
            Self::TooManyUpvalues { span, .. } => *span,
            Self::BreakOutsideLoop(span) => *span,
        }
    }
}

/// Transform pass errors: a pass detected that a rewrite precondition cannot
/// be established and refuses to produce output of uncertain semantics.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("String encryption: decrypt routine would not dominate first use at {0}")]
    DecryptOrdering(Span),

    #[error("Control-flow flattening: dispatch table exceeds {limit} states at {span}")]
    TooManyStates { limit: usize, span: Span },
}

impl TransformError {
    pub fn span(&self) -> Span {
        match self {
            Self::DecryptOrdering(span) => *span,
            Self::TooManyStates { span, .. } => *span,
        }
    }
}

/// Bytecode compilation errors. These signal internal invariant violations:
/// a resolved AST always has a lowering, so hitting one is a bug upstream,
/// not bad user input.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Internal compiler error: {detail} at {span}")]
    Internal { detail: String, span: Span },
}

impl CompileError {
    pub fn internal(detail: impl Into<String>, span: Span) -> Self {
        Self::Internal {
            detail: detail.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::Internal { span, .. } => *span,
        }
    }
}

/// Bytecode packing errors: serialization bounds exceeded or, on the read
/// side, a payload the loader cannot accept.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("Constant pool overflow: {count} constants (limit {limit})")]
    ConstantPoolOverflow { count: usize, limit: usize },

    #[error("Code section overflow: {count} instructions (limit {limit})")]
    CodeOverflow { count: usize, limit: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unsupported payload version {0}")]
    BadVersion(u8),
}

/// A unified error type covering the whole pipeline.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    #[error("Lexer error: {0}")]
    Lexer(#[from] LexerError),

    #[error("Parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Pack error: {0}")]
    Pack(#[from] PackError),
}

impl ObfuscateError {
    /// Name of the stage that failed, for logs and exit codes.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Lexer(_) => "lexer",
            Self::Parser(_) => "parser",
            Self::Resolve(_) => "resolver",
            Self::Transform(_) => "transform",
            Self::Compile(_) => "compiler",
            Self::Pack(_) => "packer",
        }
    }

    /// A caller-facing message with positions but without source snippets
    /// or any build-secret material.
    pub fn public_message(&self) -> String {
        match self {
            Self::Compile(_) => "internal compiler error".to_string(),
            other => other.to_string(),
        }
    }
}

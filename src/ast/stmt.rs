//! Statement nodes.

use crate::ast::expr::Expr;
use crate::ast::NodeId;
use crate::span::Span;

/// A whole source file: the implicit vararg main function.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub block: Block,
    /// Exclusive upper bound of all `NodeId`s in the tree, so passes that
    /// synthesize nodes can keep ids unique.
    pub id_bound: u32,
}

/// A sequence of statements sharing one lexical scope.
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    pub fn empty() -> Self {
        Self { stmts: Vec::new() }
    }
}

/// A declared or referenced name with its node identity.
#[derive(Debug, Clone)]
pub struct Name {
    pub text: String,
    pub id: NodeId,
    pub span: Span,
}

impl Name {
    pub fn new(text: impl Into<String>, id: NodeId, span: Span) -> Self {
        Self {
            text: text.into(),
            id,
            span,
        }
    }
}

/// Target of a `function` statement: `a.b.c` path plus optional `:method`.
#[derive(Debug, Clone)]
pub struct FuncName {
    pub base: Name,
    pub path: Vec<String>,
    pub method: Option<String>,
}

/// A function literal body, shared by declarations and expressions.
#[derive(Debug, Clone)]
pub struct FuncBody {
    pub params: Vec<Name>,
    pub is_vararg: bool,
    pub body: Block,
    /// Identity of the function itself (per-function resolver tables).
    pub id: NodeId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// A function or method call in statement position.
    Expr(Expr),

    /// `local a, b = e1, e2`
    Local { names: Vec<Name>, exprs: Vec<Expr> },

    /// `a, t[k] = e1, e2` — targets are Name or Index expressions.
    Assign { targets: Vec<Expr>, values: Vec<Expr> },

    /// `if c1 then b1 elseif c2 then b2 ... else be end`
    If {
        arms: Vec<(Expr, Block)>,
        else_block: Option<Block>,
    },

    /// `while c do b end`
    While { cond: Expr, body: Block },

    /// `repeat b until c` — the condition sees the body's locals.
    Repeat { body: Block, cond: Expr },

    /// `for v = start, limit [, step] do b end`
    NumericFor {
        var: Name,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },

    /// `for v1, v2 in e1, e2 do b end`
    GenericFor {
        vars: Vec<Name>,
        exprs: Vec<Expr>,
        body: Block,
    },

    /// `function a.b:c(...) ... end`
    FunctionDecl { name: FuncName, body: FuncBody },

    /// `local function f(...) ... end` — `f` is in scope inside the body.
    LocalFunction { name: Name, body: FuncBody },

    /// `return e1, e2` — always the last statement of a block.
    Return { exprs: Vec<Expr> },

    Break,

    /// `do b end`
    Do(Block),
}

//! Expression nodes.

use crate::ast::stmt::FuncBody;
use crate::ast::NodeId;
use crate::span::Span;

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    pub id: NodeId,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span, id: NodeId) -> Self {
        Self { kind, span, id }
    }

    /// True for calls and `...`, the only expressions that can expand to
    /// multiple values in tail position.
    pub fn is_multi_valued(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } | ExprKind::Vararg
        )
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Nil,
    True,
    False,
    Number(f64),
    /// Byte string: Lua string literals may hold arbitrary bytes.
    Str(Vec<u8>),
    /// `...`
    Vararg,

    /// A function literal.
    Function(FuncBody),

    /// An identifier reference; binding is resolved via `self.id`.
    Name(String),

    /// `obj[key]`; `obj.k` parses as `obj["k"]`.
    Index { obj: Box<Expr>, key: Box<Expr> },

    /// `f(args)`
    Call { func: Box<Expr>, args: Vec<Expr> },

    /// `obj:name(args)` — obj evaluated once.
    MethodCall {
        obj: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    /// `{ a, [k] = v, name = v }`
    Table { items: Vec<TableItem> },

    /// `(e)` — truncates a multi-valued expression to one value.
    Paren(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum TableItem {
    /// Positional entry, appended to the array part.
    Item(Expr),
    /// `name = value`
    Named(String, Expr),
    /// `[key] = value`
    Keyed(Expr, Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Len,
}

impl BinaryOp {
    /// (left, right) binding powers, Lua 5.1 table. `^` and `..` are
    /// right-associative: their right power is below their left.
    pub fn binding_power(self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 2),
            BinaryOp::And => (3, 4),
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Less
            | BinaryOp::LessEq
            | BinaryOp::Greater
            | BinaryOp::GreaterEq => (5, 6),
            BinaryOp::Concat => (10, 9),
            BinaryOp::Add | BinaryOp::Sub => (11, 12),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => (13, 14),
            BinaryOp::Pow => (18, 17),
        }
    }

    /// Binding power of unary operators: between `*` and `^`.
    pub const UNARY_POWER: u8 = 15;
}

//! Abstract syntax tree for the Lua baseline grammar.

pub mod expr;
pub mod stmt;

pub use expr::{BinaryOp, Expr, ExprKind, TableItem, UnaryOp};
pub use stmt::{Block, Chunk, FuncBody, FuncName, Name, Stmt, StmtKind};

/// A stable identity for an AST node, assigned at parse time.
///
/// Cross-cutting results (symbol bindings, capture info) live in side tables
/// keyed by `NodeId` instead of pointers between distant nodes, so the tree
/// stays an ownership tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Id used by synthesized nodes before re-resolution assigns real ones.
    pub const SYNTHETIC: NodeId = NodeId(u32::MAX);
}

/// Hands out fresh `NodeId`s; one per parse or per rewrite pass.
#[derive(Debug, Default)]
pub struct NodeIdGen {
    next: u32,
}

impl NodeIdGen {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Start above an existing chunk's ids, for passes that add nodes.
    pub fn starting_after(chunk: &Chunk) -> Self {
        Self {
            next: chunk.id_bound,
        }
    }

    pub fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    pub fn bound(&self) -> u32 {
        self.next
    }
}

//! Bytecode representation and the AST-to-bytecode compiler.

pub mod compiler;
pub mod compiler_exprs;
pub mod compiler_stmts;
pub mod disassembler;
pub mod instruction;
pub mod proto;

pub use compiler::Compiler;
pub use disassembler::disassemble;
pub use instruction::{Instruction, OpCode, MULTI};
pub use proto::{Constant, FunctionProto, UpvalueDescriptor};

//! Luaveil: a Lua obfuscator.
//!
//! Compiles a plaintext Lua script into a custom bytecode format executed
//! by an embedded interpreter, with optional string encryption and
//! control-flow flattening layered on top. The result is a single
//! self-contained Lua script that reproduces the input's behavior.
//!
//! # Pipeline
//!
//! text → tokens → AST → resolved AST → transformed AST → prototype tree →
//! packed bytes → output script. Each stage owns its output until hand-off,
//! fails fast with a typed error, and never shares state across concurrent
//! invocations.
//!
//! ```no_run
//! let options = luaveil::ObfuscationOptions::default();
//! let script = luaveil::obfuscate("print('hi')", &options).unwrap();
//! ```

pub mod ast;
pub mod bytecode;
pub mod emit;
pub mod error;
pub mod lexer;
pub mod pack;
pub mod parser;
pub mod pipeline;
pub mod resolve;
pub mod span;
pub mod transform;
pub mod vm;

pub use error::ObfuscateError;
pub use pipeline::{obfuscate, ObfuscationOptions};

/// Parse source into an AST without compiling.
pub fn parse(source: &str) -> Result<ast::Chunk, ObfuscateError> {
    let tokens = lexer::Scanner::new(source).scan_tokens()?;
    let chunk = parser::Parser::new(tokens).parse()?;
    Ok(chunk)
}

/// Compile source to a prototype tree without transforms or packing.
pub fn compile(source: &str) -> Result<bytecode::FunctionProto, ObfuscateError> {
    pipeline::compile_source(source)
}

/// Render a prototype tree as human-readable disassembly.
pub fn disassemble(proto: &bytecode::FunctionProto) -> String {
    bytecode::disassemble(proto)
}

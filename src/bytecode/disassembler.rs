//! Human-readable prototype dumps, for debugging builds.

use std::fmt::Write;

use crate::bytecode::instruction::OpCode;
use crate::bytecode::proto::{Constant, FunctionProto};

/// Render a prototype tree as text.
pub fn disassemble(proto: &FunctionProto) -> String {
    let mut out = String::new();
    disassemble_into(proto, "main", 0, &mut out);
    out
}

fn disassemble_into(proto: &FunctionProto, name: &str, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(
        out,
        "{}function {} (params {}, vararg {}, stack {}, upvalues {})",
        indent,
        name,
        proto.num_params,
        proto.is_vararg,
        proto.max_stack,
        proto.upvalues.len()
    );

    for (i, constant) in proto.constants.iter().enumerate() {
        let _ = writeln!(out, "{}  K{} = {}", indent, i, render_constant(constant));
    }

    for (pc, instr) in proto.code.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}  {:04} {:<10} {:>3} {:>5} {:>5}",
            indent,
            pc,
            opcode_name(instr.op),
            instr.a,
            instr.b,
            instr.c
        );
    }

    for (i, nested) in proto.protos.iter().enumerate() {
        disassemble_into(nested, &format!("{}[{}]", name, i), depth + 1, out);
    }
}

fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::Nil => "nil".to_string(),
        Constant::Bool(b) => b.to_string(),
        Constant::Number(n) => n.to_string(),
        Constant::Str(bytes) => format!("\"{}\"", String::from_utf8_lossy(bytes)),
    }
}

fn opcode_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Move => "MOVE",
        OpCode::LoadK => "LOADK",
        OpCode::LoadBool => "LOADBOOL",
        OpCode::LoadNil => "LOADNIL",
        OpCode::GetGlobal => "GETGLOBAL",
        OpCode::SetGlobal => "SETGLOBAL",
        OpCode::GetUpval => "GETUPVAL",
        OpCode::SetUpval => "SETUPVAL",
        OpCode::GetIndex => "GETINDEX",
        OpCode::SetIndex => "SETINDEX",
        OpCode::NewTable => "NEWTABLE",
        OpCode::SelfIndex => "SELF",
        OpCode::Add => "ADD",
        OpCode::Sub => "SUB",
        OpCode::Mul => "MUL",
        OpCode::Div => "DIV",
        OpCode::Mod => "MOD",
        OpCode::Pow => "POW",
        OpCode::Concat => "CONCAT",
        OpCode::Unm => "UNM",
        OpCode::Not => "NOT",
        OpCode::Len => "LEN",
        OpCode::Eq => "EQ",
        OpCode::Lt => "LT",
        OpCode::Le => "LE",
        OpCode::Jmp => "JMP",
        OpCode::Test => "TEST",
        OpCode::Call => "CALL",
        OpCode::Return => "RETURN",
        OpCode::Vararg => "VARARG",
        OpCode::Closure => "CLOSURE",
        OpCode::Close => "CLOSE",
        OpCode::ForPrep => "FORPREP",
        OpCode::ForLoop => "FORLOOP",
        OpCode::TForLoop => "TFORLOOP",
        OpCode::SetList => "SETLIST",
    }
}

//! Payload serialization.

use crate::bytecode::{Constant, FunctionProto};
use crate::error::PackError;
use crate::pack::{MAGIC, MAX_CODE, MAX_CONSTANTS, VERSION};

/// Serialize a prototype tree with no encryption flag.
pub fn pack(proto: &FunctionProto) -> Result<Vec<u8>, PackError> {
    pack_flags(proto, 0)
}

pub(crate) fn pack_flags(proto: &FunctionProto, flags: u8) -> Result<Vec<u8>, PackError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(flags);
    write_proto(&mut out, proto)?;
    Ok(out)
}

fn write_proto(out: &mut Vec<u8>, proto: &FunctionProto) -> Result<(), PackError> {
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    out.push(proto.max_stack);

    out.push(proto.upvalues.len() as u8);
    for upvalue in &proto.upvalues {
        out.push(upvalue.is_local as u8);
        out.push(upvalue.index);
    }

    if proto.constants.len() > MAX_CONSTANTS {
        return Err(PackError::ConstantPoolOverflow {
            count: proto.constants.len(),
            limit: MAX_CONSTANTS,
        });
    }
    write_u32(out, proto.constants.len() as u32);
    for constant in &proto.constants {
        write_constant(out, constant);
    }

    if proto.code.len() > MAX_CODE {
        return Err(PackError::CodeOverflow {
            count: proto.code.len(),
            limit: MAX_CODE,
        });
    }
    write_u32(out, proto.code.len() as u32);
    for instr in &proto.code {
        out.push(instr.op as u8);
        out.push(instr.a);
        write_u32(out, instr.b);
        write_u32(out, instr.c);
    }

    write_u32(out, proto.protos.len() as u32);
    for nested in &proto.protos {
        write_proto(out, nested)?;
    }
    Ok(())
}

fn write_constant(out: &mut Vec<u8>, constant: &Constant) {
    match constant {
        Constant::Nil => out.push(0),
        Constant::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        Constant::Number(n) => {
            out.push(2);
            out.extend_from_slice(&n.to_bits().to_le_bytes());
        }
        Constant::Str(bytes) => {
            out.push(3);
            write_u32(out, bytes.len() as u32);
            out.extend_from_slice(bytes);
        }
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

//! Payload deserialization: the loader half of the pack round-trip. The
//! emitted interpreter carries the same logic in Lua; the two must agree
//! byte for byte.

use crate::bytecode::{Constant, FunctionProto, Instruction, OpCode, UpvalueDescriptor};
use crate::error::PackError;
use crate::pack::{MAGIC, VERSION};

/// Deserialize a packed (unencrypted) payload back into a prototype tree.
pub fn unpack(bytes: &[u8]) -> Result<FunctionProto, PackError> {
    let mut reader = Reader { bytes, pos: 0 };

    let magic = reader.take(4)?;
    if magic != MAGIC {
        return Err(PackError::Malformed("bad magic".into()));
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(PackError::BadVersion(version));
    }
    let _flags = reader.u8()?;

    let proto = read_proto(&mut reader)?;
    if reader.pos != bytes.len() {
        return Err(PackError::Malformed("trailing bytes after payload".into()));
    }
    Ok(proto)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PackError> {
        if self.pos + n > self.bytes.len() {
            return Err(PackError::Malformed("unexpected end of payload".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PackError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PackError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f64(&mut self) -> Result<f64, PackError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_le_bytes(buf)))
    }
}

fn read_proto(reader: &mut Reader) -> Result<FunctionProto, PackError> {
    let num_params = reader.u8()?;
    let is_vararg = reader.u8()? != 0;
    let max_stack = reader.u8()?;

    let upvalue_count = reader.u8()?;
    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
    for _ in 0..upvalue_count {
        let is_local = reader.u8()? != 0;
        let index = reader.u8()?;
        upvalues.push(UpvalueDescriptor { is_local, index });
    }

    let constant_count = reader.u32()?;
    let mut constants = Vec::with_capacity(constant_count.min(1 << 16) as usize);
    for _ in 0..constant_count {
        constants.push(read_constant(reader)?);
    }

    let code_count = reader.u32()?;
    let mut code = Vec::with_capacity(code_count.min(1 << 16) as usize);
    for _ in 0..code_count {
        let op_byte = reader.u8()?;
        let op = OpCode::from_u8(op_byte)
            .ok_or_else(|| PackError::Malformed(format!("unknown opcode {}", op_byte)))?;
        let a = reader.u8()?;
        let b = reader.u32()?;
        let c = reader.u32()?;
        code.push(Instruction::new(op, a, b, c));
    }

    let proto_count = reader.u32()?;
    let mut protos = Vec::with_capacity(proto_count.min(1 << 10) as usize);
    for _ in 0..proto_count {
        protos.push(read_proto(reader)?);
    }

    Ok(FunctionProto {
        num_params,
        is_vararg,
        max_stack,
        upvalues,
        constants,
        code,
        protos,
    })
}

fn read_constant(reader: &mut Reader) -> Result<Constant, PackError> {
    match reader.u8()? {
        0 => Ok(Constant::Nil),
        1 => Ok(Constant::Bool(reader.u8()? != 0)),
        2 => Ok(Constant::Number(reader.f64()?)),
        3 => {
            let len = reader.u32()? as usize;
            Ok(Constant::Str(reader.take(len)?.to_vec()))
        }
        tag => Err(PackError::Malformed(format!("unknown constant tag {}", tag))),
    }
}

//! Bytecode packing: a deterministic binary layout for the prototype tree,
//! optionally enciphered with a per-build keystream.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! magic "LVBC" | version u8 | flags u8
//! proto:
//!   num_params u8 | is_vararg u8 | max_stack u8
//!   upvalue count u8 | (is_local u8, index u8)*
//!   constant count u32 | tagged constants
//!   code count u32 | (op u8, a u8, b u32, c u32)*
//!   proto count u32 | nested protos
//! ```
//!
//! Constant tags: 0 nil, 1 bool (+u8), 2 number (+f64 bits), 3 string
//! (+u32 length +bytes). When the encrypted flag is set, every byte after
//! the 6-byte header is enciphered with the additive keystream in
//! [`cipher`]; the loader in the emitted script reverses it with the seed
//! embedded alongside the payload.

pub mod cipher;
mod reader;
mod writer;

use crate::bytecode::FunctionProto;
use crate::error::PackError;

pub use reader::unpack;
pub use writer::pack;

pub const MAGIC: &[u8; 4] = b"LVBC";
pub const VERSION: u8 = 1;

pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Section bounds; exceeding one is a `PackError`, not a silent wrap.
pub const MAX_CONSTANTS: usize = u32::MAX as usize;
pub const MAX_CODE: usize = u32::MAX as usize;

/// Pack then encrypt with the given keystream seed.
pub fn pack_encrypted(proto: &FunctionProto, seed: u32) -> Result<Vec<u8>, PackError> {
    let mut bytes = pack_with_flags(proto, FLAG_ENCRYPTED)?;
    cipher::apply_keystream(&mut bytes[6..], seed);
    Ok(bytes)
}

/// Decrypt then unpack; the inverse of [`pack_encrypted`].
pub fn unpack_encrypted(bytes: &[u8], seed: u32) -> Result<FunctionProto, PackError> {
    if bytes.len() < 6 {
        return Err(PackError::Malformed("payload shorter than header".into()));
    }
    let mut plain = bytes.to_vec();
    cipher::remove_keystream(&mut plain[6..], seed);
    unpack(&plain)
}

pub(crate) fn pack_with_flags(proto: &FunctionProto, flags: u8) -> Result<Vec<u8>, PackError> {
    writer::pack_flags(proto, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, FunctionProto, Instruction, OpCode, UpvalueDescriptor};
    use pretty_assertions::assert_eq;

    fn sample_proto() -> FunctionProto {
        let mut inner = FunctionProto::new(1, false);
        inner.max_stack = 4;
        inner.upvalues.push(UpvalueDescriptor {
            is_local: true,
            index: 0,
        });
        inner.constants.push(Constant::Number(42.5));
        inner
            .code
            .push(Instruction::new(OpCode::GetUpval, 1, 0, 0));
        inner.code.push(Instruction::ab(OpCode::Return, 1, 2));

        let mut root = FunctionProto::new(0, true);
        root.max_stack = 8;
        root.constants.push(Constant::Nil);
        root.constants.push(Constant::Bool(true));
        root.constants.push(Constant::Number(-0.0));
        root.constants.push(Constant::Str(b"hello\0world".to_vec()));
        root.code.push(Instruction::ab(OpCode::Closure, 0, 0));
        root.code.push(Instruction::new(OpCode::Call, 0, 1, 1));
        root.code.push(Instruction::ab(OpCode::Return, 0, 1));
        root.protos.push(inner);
        root
    }

    #[test]
    fn roundtrip_plain() {
        let proto = sample_proto();
        let bytes = pack(&proto).unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        let back = unpack(&bytes).unwrap();
        assert_eq!(proto, back);
    }

    #[test]
    fn roundtrip_encrypted() {
        let proto = sample_proto();
        let bytes = pack_encrypted(&proto, 0xDEAD_BEEF).unwrap();
        let back = unpack_encrypted(&bytes, 0xDEAD_BEEF).unwrap();
        assert_eq!(proto, back);
    }

    #[test]
    fn encrypted_payload_differs_from_plain() {
        let proto = sample_proto();
        let plain = pack(&proto).unwrap();
        let enc = pack_encrypted(&proto, 7).unwrap();
        assert_eq!(plain.len(), enc.len());
        assert_ne!(plain[6..], enc[6..]);
    }

    #[test]
    fn wrong_seed_fails_to_load() {
        let proto = sample_proto();
        let bytes = pack_encrypted(&proto, 1234).unwrap();
        let result = unpack_encrypted(&bytes, 4321);
        // Either a hard parse failure or (vanishingly unlikely here) a
        // different tree; both count as not-loading-the-original.
        match result {
            Err(_) => {}
            Ok(back) => assert_ne!(proto, back),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let proto = sample_proto();
        let mut bytes = pack(&proto).unwrap();
        bytes[0] = b'X';
        assert!(matches!(unpack(&bytes), Err(PackError::Malformed(_))));
    }

    #[test]
    fn bad_version_rejected() {
        let proto = sample_proto();
        let mut bytes = pack(&proto).unwrap();
        bytes[4] = VERSION + 1;
        assert!(matches!(unpack(&bytes), Err(PackError::BadVersion(_))));
    }

    #[test]
    fn truncated_payload_rejected() {
        let proto = sample_proto();
        let bytes = pack(&proto).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(unpack(truncated), Err(PackError::Malformed(_))));
    }

    #[test]
    fn nan_constant_roundtrips_bitwise() {
        let mut proto = FunctionProto::new(0, true);
        proto.constants.push(Constant::Number(f64::NAN));
        proto.code.push(Instruction::ab(OpCode::Return, 0, 1));
        let back = unpack(&pack(&proto).unwrap()).unwrap();
        match back.constants[0] {
            Constant::Number(n) => assert!(n.is_nan()),
            _ => panic!("expected number"),
        }
    }
}

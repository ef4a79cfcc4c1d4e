//! x86-64 instruction decoder.
//!
//! Turns a byte window into a structured [`Instruction`] record: prefixes,
//! REX, a widened opcode value, ModRM/SIB, displacement, immediate, and the
//! total encoded length. The decoder is a pure function of the bytes it is
//! given; all reads are bounds-checked and short windows surface as
//! [`DecodeError::UnexpectedEof`], never as out-of-range access.

mod decoder;
mod inst;
mod opcode_tables;

pub use decoder::{decode, DecodeError, MAX_INST_LEN};
pub use inst::{
    Instruction, MemoryRef, ModRm, OperandSize, Prefixes, RepPrefix, RexPrefix, SegmentReg, Sib,
};
pub use opcode_tables::{classify, has_modrm, immediate_size, InstClass};

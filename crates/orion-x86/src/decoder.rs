use crate::inst::{Instruction, ModRm, Prefixes, RepPrefix, RexPrefix, SegmentReg, Sib};
use crate::opcode_tables;

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INST_LEN: usize = 15;

/// Decoder error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte window ended before the instruction could be fully decoded.
    UnexpectedEof,
    /// The decoded instruction exceeds the architectural 15-byte length limit.
    TooLong,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of instruction bytes"),
            Self::TooLong => write!(f, "instruction exceeds 15-byte length limit"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a single 64-bit-mode instruction from the start of `bytes`.
///
/// Callers pass a window of up to [`MAX_INST_LEN`] bytes fetched from the
/// instruction stream. The decode order is fixed: legacy prefixes, optional
/// REX, opcode (with 0x0F / 0x0F38 / 0x0F3A escapes), ModRM, SIB,
/// displacement, immediate.
pub fn decode(bytes: &[u8]) -> Result<Instruction, DecodeError> {
    let (prefixes, rex, mut idx) = scan_prefixes(bytes)?;

    let opcode = parse_opcode(bytes, &mut idx)?;

    let mut modrm = None;
    let mut sib = None;
    let mut disp = 0i32;

    if opcode_tables::has_modrm(opcode) {
        let m = ModRm(*bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?);
        idx += 1;
        modrm = Some(m);

        let mut disp_len = match m.mode() {
            1 => 1usize,
            2 => 4,
            0 if m.rm() == 5 => 4, // RIP-relative in 64-bit mode
            _ => 0,
        };

        if m.mode() != 3 && m.rm() == 4 {
            let s = Sib(*bytes.get(idx).ok_or(DecodeError::UnexpectedEof)?);
            idx += 1;
            sib = Some(s);
            // SIB with base=101 and mod=00 carries a disp32 of its own.
            if m.mode() == 0 && s.base() == 5 {
                disp_len = 4;
            }
        }

        disp = match disp_len {
            0 => 0,
            1 => *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)? as i8 as i32,
            4 => {
                let b = bytes
                    .get(idx..idx + 4)
                    .ok_or(DecodeError::UnexpectedEof)?;
                i32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }
            _ => unreachable!(),
        };
        idx += disp_len;
    }

    let imm_len = opcode_tables::immediate_size(opcode, modrm, rex, prefixes);
    let imm = match imm_len {
        0 => 0u64,
        1 => *bytes.get(idx).ok_or(DecodeError::UnexpectedEof)? as u64,
        2 => {
            let b = bytes.get(idx..idx + 2).ok_or(DecodeError::UnexpectedEof)?;
            u16::from_le_bytes([b[0], b[1]]) as u64
        }
        4 => {
            let b = bytes.get(idx..idx + 4).ok_or(DecodeError::UnexpectedEof)?;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64
        }
        8 => {
            let b = bytes.get(idx..idx + 8).ok_or(DecodeError::UnexpectedEof)?;
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }
        _ => unreachable!(),
    };
    idx += imm_len;

    if idx > MAX_INST_LEN {
        return Err(DecodeError::TooLong);
    }

    Ok(Instruction {
        opcode,
        prefixes,
        rex,
        modrm,
        sib,
        disp,
        imm,
        len: idx as u8,
    })
}

fn scan_prefixes(bytes: &[u8]) -> Result<(Prefixes, Option<RexPrefix>, usize), DecodeError> {
    let mut idx = 0usize;
    let mut prefixes = Prefixes::default();
    let mut rex = None;

    // Prefixes are scanned in a single pass; the last prefix in each group
    // wins. A REX prefix only takes effect when it is the final prefix byte
    // before the opcode, so any legacy prefix after it clears it.
    while idx < bytes.len() && idx < MAX_INST_LEN {
        let b = bytes[idx];

        if (0x40..=0x4F).contains(&b) {
            rex = Some(RexPrefix {
                w: (b & 0b1000) != 0,
                r: (b & 0b0100) != 0,
                x: (b & 0b0010) != 0,
                b: (b & 0b0001) != 0,
            });
            idx += 1;
            continue;
        }

        if let Some(seg) = segment_override(b) {
            // In 64-bit mode only FS/GS have architectural effect; the others
            // are accepted but must not clear an earlier FS/GS override.
            if matches!(seg, SegmentReg::FS | SegmentReg::GS) {
                prefixes.segment = Some(seg);
            }
            rex = None;
            idx += 1;
            continue;
        }

        match b {
            0xF0 => {
                // LOCK and REP share a prefix group.
                prefixes.lock = true;
                prefixes.rep = None;
            }
            0xF2 => {
                prefixes.rep = Some(RepPrefix::Repne);
                prefixes.lock = false;
            }
            0xF3 => {
                prefixes.rep = Some(RepPrefix::Rep);
                prefixes.lock = false;
            }
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            _ => break,
        }
        rex = None;
        idx += 1;
    }

    if idx >= MAX_INST_LEN {
        // Consumed 15 bytes worth of prefixes; the opcode can't fit.
        return Err(DecodeError::TooLong);
    }
    if idx >= bytes.len() {
        return Err(DecodeError::UnexpectedEof);
    }

    Ok((prefixes, rex, idx))
}

fn parse_opcode(bytes: &[u8], idx: &mut usize) -> Result<u32, DecodeError> {
    let b0 = *bytes.get(*idx).ok_or(DecodeError::UnexpectedEof)?;
    *idx += 1;
    if b0 != 0x0F {
        return Ok(b0 as u32);
    }

    let b1 = *bytes.get(*idx).ok_or(DecodeError::UnexpectedEof)?;
    *idx += 1;
    match b1 {
        0x38 => {
            let b2 = *bytes.get(*idx).ok_or(DecodeError::UnexpectedEof)?;
            *idx += 1;
            Ok(0x0F3800 | b2 as u32)
        }
        0x3A => {
            let b2 = *bytes.get(*idx).ok_or(DecodeError::UnexpectedEof)?;
            *idx += 1;
            Ok(0x0F3A00 | b2 as u32)
        }
        _ => Ok(0x0F00 | b1 as u32),
    }
}

fn segment_override(b: u8) -> Option<SegmentReg> {
    match b {
        0x26 => Some(SegmentReg::ES),
        0x2E => Some(SegmentReg::CS),
        0x36 => Some(SegmentReg::SS),
        0x3E => Some(SegmentReg::DS),
        0x64 => Some(SegmentReg::FS),
        0x65 => Some(SegmentReg::GS),
        _ => None,
    }
}

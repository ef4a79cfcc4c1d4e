use bitflags::bitflags;

use crate::inst::{Instruction, ModRm, Prefixes, RexPrefix};

bitflags! {
    /// Coarse instruction classification used for basic-block formation and
    /// JIT profiling. Derived from opcode bytes, not mnemonics.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct InstClass: u16 {
        const MEM_READ    = 1 << 0;
        const MEM_WRITE   = 1 << 1;
        const ARITH       = 1 << 2;
        const BRANCH      = 1 << 3;
        const COND_BRANCH = 1 << 4;
        const CALL        = 1 << 5;
        const RET         = 1 << 6;
        const STRING      = 1 << 7;
        const SIMD        = 1 << 8;
        const HALT        = 1 << 9;
    }
}

/// Whether an opcode carries a ModRM byte.
///
/// The default is "yes"; this table lists the forms that never do. Opcodes
/// are the widened 24-bit values (see [`crate::Instruction::opcode`]).
pub fn has_modrm(opcode: u32) -> bool {
    match opcode {
        // PUSH/POP r64, PUSH imm, MOV r, imm.
        0x50..=0x5F | 0x68 | 0x6A | 0xB0..=0xBF => false,
        // ALU A, imm accumulator forms.
        0x04 | 0x05 | 0x0C | 0x0D | 0x14 | 0x15 | 0x1C | 0x1D | 0x24 | 0x25 | 0x2C | 0x2D
        | 0x34 | 0x35 | 0x3C | 0x3D => false,
        // TEST A, imm.
        0xA8 | 0xA9 => false,
        // NOP, CWDE/CDQ, PUSHF/POPF, SAHF/LAHF.
        0x90..=0x9F => false,
        // MOV moffs forms and string operations.
        0xA0..=0xA7 | 0xAA..=0xAF => false,
        // RET / far RET / INT3 / INT imm8 / INTO / IRET.
        0xC2 | 0xC3 | 0xCA | 0xCB | 0xCC | 0xCD | 0xCE | 0xCF => false,
        // CALL rel32, JMP rel32/rel8, IN/OUT.
        0xE8 | 0xE9 | 0xEB | 0xE3 | 0xE4..=0xE7 | 0xEC..=0xEF => false,
        // Short conditional jumps, LOOP family.
        0x70..=0x7F | 0xE0..=0xE2 => false,
        // HLT, CMC, CLC/STC/CLI/STI/CLD/STD.
        0xF4 | 0xF5 | 0xF8..=0xFD | 0xF1 => false,
        // Two-byte map: SYSCALL, Jcc rel32, CPUID, RDTSC, PUSH/POP FS/GS.
        0x0F05 | 0x0F80..=0x0F8F | 0x0FA0 | 0x0FA1 | 0x0FA2 | 0x0FA8 | 0x0FA9 | 0x0F31 | 0x0F0B => {
            false
        }
        _ => true,
    }
}

/// Immediate width in bytes for an opcode, after ModRM has been consumed.
///
/// `modrm` matters only for the group opcodes where ModRM.reg selects the
/// form (0xF6/0xF7 TEST vs NOT/NEG/MUL/DIV).
pub fn immediate_size(
    opcode: u32,
    modrm: Option<ModRm>,
    rex: Option<RexPrefix>,
    prefixes: Prefixes,
) -> usize {
    let op16 = prefixes.operand_size_override && !rex.is_some_and(|r| r.w);
    let wide = if op16 { 2 } else { 4 };

    match opcode {
        // MOV r8, imm8 / MOV r, imm (8 bytes under REX.W).
        0xB0..=0xB7 => 1,
        0xB8..=0xBF => {
            if rex.is_some_and(|r| r.w) {
                8
            } else {
                wide
            }
        }
        // ALU/MOV/TEST r/m, imm forms.
        0x80 | 0x82 | 0x83 | 0x6A | 0x6B | 0xC0 | 0xC1 | 0xC6 => 1,
        0x81 | 0x69 | 0xC7 => wide,
        // Accumulator immediate forms.
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C | 0xA8 => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D | 0xA9 | 0x68 => wide,
        // Group 3: TEST r/m, imm only.
        0xF6 if matches!(modrm.map(ModRm::reg), Some(0 | 1)) => 1,
        0xF7 if matches!(modrm.map(ModRm::reg), Some(0 | 1)) => wide,
        // Relative branches.
        0x70..=0x7F | 0xEB | 0xE0..=0xE3 => 1,
        0xE8 | 0xE9 => 4,
        0x0F80..=0x0F8F => 4,
        // MOV moffs: 64-bit absolute address in 64-bit mode.
        0xA0..=0xA3 => 8,
        // INT imm8.
        0xCD => 1,
        // RET imm16.
        0xC2 | 0xCA => 2,
        // BT/BTS/BTR/BTC r/m, imm8.
        0x0FBA => 1,
        // IMUL-free three-byte maps carry imm8 in the 0F3A map.
        op if (0x0F3A00..=0x0F3AFF).contains(&op) => 1,
        _ => 0,
    }
}

/// Classify an instruction for block formation and JIT analysis.
pub fn classify(inst: &Instruction) -> InstClass {
    let mut class = InstClass::default();

    match inst.opcode {
        0xE8 => class |= InstClass::CALL,
        0xE9 | 0xEB => class |= InstClass::BRANCH,
        0x70..=0x7F | 0xE0..=0xE3 => class |= InstClass::COND_BRANCH,
        0x0F80..=0x0F8F => class |= InstClass::COND_BRANCH,
        0xC2 | 0xC3 | 0xCA | 0xCB | 0xCF => class |= InstClass::RET,
        0xFF => match inst.modrm.map(ModRm::reg) {
            Some(2 | 3) => class |= InstClass::CALL,
            Some(4 | 5) => class |= InstClass::BRANCH,
            _ => {}
        },
        0xA4..=0xA7 | 0xAA..=0xAF => class |= InstClass::STRING,
        0xF4 => class |= InstClass::HALT,
        _ => {}
    }

    if matches!(
        inst.opcode,
        0x00..=0x3D | 0x69 | 0x6B | 0x80..=0x83 | 0xC0 | 0xC1 | 0xD0..=0xD3
            | 0xF6 | 0xF7 | 0xFE | 0x0FAF
    ) {
        class |= InstClass::ARITH;
    }
    if inst.opcode == 0xFF && matches!(inst.modrm.map(ModRm::reg), Some(0 | 1)) {
        class |= InstClass::ARITH;
    }

    if matches!(inst.opcode, 0x0F10 | 0x0F11 | 0x0F28 | 0x0F29 | 0x0F6F | 0x0F7F | 0x0FEF | 0x0FFE)
    {
        class |= InstClass::SIMD;
    }

    if inst.has_memory_operand() {
        // Direction: even opcodes in the ALU/MOV groups write r/m, odd with
        // the 0x02 bit read it. Conservatively mark pure loads for the known
        // load-only forms and both for read-modify-write groups.
        match inst.opcode {
            0x88 | 0x89 | 0xC6 | 0xC7 | 0x0F11 | 0x0F29 | 0x0F7F => {
                class |= InstClass::MEM_WRITE
            }
            0x8A | 0x8B | 0x0FB6 | 0x0FB7 | 0x0FBE | 0x0FBF | 0x63 | 0x0F10 | 0x0F28 | 0x0F6F => {
                class |= InstClass::MEM_READ
            }
            0x8D => {} // LEA never touches memory
            0x38..=0x3B | 0x84 | 0x85 | 0x0FAF => class |= InstClass::MEM_READ,
            0x80..=0x83 | 0xC0 | 0xC1 | 0xD0..=0xD3 | 0xF6 | 0xF7 | 0xFE | 0xFF
            | 0x00..=0x35 => class |= InstClass::MEM_READ | InstClass::MEM_WRITE,
            _ => class |= InstClass::MEM_READ | InstClass::MEM_WRITE,
        }
    }
    if class.contains(InstClass::STRING) {
        class |= InstClass::MEM_READ;
        if !matches!(inst.opcode, 0xAC | 0xAD | 0xA6 | 0xA7 | 0xAE | 0xAF) {
            class |= InstClass::MEM_WRITE;
        }
    }
    // MOV moffs accesses memory without a ModRM operand.
    if matches!(inst.opcode, 0xA0 | 0xA1) {
        class |= InstClass::MEM_READ;
    }
    if matches!(inst.opcode, 0xA2 | 0xA3) {
        class |= InstClass::MEM_WRITE;
    }
    // PUSH/POP/CALL/RET implicitly access the stack.
    if matches!(inst.opcode, 0x50..=0x57 | 0x68 | 0x6A | 0xE8 | 0x9C) {
        class |= InstClass::MEM_WRITE;
    }
    if matches!(inst.opcode, 0x58..=0x5F | 0xC2 | 0xC3 | 0x9D | 0xCF) {
        class |= InstClass::MEM_READ;
    }

    class
}

/// Legacy segment-override prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentReg {
    ES,
    CS,
    SS,
    DS,
    FS,
    GS,
}

/// REP-group prefixes (0xF3 / 0xF2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repne,
}

/// Decoded REX prefix fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RexPrefix {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

/// Legacy prefixes accumulated during the prefix scan.
///
/// The last prefix in each group wins; LOCK and REP share a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: Option<RepPrefix>,
    pub segment: Option<SegmentReg>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
}

/// Effective operand width of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl OperandSize {
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            OperandSize::Bits8 => 1,
            OperandSize::Bits16 => 2,
            OperandSize::Bits32 => 4,
            OperandSize::Bits64 => 8,
        }
    }

    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            OperandSize::Bits8 => 0xFF,
            OperandSize::Bits16 => 0xFFFF,
            OperandSize::Bits32 => 0xFFFF_FFFF,
            OperandSize::Bits64 => u64::MAX,
        }
    }
}

/// ModRM byte accessor wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm(pub u8);

impl ModRm {
    #[inline]
    pub const fn mode(self) -> u8 {
        self.0 >> 6
    }

    #[inline]
    pub const fn reg(self) -> u8 {
        (self.0 >> 3) & 0x7
    }

    #[inline]
    pub const fn rm(self) -> u8 {
        self.0 & 0x7
    }
}

/// SIB byte accessor wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sib(pub u8);

impl Sib {
    #[inline]
    pub const fn scale(self) -> u8 {
        1 << (self.0 >> 6)
    }

    #[inline]
    pub const fn index(self) -> u8 {
        (self.0 >> 3) & 0x7
    }

    #[inline]
    pub const fn base(self) -> u8 {
        self.0 & 0x7
    }
}

/// Structural view of a ModRM/SIB memory operand.
///
/// Register fields are GPR indices (0..=15) with REX extension bits already
/// applied. `disp` is sign-extended; RIP-relative operands are flagged so the
/// effective-address computation can add the *next* instruction address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRef {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i32,
    pub rip_relative: bool,
}

/// One decoded instruction.
///
/// `opcode` is widened to distinguish the escape maps: single-byte opcodes are
/// `0x00..=0xFF`, two-byte forms are `0x0F00 | b`, and the three-byte maps are
/// `0x0F3800 | b` / `0x0F3A00 | b`.
///
/// Ephemeral: created fresh per decode call and not persisted past one
/// execute/analysis step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u32,
    pub prefixes: Prefixes,
    pub rex: Option<RexPrefix>,
    pub modrm: Option<ModRm>,
    pub sib: Option<Sib>,
    pub disp: i32,
    pub imm: u64,
    pub len: u8,
}

impl Instruction {
    /// Effective operand size for the common "byte form is opcode bit 0 clear"
    /// encodings, honoring REX.W and the 0x66 override.
    pub fn operand_size(&self) -> OperandSize {
        if self.is_byte_op() {
            return OperandSize::Bits8;
        }
        if self.rex.is_some_and(|r| r.w) {
            OperandSize::Bits64
        } else if self.prefixes.operand_size_override {
            OperandSize::Bits16
        } else {
            OperandSize::Bits32
        }
    }

    /// Whether this opcode is one of the fixed 8-bit forms.
    pub fn is_byte_op(&self) -> bool {
        match self.opcode {
            // ALU r/m8 forms, MOV r/m8 forms, group-1/2 byte forms.
            0x00 | 0x02 | 0x04 | 0x08 | 0x0A | 0x0C | 0x10 | 0x12 | 0x14 | 0x18 | 0x1A | 0x1C
            | 0x20 | 0x22 | 0x24 | 0x28 | 0x2A | 0x2C | 0x30 | 0x32 | 0x34 | 0x38 | 0x3A | 0x3C
            | 0x80 | 0x84 | 0x86 | 0x88 | 0x8A | 0xA8 | 0xC0 | 0xC6 | 0xD0 | 0xD2 | 0xF6 | 0xFE => {
                true
            }
            0xA4 | 0xA6 | 0xAA | 0xAC | 0xAE => true, // byte string ops
            op if (0xB0..=0xB7).contains(&op) => true, // MOV r8, imm8
            0x0FB6 | 0x0FBE => false, // MOVZX/MOVSX read a byte but write wider
            _ => false,
        }
    }

    /// ModRM.reg as a GPR index with REX.R applied.
    #[inline]
    pub fn modrm_reg(&self) -> u8 {
        let modrm = self.modrm.map(|m| m.reg()).unwrap_or(0);
        modrm | ((self.rex.is_some_and(|r| r.r) as u8) << 3)
    }

    /// ModRM.rm as a GPR index with REX.B applied (register-direct mode).
    #[inline]
    pub fn modrm_rm(&self) -> u8 {
        let modrm = self.modrm.map(|m| m.rm()).unwrap_or(0);
        modrm | ((self.rex.is_some_and(|r| r.b) as u8) << 3)
    }

    /// Register selected by the low 3 opcode bits (PUSH/POP/MOV-imm forms),
    /// extended by REX.B.
    #[inline]
    pub fn opcode_reg(&self) -> u8 {
        ((self.opcode as u8) & 0x7) | ((self.rex.is_some_and(|r| r.b) as u8) << 3)
    }

    /// Whether the ModRM encodes a memory operand.
    #[inline]
    pub fn has_memory_operand(&self) -> bool {
        self.modrm.is_some_and(|m| m.mode() != 3)
    }

    /// Structural memory operand, if the instruction has one.
    pub fn memory_ref(&self) -> Option<MemoryRef> {
        let modrm = self.modrm?;
        if modrm.mode() == 3 {
            return None;
        }

        let rex_b = self.rex.is_some_and(|r| r.b) as u8;
        let rex_x = self.rex.is_some_and(|r| r.x) as u8;

        if modrm.rm() == 4 {
            // SIB addressing.
            let sib = self.sib.unwrap_or(Sib(0));
            let base = if sib.base() == 5 && modrm.mode() == 0 {
                // disp32-only base.
                None
            } else {
                Some(sib.base() | (rex_b << 3))
            };
            // index=4 encodes "no index" only without REX.X (R12 is a valid index).
            let index = if sib.index() == 4 && rex_x == 0 {
                None
            } else {
                Some(sib.index() | (rex_x << 3))
            };
            return Some(MemoryRef {
                base,
                index,
                scale: sib.scale(),
                disp: self.disp,
                rip_relative: false,
            });
        }

        if modrm.mode() == 0 && modrm.rm() == 5 {
            return Some(MemoryRef {
                base: None,
                index: None,
                scale: 1,
                disp: self.disp,
                rip_relative: true,
            });
        }

        Some(MemoryRef {
            base: Some(modrm.rm() | (rex_b << 3)),
            index: None,
            scale: 1,
            disp: self.disp,
            rip_relative: false,
        })
    }

    /// Relative branch target for the rel8/rel32 forms, given the address of
    /// this instruction.
    pub fn branch_target(&self, ip: u64) -> u64 {
        let next = ip.wrapping_add(self.len as u64);
        match self.opcode {
            0xEB | 0xE0..=0xE3 => next.wrapping_add(self.imm as u8 as i8 as i64 as u64),
            op if (0x70..=0x7F).contains(&op) => {
                next.wrapping_add(self.imm as u8 as i8 as i64 as u64)
            }
            0xE8 | 0xE9 => next.wrapping_add(self.imm as u32 as i32 as i64 as u64),
            op if (0x0F80..=0x0F8F).contains(&op) => {
                next.wrapping_add(self.imm as u32 as i32 as i64 as u64)
            }
            _ => next,
        }
    }
}

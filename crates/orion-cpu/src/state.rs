use bitflags::bitflags;
use orion_x86::OperandSize;

bitflags! {
    /// RFLAGS register. Bit 1 is architecturally always set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        const CF        = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF        = 1 << 2;
        const AF        = 1 << 4;
        const ZF        = 1 << 6;
        const SF        = 1 << 7;
        const TF        = 1 << 8;
        const IF        = 1 << 9;
        const DF        = 1 << 10;
        const OF        = 1 << 11;
    }
}

impl Default for RFlags {
    fn default() -> Self {
        RFlags::RESERVED1
    }
}

/// Segment register indices into [`CpuState::seg_base`] / `seg_sel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

/// CR0 protection-enable bit.
pub const CR0_PE: u64 = 1 << 0;
/// Conventional flat 64-bit code segment selector.
pub const CS_FLAT_SEL: u16 = 0x08;

pub const GPR_RAX: u8 = 0;
pub const GPR_RCX: u8 = 1;
pub const GPR_RDX: u8 = 2;
pub const GPR_RBX: u8 = 3;
pub const GPR_RSP: u8 = 4;
pub const GPR_RBP: u8 = 5;
pub const GPR_RSI: u8 = 6;
pub const GPR_RDI: u8 = 7;

/// Full architectural register file.
///
/// General-purpose registers are indexed RAX..R15 in encoding order. Vector
/// state is held as 256-bit lanes; the XMM view is the low half.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: RFlags,
    pub ymm: [[u64; 4]; 16],
    pub seg_base: [u64; 6],
    pub seg_sel: [u16; 6],
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cpl: u8,
    pub paging_enabled: bool,
    pub halted: bool,
    pub running: bool,
    /// Monotonic retired-instruction counter; also feeds RDTSC.
    pub inst_count: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFlags::default(),
            ymm: [[0; 4]; 16],
            seg_base: [0; 6],
            seg_sel: [0; 6],
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cpl: 0,
            paging_enabled: false,
            halted: false,
            running: false,
            inst_count: 0,
        }
    }
}

impl CpuState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset architectural state and start execution at `pc`: flat code
    /// segment, CPL 0, protected mode on, interrupts enabled.
    pub fn reset(&mut self, pc: u64) {
        *self = Self {
            rip: pc,
            running: true,
            rflags: RFlags::RESERVED1 | RFlags::IF,
            cr0: CR0_PE,
            ..Self::default()
        };
        self.seg_sel[Segment::Cs as usize] = CS_FLAT_SEL;
    }

    #[inline]
    pub fn rsp(&self) -> u64 {
        self.gpr[GPR_RSP as usize]
    }

    #[inline]
    pub fn set_rsp(&mut self, rsp: u64) {
        self.gpr[GPR_RSP as usize] = rsp;
    }

    #[inline]
    pub fn read_gpr(&self, idx: u8) -> u64 {
        self.gpr[idx as usize & 0xF]
    }

    #[inline]
    pub fn write_gpr(&mut self, idx: u8, value: u64) {
        self.gpr[idx as usize & 0xF] = value;
    }

    /// Read the low `size` bytes of a register.
    ///
    /// Not valid for the legacy high-byte registers; use
    /// [`CpuState::read_reg8`] on the 8-bit paths.
    pub fn read_gpr_sized(&self, idx: u8, size: OperandSize) -> u64 {
        self.read_gpr(idx) & size.mask()
    }

    /// Write a register at a given width with x86-64 merge rules: 32-bit
    /// writes zero-extend, 16- and 8-bit writes preserve the upper bytes.
    pub fn write_gpr_sized(&mut self, idx: u8, size: OperandSize, value: u64) {
        let slot = &mut self.gpr[idx as usize & 0xF];
        match size {
            OperandSize::Bits64 => *slot = value,
            OperandSize::Bits32 => *slot = value & 0xFFFF_FFFF,
            OperandSize::Bits16 => *slot = (*slot & !0xFFFF) | (value & 0xFFFF),
            OperandSize::Bits8 => *slot = (*slot & !0xFF) | (value & 0xFF),
        }
    }

    /// 8-bit register read. Without a REX prefix, encodings 4..=7 select
    /// AH/CH/DH/BH; with one they select SPL/BPL/SIL/DIL.
    pub fn read_reg8(&self, idx: u8, rex_present: bool) -> u64 {
        if !rex_present && (4..8).contains(&idx) {
            (self.gpr[idx as usize - 4] >> 8) & 0xFF
        } else {
            self.gpr[idx as usize & 0xF] & 0xFF
        }
    }

    pub fn write_reg8(&mut self, idx: u8, rex_present: bool, value: u64) {
        if !rex_present && (4..8).contains(&idx) {
            let slot = &mut self.gpr[idx as usize - 4];
            *slot = (*slot & !0xFF00) | ((value & 0xFF) << 8);
        } else {
            let slot = &mut self.gpr[idx as usize & 0xF];
            *slot = (*slot & !0xFF) | (value & 0xFF);
        }
    }

    pub fn read_xmm(&self, idx: u8) -> u128 {
        let lane = &self.ymm[idx as usize & 0xF];
        (lane[0] as u128) | ((lane[1] as u128) << 64)
    }

    pub fn write_xmm(&mut self, idx: u8, value: u128) {
        let lane = &mut self.ymm[idx as usize & 0xF];
        lane[0] = value as u64;
        lane[1] = (value >> 64) as u64;
    }

    #[inline]
    pub fn flag(&self, flag: RFlags) -> bool {
        self.rflags.contains(flag)
    }

    /// Replace RFLAGS wholesale (POPF/IRET), keeping bit 1 set.
    pub fn set_rflags_bits(&mut self, bits: u64) {
        self.rflags = RFlags::from_bits_truncate(bits) | RFlags::RESERVED1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_starts_running_at_pc() {
        let mut state = CpuState::new();
        state.gpr[3] = 99;
        state.halted = true;
        state.reset(0x1000);
        assert_eq!(state.rip, 0x1000);
        assert!(state.running && !state.halted);
        assert_eq!(state.gpr[3], 0);
        assert!(state.rflags.contains(RFlags::RESERVED1 | RFlags::IF));
        assert_eq!(state.seg_sel[Segment::Cs as usize], CS_FLAT_SEL);
        assert_eq!(state.cr0 & CR0_PE, CR0_PE);
        assert_eq!(state.cpl, 0);
    }

    #[test]
    fn sized_writes_follow_merge_rules() {
        let mut state = CpuState::new();
        state.gpr[0] = 0xFFFF_FFFF_FFFF_FFFF;
        state.write_gpr_sized(0, OperandSize::Bits32, 0x1234_5678);
        assert_eq!(state.gpr[0], 0x1234_5678); // zero-extended
        state.gpr[1] = 0xFFFF_FFFF_FFFF_FFFF;
        state.write_gpr_sized(1, OperandSize::Bits16, 0xABCD);
        assert_eq!(state.gpr[1], 0xFFFF_FFFF_FFFF_ABCD);
    }

    #[test]
    fn high_byte_registers_without_rex() {
        let mut state = CpuState::new();
        state.gpr[0] = 0x1234; // AH = 0x12, AL = 0x34
        assert_eq!(state.read_reg8(4, false), 0x12); // AH
        assert_eq!(state.read_reg8(4, true), state.gpr[4] & 0xFF); // SPL
        state.write_reg8(6, false, 0xEE); // DH
        assert_eq!(state.gpr[2] & 0xFF00, 0xEE00);
    }
}

//! Basic-block discovery: linear decode from an entry point until control
//! flow leaves the block or the instruction cap is reached.

use orion_x86::{classify, decode, DecodeError, InstClass, Instruction, MAX_INST_LEN};

/// Hard cap on instructions per block.
pub const MAX_BLOCK_INSTS: usize = 100;

/// Approximate GPR read/write sets for one instruction, as 16-bit masks in
/// encoding order. Conservative: unknown operands widen to "all".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegSet {
    pub reads: u16,
    pub writes: u16,
}

impl RegSet {
    #[inline]
    pub fn reads_reg(&self, idx: u8) -> bool {
        self.reads & (1 << (idx & 0xF)) != 0
    }

    #[inline]
    pub fn writes_reg(&self, idx: u8) -> bool {
        self.writes & (1 << (idx & 0xF)) != 0
    }
}

/// One instruction inside a block, with its address and classification.
#[derive(Debug, Clone, Copy)]
pub struct BlockInst {
    pub inst: Instruction,
    pub pc: u64,
    pub class: InstClass,
    pub regs: RegSet,
}

/// A decoded straight-line region.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub entry: u64,
    pub insts: Vec<BlockInst>,
    /// Total encoded length in bytes; the block covers
    /// `[entry, entry + byte_len)`.
    pub byte_len: u64,
    /// Static successor addresses, where knowable: branch target and/or
    /// fall-through. Indirect targets are not included.
    pub targets: Vec<u64>,
}

/// Why analysis stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    Branch,
    Ret,
    Call,
    Halt,
    InstCap,
    DecodeError(DecodeError),
}

/// Decode a basic block starting at `entry`.
///
/// `fetch` fills a window of up to [`MAX_INST_LEN`] bytes at an address and
/// returns how many are valid; it is the same window contract the execution
/// engine uses, so analysis sees exactly the bytes execution would.
pub fn analyze_block<F>(entry: u64, mut fetch: F) -> (BasicBlock, BlockEnd)
where
    F: FnMut(u64, &mut [u8; MAX_INST_LEN]) -> usize,
{
    let mut block = BasicBlock {
        entry,
        insts: Vec::new(),
        byte_len: 0,
        targets: Vec::new(),
    };
    let mut pc = entry;

    loop {
        if block.insts.len() >= MAX_BLOCK_INSTS {
            block.targets.push(pc);
            return (block, BlockEnd::InstCap);
        }

        let mut window = [0u8; MAX_INST_LEN];
        let avail = fetch(pc, &mut window);
        let inst = match decode(&window[..avail]) {
            Ok(inst) => inst,
            Err(err) => return (block, BlockEnd::DecodeError(err)),
        };
        let class = classify(&inst);
        block.insts.push(BlockInst {
            inst,
            pc,
            class,
            regs: reg_sets(&inst, class),
        });
        let next = pc.wrapping_add(inst.len as u64);
        block.byte_len = next - entry;

        // Block enders: any transfer of control, plus HLT.
        if class.contains(InstClass::RET) {
            return (block, BlockEnd::Ret);
        }
        if class.contains(InstClass::CALL) {
            if inst.opcode == 0xE8 {
                block.targets.push(inst.branch_target(pc));
            }
            return (block, BlockEnd::Call);
        }
        if class.contains(InstClass::BRANCH) {
            if matches!(inst.opcode, 0xE9 | 0xEB) {
                block.targets.push(inst.branch_target(pc));
            }
            return (block, BlockEnd::Branch);
        }
        if class.contains(InstClass::COND_BRANCH) {
            block.targets.push(inst.branch_target(pc));
            block.targets.push(next);
            return (block, BlockEnd::Branch);
        }
        if class.contains(InstClass::HALT) {
            return (block, BlockEnd::Halt);
        }
        pc = next;
    }
}

const ALL_REGS: u16 = 0xFFFF;

fn bit(idx: u8) -> u16 {
    1 << (idx & 0xF)
}

/// Conservative register use summary.
fn reg_sets(inst: &Instruction, class: InstClass) -> RegSet {
    let mut rs = RegSet::default();

    if inst.modrm.is_some() {
        let reg = bit(inst.modrm_reg());
        if let Some(m) = inst.memory_ref() {
            if let Some(base) = m.base {
                rs.reads |= bit(base);
            }
            if let Some(index) = m.index {
                rs.reads |= bit(index);
            }
            // Direction resolved by the class bits computed at decode.
            rs.reads |= reg;
            if !class.contains(InstClass::MEM_WRITE) || class.contains(InstClass::MEM_READ) {
                rs.writes |= reg;
            }
        } else {
            let rm = bit(inst.modrm_rm());
            rs.reads |= reg | rm;
            rs.writes |= reg | rm;
        }
    } else {
        match inst.opcode {
            0x50..=0x5F | 0xB0..=0xBF => {
                let r = bit(inst.opcode_reg());
                if matches!(inst.opcode, 0x50..=0x57) {
                    rs.reads |= r;
                } else {
                    rs.writes |= r;
                }
                rs.reads |= bit(4); // rsp for the stack forms
                rs.writes |= bit(4);
            }
            // Accumulator forms.
            0x04 | 0x05 | 0x0C | 0x0D | 0x14 | 0x15 | 0x1C | 0x1D | 0x24 | 0x25 | 0x2C | 0x2D
            | 0x34 | 0x35 | 0x3C | 0x3D | 0xA8 | 0xA9 => {
                rs.reads |= bit(0);
                rs.writes |= bit(0);
            }
            _ if class.contains(InstClass::STRING) => {
                rs.reads = bit(0) | bit(1) | bit(6) | bit(7);
                rs.writes = bit(0) | bit(1) | bit(6) | bit(7);
            }
            // Unknown shape: assume everything.
            _ => {
                rs.reads = ALL_REGS;
                rs.writes = ALL_REGS;
            }
        }
    }
    rs
}

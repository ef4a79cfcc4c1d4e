//! Block-local intermediate representation.
//!
//! Values are either architectural GPRs or single-assignment temporaries.
//! A block is a straight list of ops ending in `Exit` or `Bailout`; there is
//! no internal control flow.

/// Virtual register, assigned once by lowering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Temp(pub u32);

/// Architectural GPR in encoding order (0 = RAX .. 15 = R15).
pub type Gpr = u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Place {
    Reg(Gpr),
    Temp(Temp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Imm(i64),
    Reg(Gpr),
    Temp(Temp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    ShrU,
    SarS,
    Mul,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    LtS,
    LtU,
    GeS,
    GeU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemSize {
    U8,
    U16,
    U32,
    U64,
}

impl MemSize {
    pub fn bytes(self) -> usize {
        match self {
            MemSize::U8 => 1,
            MemSize::U16 => 2,
            MemSize::U32 => 4,
            MemSize::U64 => 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrOp {
    Set {
        dst: Place,
        src: Operand,
    },
    Bin {
        dst: Place,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
        /// Whether architectural flags must be materialized for this op.
        /// Cleared by the flag-elimination pass when provably unobserved.
        set_flags: bool,
    },
    Cmp {
        dst: Place,
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    Load {
        dst: Place,
        addr: Operand,
        size: MemSize,
    },
    Store {
        addr: Operand,
        value: Operand,
        size: MemSize,
    },
    /// Leave the block; execution continues at `next_rip`.
    Exit {
        next_rip: Operand,
    },
    /// Leave the block if `cond` is non-zero, else fall through.
    ExitIf {
        cond: Operand,
        next_rip: Operand,
        fallthrough_rip: u64,
    },
    /// Hand the instruction at `rip` back to the interpreter.
    Bailout {
        rip: u64,
    },
}

impl IrOp {
    /// The temp this op defines, if any.
    pub fn def_temp(&self) -> Option<Temp> {
        let place = match self {
            IrOp::Set { dst, .. }
            | IrOp::Bin { dst, .. }
            | IrOp::Cmp { dst, .. }
            | IrOp::Load { dst, .. } => Some(*dst),
            _ => None,
        };
        match place {
            Some(Place::Temp(t)) => Some(t),
            _ => None,
        }
    }

    /// Visit every operand this op reads.
    pub fn for_each_use(&self, mut f: impl FnMut(&Operand)) {
        match self {
            IrOp::Set { src, .. } => f(src),
            IrOp::Bin { lhs, rhs, .. } | IrOp::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            IrOp::Load { addr, .. } => f(addr),
            IrOp::Store { addr, value, .. } => {
                f(addr);
                f(value);
            }
            IrOp::Exit { next_rip } => f(next_rip),
            IrOp::ExitIf { cond, next_rip, .. } => {
                f(cond);
                f(next_rip);
            }
            IrOp::Bailout { .. } => {}
        }
    }

    /// Whether removing this op could change observable state.
    pub fn has_side_effect(&self) -> bool {
        match self {
            IrOp::Store { .. } | IrOp::Exit { .. } | IrOp::ExitIf { .. } | IrOp::Bailout { .. } => {
                true
            }
            IrOp::Bin { dst, set_flags, .. } => *set_flags || matches!(dst, Place::Reg(_)),
            // A load can fault even when its destination is dead.
            IrOp::Load { .. } => true,
            IrOp::Set { dst, .. } | IrOp::Cmp { dst, .. } => matches!(dst, Place::Reg(_)),
        }
    }
}

/// Optimizer hints attached by the analysis passes. Advisory only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHints {
    /// Short block ending in a backward conditional branch.
    pub unroll_candidate: bool,
    /// Constant memory stride detected across the block's accesses.
    pub vector_stride: Option<u32>,
    /// Static prediction for the terminating conditional branch.
    pub predict_taken: Option<bool>,
}

/// Lowered block: ops plus the temp count for the allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockIr {
    pub ops: Vec<IrOp>,
    pub temp_count: u32,
    pub hints: BlockHints,
}

impl BlockIr {
    pub fn new_temp(&mut self) -> Temp {
        let t = Temp(self.temp_count);
        self.temp_count += 1;
        t
    }
}

//! Compiled-block representation and execution backends.
//!
//! Every backend produces architecturally identical results; they differ
//! only in how much work happens per guest instruction. The interpreter
//! backend replays the decoded instructions through the execution engine,
//! the native backends run the block IR (as host machine code when the
//! block qualifies, otherwise through the IR evaluator).

pub mod interp;

#[cfg(all(unix, target_arch = "x86_64"))]
pub mod code_buffer;
#[cfg(all(unix, target_arch = "x86_64"))]
pub mod native;

use std::sync::atomic::{AtomicU64, Ordering};

use orion_cpu::{Cpu, CpuBus, CpuError, StepOutcome};

use crate::block::BlockInst;
use crate::ir::BlockIr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Replay decoded instructions through the execution engine.
    Interpreter,
    /// Native code with the cheap optimization pipeline.
    NativeFast,
    /// Native code with the full optimization pipeline.
    NativeOpt,
}

/// One translated basic block, immutable once published to the trace cache.
pub struct CompiledBlock {
    pub entry: u64,
    /// Encoded guest length; the block covers `[entry, entry + byte_len)`.
    pub byte_len: u64,
    pub backend: BackendKind,
    pub insts: Vec<BlockInst>,
    pub ir: BlockIr,
    #[cfg(all(unix, target_arch = "x86_64"))]
    pub native: Option<native::NativeBlock>,
    pub exec_count: AtomicU64,
}

impl CompiledBlock {
    pub fn new(
        entry: u64,
        byte_len: u64,
        backend: BackendKind,
        insts: Vec<BlockInst>,
        ir: BlockIr,
    ) -> Self {
        Self {
            entry,
            byte_len,
            backend,
            insts,
            ir,
            #[cfg(all(unix, target_arch = "x86_64"))]
            native: None,
            exec_count: AtomicU64::new(0),
        }
    }

    pub fn end(&self) -> u64 {
        self.entry.wrapping_add(self.byte_len)
    }

    /// Whether this block covers any byte of `[start, start + len)`.
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        len != 0 && self.entry < start.wrapping_add(len) && self.end() > start
    }

    pub fn executions(&self) -> u64 {
        self.exec_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn stub(entry: u64, byte_len: u64) -> Self {
        Self::new(
            entry,
            byte_len,
            BackendKind::Interpreter,
            Vec::new(),
            BlockIr::default(),
        )
    }
}

/// Execute one compiled block from its entry point. RIP must already be at
/// `block.entry`; on return it points at the next instruction to execute.
pub fn run_block<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    block: &CompiledBlock,
) -> Result<StepOutcome, CpuError> {
    if cpu.state.halted {
        return Ok(StepOutcome::Halted);
    }
    if !cpu.state.running {
        return Ok(StepOutcome::Stopped);
    }
    block.exec_count.fetch_add(1, Ordering::Relaxed);

    match block.backend {
        BackendKind::Interpreter => interp::replay(cpu, bus, block)?,
        BackendKind::NativeFast | BackendKind::NativeOpt => {
            #[cfg(all(unix, target_arch = "x86_64"))]
            if let Some(native) = &block.native {
                cpu.state.rip = native.run(&mut cpu.state.gpr);
                cpu.state.inst_count = cpu.state.inst_count.wrapping_add(block.insts.len() as u64);
                return Ok(outcome(cpu));
            }
            match interp::eval_ir(cpu, bus, &block.ir)? {
                interp::IrExit::Jump(rip) => {
                    cpu.state.rip = rip;
                    cpu.state.inst_count =
                        cpu.state.inst_count.wrapping_add(block.insts.len() as u64);
                }
                interp::IrExit::Bailout(rip) => {
                    // Only the instructions ahead of the bailing one ran.
                    let done = block.insts.iter().take_while(|bi| bi.pc < rip).count();
                    cpu.state.rip = rip;
                    cpu.state.inst_count = cpu.state.inst_count.wrapping_add(done as u64);
                    // A bailout at the entry ran zero ops; interpret one
                    // instruction so dispatch always advances.
                    if rip == block.entry {
                        if let Some(bi) = block.insts.first() {
                            cpu.execute_decoded(bus, &bi.inst, bi.pc)?;
                            cpu.state.inst_count = cpu.state.inst_count.wrapping_add(1);
                        }
                    }
                }
            }
        }
    }
    Ok(outcome(cpu))
}

fn outcome(cpu: &Cpu) -> StepOutcome {
    if cpu.state.halted {
        StepOutcome::Halted
    } else if !cpu.state.running {
        StepOutcome::Stopped
    } else {
        StepOutcome::Executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_half_open() {
        let block = CompiledBlock::stub(0x1000, 0x10);
        assert!(block.overlaps(0x1000, 1));
        assert!(block.overlaps(0x100F, 1));
        assert!(block.overlaps(0x0FFF, 2));
        assert!(!block.overlaps(0x1010, 1));
        assert!(!block.overlaps(0x0FFF, 1));
        assert!(!block.overlaps(0x1000, 0));
    }
}

//! Interrupt and exception delivery.
//!
//! Vectors resolve through a flat software vector table on the CPU rather
//! than a guest-memory IDT. Delivery pushes RFLAGS, CS, and the return RIP,
//! then transfers to the handler with IF and TF cleared. Faults pass the
//! address of the faulting instruction as the return RIP; traps pass the
//! address of the next one.

use tracing::warn;

use crate::bus::CpuBus;
use crate::exec::{push64, Cpu, Flow};
use crate::state::{RFlags, Segment};
use crate::CpuError;

/// Divide error (#DE).
pub const VECTOR_DE: u8 = 0;
/// Breakpoint (INT3).
pub const VECTOR_BP: u8 = 3;
/// Overflow (INTO).
pub const VECTOR_OF: u8 = 4;

/// Deliver `vector` with an explicit return RIP.
pub fn deliver<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    vector: u8,
    return_rip: u64,
) -> Result<(), CpuError> {
    let handler = cpu.ivt[vector as usize];
    if handler == 0 {
        warn!(vector, "interrupt with no handler installed, halting");
        cpu.state.halted = true;
        return Ok(());
    }

    push64(cpu, bus, cpu.state.rflags.bits())?;
    push64(cpu, bus, cpu.state.seg_sel[Segment::Cs as usize] as u64)?;
    push64(cpu, bus, return_rip)?;

    cpu.state.rflags.remove(RFlags::IF | RFlags::TF);
    cpu.state.rip = handler;
    Ok(())
}

/// INT imm8 / INT3 / INTO: trap semantics, return RIP after the instruction.
pub(crate) fn software_int<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    vector: u8,
    pc: u64,
    len: u8,
) -> Result<Flow, CpuError> {
    deliver(cpu, bus, vector, pc.wrapping_add(len as u64))?;
    Ok(Flow::Jump)
}

//! Minimal SSE data movement and integer vector operations.
//!
//! Covers the 128-bit move forms plus PXOR/PADDD, which is what compiled
//! memcpy/memset loops in practice lean on. Alignment faults for the aligned
//! forms are not modeled.

use orion_x86::Instruction;

use crate::bus::CpuBus;
use crate::exec::{effective_addr, Cpu, Flow};
use crate::CpuError;

pub(super) fn sse_op<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let reg = inst.modrm_reg();
    match inst.opcode {
        // MOVUPS/MOVAPS/MOVDQA-U load forms.
        0x0F10 | 0x0F28 | 0x0F6F => {
            let value = read_xmm_rm(cpu, bus, inst, pc)?;
            cpu.state.write_xmm(reg, value);
        }
        // Store forms.
        0x0F11 | 0x0F29 | 0x0F7F => {
            let value = cpu.state.read_xmm(reg);
            write_xmm_rm(cpu, bus, inst, pc, value)?;
        }
        0x0FEF => {
            let a = cpu.state.read_xmm(reg);
            let b = read_xmm_rm(cpu, bus, inst, pc)?;
            cpu.state.write_xmm(reg, a ^ b);
        }
        0x0FFE => {
            let a = cpu.state.read_xmm(reg);
            let b = read_xmm_rm(cpu, bus, inst, pc)?;
            cpu.state.write_xmm(reg, paddd(a, b));
        }
        _ => unreachable!(),
    }
    Ok(Flow::Next)
}

/// Lane-wise 32-bit wrapping add.
fn paddd(a: u128, b: u128) -> u128 {
    let mut out = 0u128;
    for lane in 0..4 {
        let shift = lane * 32;
        let sum = ((a >> shift) as u32).wrapping_add((b >> shift) as u32);
        out |= (sum as u128) << shift;
    }
    out
}

fn read_xmm_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<u128, CpuError> {
    if let Some(m) = inst.memory_ref() {
        let addr = effective_addr(&cpu.state, inst, pc, &m);
        Ok(bus.read_u128(addr)?)
    } else {
        Ok(cpu.state.read_xmm(inst.modrm_rm()))
    }
}

fn write_xmm_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
    value: u128,
) -> Result<(), CpuError> {
    if let Some(m) = inst.memory_ref() {
        let addr = effective_addr(&cpu.state, inst, pc, &m);
        bus.write_u128(addr, value)?;
    } else {
        cpu.state.write_xmm(inst.modrm_rm(), value);
    }
    Ok(())
}

//! String instructions (MOVS/CMPS/STOS/LODS/SCAS) with REP handling.

use orion_x86::{Instruction, RepPrefix};

use crate::bus::CpuBus;
use crate::exec::{Cpu, Flow};
use crate::flags::cmp_with_flags;
use crate::state::{RFlags, GPR_RAX, GPR_RCX, GPR_RDI, GPR_RSI};
use crate::CpuError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringKind {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

pub(super) fn string_op<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
) -> Result<Flow, CpuError> {
    let kind = match inst.opcode {
        0xA4 | 0xA5 => StringKind::Movs,
        0xA6 | 0xA7 => StringKind::Cmps,
        0xAA | 0xAB => StringKind::Stos,
        0xAC | 0xAD => StringKind::Lods,
        _ => StringKind::Scas,
    };
    let bytes = if inst.is_byte_op() {
        1
    } else {
        inst.operand_size().bytes()
    };
    let rep = inst.prefixes.rep;
    // DF selects the direction the index registers move.
    let delta = if cpu.state.flag(RFlags::DF) {
        (bytes as u64).wrapping_neg()
    } else {
        bytes as u64
    };

    loop {
        if rep.is_some() && cpu.state.read_gpr(GPR_RCX) == 0 {
            break;
        }

        let rsi = cpu.state.read_gpr(GPR_RSI);
        let rdi = cpu.state.read_gpr(GPR_RDI);
        match kind {
            StringKind::Movs => {
                let value = bus.read_sized(rsi, bytes)?;
                bus.write_sized(rdi, bytes, value)?;
                cpu.state.write_gpr(GPR_RSI, rsi.wrapping_add(delta));
                cpu.state.write_gpr(GPR_RDI, rdi.wrapping_add(delta));
            }
            StringKind::Cmps => {
                let a = bus.read_sized(rsi, bytes)?;
                let b = bus.read_sized(rdi, bytes)?;
                cmp_with_flags(&mut cpu.state.rflags, a, b, bytes);
                cpu.state.write_gpr(GPR_RSI, rsi.wrapping_add(delta));
                cpu.state.write_gpr(GPR_RDI, rdi.wrapping_add(delta));
            }
            StringKind::Stos => {
                let value = cpu.state.read_gpr(GPR_RAX);
                bus.write_sized(rdi, bytes, value)?;
                cpu.state.write_gpr(GPR_RDI, rdi.wrapping_add(delta));
            }
            StringKind::Lods => {
                let value = bus.read_sized(rsi, bytes)?;
                let size = inst.operand_size();
                if bytes == 1 {
                    cpu.state.write_reg8(GPR_RAX, true, value);
                } else {
                    cpu.state.write_gpr_sized(GPR_RAX, size, value);
                }
                cpu.state.write_gpr(GPR_RSI, rsi.wrapping_add(delta));
            }
            StringKind::Scas => {
                let a = cpu.state.read_gpr(GPR_RAX);
                let b = bus.read_sized(rdi, bytes)?;
                cmp_with_flags(&mut cpu.state.rflags, a, b, bytes);
                cpu.state.write_gpr(GPR_RDI, rdi.wrapping_add(delta));
            }
        }

        let Some(rep) = rep else { break };
        let rcx = cpu.state.read_gpr(GPR_RCX).wrapping_sub(1);
        cpu.state.write_gpr(GPR_RCX, rcx);

        // REPE/REPNE terminate on ZF for the comparing forms; plain REP
        // only counts down RCX.
        if matches!(kind, StringKind::Cmps | StringKind::Scas) {
            let zf = cpu.state.flag(RFlags::ZF);
            match rep {
                RepPrefix::Rep if !zf => break,
                RepPrefix::Repne if zf => break,
                _ => {}
            }
        }
    }
    Ok(Flow::Next)
}

//! Stack, branch, and system instruction handlers.

use orion_x86::{Instruction, OperandSize};

use crate::bus::CpuBus;
use crate::exec::{write_rm, Cpu, Flow};
use crate::flags::sign_extend;
use crate::state::{RFlags, Segment, GPR_RAX, GPR_RCX, GPR_RDX};
use crate::CpuError;

/// Branch condition for the 16 cc encodings (Jcc/SETcc/CMOVcc).
pub(crate) fn condition(fl: RFlags, cc: u8) -> bool {
    let base = match cc >> 1 {
        0 => fl.contains(RFlags::OF),
        1 => fl.contains(RFlags::CF),
        2 => fl.contains(RFlags::ZF),
        3 => fl.contains(RFlags::CF) || fl.contains(RFlags::ZF),
        4 => fl.contains(RFlags::SF),
        5 => fl.contains(RFlags::PF),
        6 => fl.contains(RFlags::SF) != fl.contains(RFlags::OF),
        _ => fl.contains(RFlags::ZF) || (fl.contains(RFlags::SF) != fl.contains(RFlags::OF)),
    };
    base != (cc & 1 != 0)
}

pub(crate) fn push64<B: CpuBus>(cpu: &mut Cpu, bus: &mut B, value: u64) -> Result<(), CpuError> {
    let rsp = cpu.state.rsp().wrapping_sub(8);
    bus.write_u64(rsp, value)?;
    cpu.state.set_rsp(rsp);
    Ok(())
}

pub(crate) fn pop64<B: CpuBus>(cpu: &mut Cpu, bus: &mut B) -> Result<u64, CpuError> {
    let rsp = cpu.state.rsp();
    let value = bus.read_u64(rsp)?;
    cpu.state.set_rsp(rsp.wrapping_add(8));
    Ok(value)
}

pub(super) fn push_reg<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
) -> Result<Flow, CpuError> {
    let value = cpu.state.read_gpr(inst.opcode_reg());
    push64(cpu, bus, value)?;
    Ok(Flow::Next)
}

pub(super) fn pop_reg<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
) -> Result<Flow, CpuError> {
    let value = pop64(cpu, bus)?;
    cpu.state.write_gpr(inst.opcode_reg(), value);
    Ok(Flow::Next)
}

/// PUSH imm8/imm32, sign-extended to 64 bits (0x6A/0x68).
pub(super) fn push_imm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
) -> Result<Flow, CpuError> {
    let width = if inst.opcode == 0x6A { 1 } else { 4 };
    push64(cpu, bus, sign_extend(inst.imm, width) as u64)?;
    Ok(Flow::Next)
}

/// POP r/m64 (0x8F /0).
pub(super) fn pop_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let value = pop64(cpu, bus)?;
    write_rm(cpu, bus, inst, pc, OperandSize::Bits64, value)?;
    Ok(Flow::Next)
}

pub(super) fn jcc(cpu: &mut Cpu, inst: &Instruction, pc: u64) -> Result<Flow, CpuError> {
    if condition(cpu.state.rflags, (inst.opcode & 0xF) as u8) {
        cpu.state.rip = inst.branch_target(pc);
        Ok(Flow::Jump)
    } else {
        Ok(Flow::Next)
    }
}

/// LOOPNE/LOOPE/LOOP (0xE0..0xE2): decrement RCX, branch while non-zero
/// (with a ZF condition for the E0/E1 forms).
pub(super) fn loop_family(cpu: &mut Cpu, inst: &Instruction, pc: u64) -> Result<Flow, CpuError> {
    let rcx = cpu.state.read_gpr(GPR_RCX).wrapping_sub(1);
    cpu.state.write_gpr(GPR_RCX, rcx);
    let zf = cpu.state.flag(RFlags::ZF);
    let taken = rcx != 0
        && match inst.opcode {
            0xE0 => !zf,
            0xE1 => zf,
            _ => true,
        };
    if taken {
        cpu.state.rip = pc
            .wrapping_add(inst.len as u64)
            .wrapping_add(sign_extend(inst.imm, 1) as u64);
        Ok(Flow::Jump)
    } else {
        Ok(Flow::Next)
    }
}

/// JRCXZ (0xE3).
pub(super) fn jrcxz(cpu: &mut Cpu, inst: &Instruction, pc: u64) -> Result<Flow, CpuError> {
    if cpu.state.read_gpr(GPR_RCX) == 0 {
        cpu.state.rip = inst.branch_target(pc);
        Ok(Flow::Jump)
    } else {
        Ok(Flow::Next)
    }
}

pub(super) fn call_rel<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    push64(cpu, bus, pc.wrapping_add(inst.len as u64))?;
    cpu.state.rip = inst.branch_target(pc);
    Ok(Flow::Jump)
}

pub(super) fn jmp_rel(cpu: &mut Cpu, inst: &Instruction, pc: u64) -> Result<Flow, CpuError> {
    cpu.state.rip = inst.branch_target(pc);
    Ok(Flow::Jump)
}

/// RET / RET imm16 (0xC3/0xC2).
pub(super) fn ret<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
) -> Result<Flow, CpuError> {
    let target = pop64(cpu, bus)?;
    if inst.opcode == 0xC2 {
        let rsp = cpu.state.rsp().wrapping_add(inst.imm & 0xFFFF);
        cpu.state.set_rsp(rsp);
    }
    cpu.state.rip = target;
    Ok(Flow::Jump)
}

pub(super) fn pushf<B: CpuBus>(cpu: &mut Cpu, bus: &mut B) -> Result<Flow, CpuError> {
    let bits = cpu.state.rflags.bits();
    push64(cpu, bus, bits)?;
    Ok(Flow::Next)
}

pub(super) fn popf<B: CpuBus>(cpu: &mut Cpu, bus: &mut B) -> Result<Flow, CpuError> {
    let bits = pop64(cpu, bus)?;
    cpu.state.set_rflags_bits(bits);
    Ok(Flow::Next)
}

/// SAHF: AH into the low flag byte.
pub(super) fn sahf(cpu: &mut Cpu) -> Result<Flow, CpuError> {
    let ah = cpu.state.read_reg8(4, false);
    let keep = cpu.state.rflags.bits() & !0xFF;
    cpu.state.set_rflags_bits(keep | ah);
    Ok(Flow::Next)
}

/// LAHF: low flag byte into AH.
pub(super) fn lahf(cpu: &mut Cpu) -> Result<Flow, CpuError> {
    let low = cpu.state.rflags.bits() & 0xFF;
    cpu.state.write_reg8(4, false, low);
    Ok(Flow::Next)
}

pub(super) fn set_flag(cpu: &mut Cpu, flag: RFlags, value: bool) -> Result<Flow, CpuError> {
    cpu.state.rflags.set(flag, value);
    Ok(Flow::Next)
}

/// INTO (0xCE): interrupt 4 if OF is set.
pub(super) fn into<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    if cpu.state.flag(RFlags::OF) {
        crate::interrupts::software_int(cpu, bus, 4, pc, inst.len)
    } else {
        Ok(Flow::Next)
    }
}

/// IRETQ: pop RIP, CS, RFLAGS in that order.
pub(super) fn iret<B: CpuBus>(cpu: &mut Cpu, bus: &mut B) -> Result<Flow, CpuError> {
    let rip = pop64(cpu, bus)?;
    let cs = pop64(cpu, bus)?;
    let rflags = pop64(cpu, bus)?;
    cpu.state.seg_sel[Segment::Cs as usize] = cs as u16;
    cpu.state.set_rflags_bits(rflags);
    cpu.state.rip = rip;
    Ok(Flow::Jump)
}

/// SYSCALL (0x0F05): dispatched to the host handler. Without one, the CPU
/// halts rather than jumping through an unconfigured MSR.
pub(super) fn syscall(cpu: &mut Cpu) -> Result<Flow, CpuError> {
    let mut handler = cpu.syscall.take();
    if let Some(handler) = handler.as_mut() {
        handler(&mut cpu.state);
    } else {
        tracing::warn!("SYSCALL with no handler installed, halting");
        cpu.state.halted = true;
    }
    cpu.syscall = handler;
    Ok(Flow::Next)
}

/// RDTSC: retired-instruction count stands in for the timestamp counter.
pub(super) fn rdtsc(cpu: &mut Cpu) -> Result<Flow, CpuError> {
    let tsc = cpu.state.inst_count;
    cpu.state
        .write_gpr_sized(GPR_RAX, OperandSize::Bits32, tsc & 0xFFFF_FFFF);
    cpu.state
        .write_gpr_sized(GPR_RDX, OperandSize::Bits32, tsc >> 32);
    Ok(Flow::Next)
}

/// CPUID: minimal leaf set identifying the virtual core.
pub(super) fn cpuid(cpu: &mut Cpu) -> Result<Flow, CpuError> {
    let leaf = cpu.state.read_gpr_sized(GPR_RAX, OperandSize::Bits32);
    let (a, b, c, d): (u64, u64, u64, u64) = match leaf {
        // Vendor string "OrionVCpuCore".
        0 => (1, 0x6F69_724F, 0x6572_6F43, 0x7570_4356),
        // Family/model plus baseline feature bits (FPU, TSC, CMOV, SSE2).
        1 => (0x0006_00F1, 0, 0, (1 << 0) | (1 << 4) | (1 << 15) | (1 << 26)),
        _ => (0, 0, 0, 0),
    };
    cpu.state.write_gpr_sized(GPR_RAX, OperandSize::Bits32, a);
    cpu.state.write_gpr_sized(3, OperandSize::Bits32, b);
    cpu.state.write_gpr_sized(GPR_RCX, OperandSize::Bits32, c);
    cpu.state.write_gpr_sized(GPR_RDX, OperandSize::Bits32, d);
    Ok(Flow::Next)
}

//! Data movement, integer arithmetic, and bit manipulation handlers.

use orion_x86::{Instruction, OperandSize};

use crate::bus::CpuBus;
use crate::exec::{
    condition, effective_addr, flow, read_reg_operand, read_rm, write_reg_operand, write_rm, Cpu,
    Flow,
};
use crate::flags::{
    add_with_flags, cmp_with_flags, dec_with_flags, inc_with_flags, logic_with_flags,
    mask_for_size, mul_flags, neg_with_flags, rol_with_flags, ror_with_flags, sar_with_flags,
    shl_with_flags, shr_with_flags, sign_extend, sub_with_flags,
};
use crate::state::{RFlags, GPR_RAX, GPR_RCX, GPR_RDX};
use crate::CpuError;

/// Apply one of the eight classic ALU operations. Returns `None` for CMP,
/// which computes flags without a result.
fn apply_binop(fl: &mut RFlags, op: u8, dest: u64, src: u64, size: usize) -> Option<u64> {
    match op {
        0 => Some(add_with_flags(fl, dest, src, false, size)),
        1 => Some(logic_with_flags(fl, dest | src, size)),
        2 => {
            let cf = fl.contains(RFlags::CF);
            Some(add_with_flags(fl, dest, src, cf, size))
        }
        3 => {
            let cf = fl.contains(RFlags::CF);
            Some(sub_with_flags(fl, dest, src, cf, size))
        }
        4 => Some(logic_with_flags(fl, dest & src, size)),
        5 => Some(sub_with_flags(fl, dest, src, false, size)),
        6 => Some(logic_with_flags(fl, dest ^ src, size)),
        7 => {
            cmp_with_flags(fl, dest, src, size);
            None
        }
        _ => unreachable!(),
    }
}

/// ADD/OR/ADC/SBB/AND/SUB/XOR/CMP, opcodes `0x00..=0x3D`.
pub(super) fn binop_group<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let op = ((inst.opcode >> 3) & 7) as u8;
    let form = (inst.opcode & 7) as u8;
    let size = inst.operand_size();
    let bytes = size.bytes();
    let mut fl = cpu.state.rflags;

    match form {
        // r/m <- r/m op reg
        0 | 1 => {
            let dest = read_rm(cpu, bus, inst, pc, size)?;
            let src = read_reg_operand(cpu, inst, size);
            let result = apply_binop(&mut fl, op, dest, src, bytes);
            cpu.state.rflags = fl;
            if let Some(result) = result {
                write_rm(cpu, bus, inst, pc, size, result)?;
            }
        }
        // reg <- reg op r/m
        2 | 3 => {
            let dest = read_reg_operand(cpu, inst, size);
            let src = read_rm(cpu, bus, inst, pc, size)?;
            let result = apply_binop(&mut fl, op, dest, src, bytes);
            cpu.state.rflags = fl;
            if let Some(result) = result {
                write_reg_operand(cpu, inst, size, result);
            }
        }
        // accumulator <- accumulator op imm
        4 | 5 => {
            let dest = if size == OperandSize::Bits8 {
                cpu.state.read_reg8(GPR_RAX, true)
            } else {
                cpu.state.read_gpr_sized(GPR_RAX, size)
            };
            let src = immediate_for(inst, size);
            let result = apply_binop(&mut fl, op, dest, src, bytes);
            cpu.state.rflags = fl;
            if let Some(result) = result {
                cpu.state.write_gpr_sized(GPR_RAX, size, result);
            }
        }
        _ => unreachable!(),
    }
    Ok(Flow::Next)
}

/// Immediate value widened for the operand size; 64-bit forms sign-extend
/// their 32-bit immediate.
fn immediate_for(inst: &Instruction, size: OperandSize) -> u64 {
    match size {
        OperandSize::Bits64 => sign_extend(inst.imm, 4) as u64,
        _ => inst.imm & size.mask(),
    }
}

/// Group 1: ALU r/m, imm (0x80/0x81/0x83).
pub(super) fn group1_imm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let op = inst.modrm.map(|m| m.reg()).unwrap_or(0);
    let size = inst.operand_size();
    let src = if inst.opcode == 0x83 {
        sign_extend(inst.imm, 1) as u64 & size.mask()
    } else {
        immediate_for(inst, size)
    };
    let dest = read_rm(cpu, bus, inst, pc, size)?;
    let mut fl = cpu.state.rflags;
    let result = apply_binop(&mut fl, op, dest, src, size.bytes());
    cpu.state.rflags = fl;
    if let Some(result) = result {
        write_rm(cpu, bus, inst, pc, size, result)?;
    }
    Ok(Flow::Next)
}

/// Group 2 shifts and rotates (0xC0/0xC1 imm8, 0xD0/0xD1 by 1, 0xD2/0xD3 by CL).
pub(super) fn group2_shift<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let bytes = size.bytes();
    let count = match inst.opcode {
        0xC0 | 0xC1 => inst.imm,
        0xD0 | 0xD1 => 1,
        _ => cpu.state.read_gpr(GPR_RCX) & 0xFF,
    };
    let dest = read_rm(cpu, bus, inst, pc, size)?;
    let mut fl = cpu.state.rflags;
    let result = match inst.modrm.map(|m| m.reg()).unwrap_or(0) {
        0 => rol_with_flags(&mut fl, dest, count, bytes),
        1 => ror_with_flags(&mut fl, dest, count, bytes),
        2 => rcl(&mut fl, dest, count, bytes),
        3 => rcr(&mut fl, dest, count, bytes),
        4 | 6 => shl_with_flags(&mut fl, dest, count, bytes),
        5 => shr_with_flags(&mut fl, dest, count, bytes),
        7 => sar_with_flags(&mut fl, dest, count, bytes),
        _ => unreachable!(),
    };
    cpu.state.rflags = fl;
    write_rm(cpu, bus, inst, pc, size, result)?;
    Ok(Flow::Next)
}

/// Rotate through carry, left.
fn rcl(fl: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let bits = size as u32 * 8;
    let count = (count & if size == 8 { 0x3F } else { 0x1F }) as u32 % (bits + 1);
    if count == 0 {
        return dest & mask_for_size(size);
    }
    let mut value = dest & mask_for_size(size);
    let mut cf = fl.contains(RFlags::CF);
    for _ in 0..count {
        let new_cf = value >> (bits - 1) & 1 != 0;
        value = ((value << 1) | cf as u64) & mask_for_size(size);
        cf = new_cf;
    }
    fl.set(RFlags::CF, cf);
    if count == 1 {
        fl.set(RFlags::OF, (value >> (bits - 1) & 1 != 0) != cf);
    }
    value
}

/// Rotate through carry, right.
fn rcr(fl: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let bits = size as u32 * 8;
    let count = (count & if size == 8 { 0x3F } else { 0x1F }) as u32 % (bits + 1);
    if count == 0 {
        return dest & mask_for_size(size);
    }
    let mut value = dest & mask_for_size(size);
    let mut cf = fl.contains(RFlags::CF);
    for _ in 0..count {
        let new_cf = value & 1 != 0;
        value = (value >> 1) | ((cf as u64) << (bits - 1));
        cf = new_cf;
    }
    fl.set(RFlags::CF, cf);
    value
}

/// Group 3 (0xF6/0xF7): TEST, NOT, NEG, MUL, IMUL, DIV, IDIV.
pub(super) fn group3<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let bytes = size.bytes();
    let rm = read_rm(cpu, bus, inst, pc, size)?;

    match inst.modrm.map(|m| m.reg()).unwrap_or(0) {
        0 | 1 => {
            let imm = immediate_for(inst, size);
            let mut fl = cpu.state.rflags;
            logic_with_flags(&mut fl, rm & imm, bytes);
            cpu.state.rflags = fl;
        }
        2 => write_rm(cpu, bus, inst, pc, size, !rm)?,
        3 => {
            let mut fl = cpu.state.rflags;
            let result = neg_with_flags(&mut fl, rm, bytes);
            cpu.state.rflags = fl;
            write_rm(cpu, bus, inst, pc, size, result)?;
        }
        4 => mul_unsigned(cpu, rm, size),
        5 => imul_one_operand(cpu, rm, size),
        6 => div_unsigned(cpu, rm, size)?,
        7 => div_signed(cpu, rm, size)?,
        _ => unreachable!(),
    }
    Ok(Flow::Next)
}

fn mul_unsigned(cpu: &mut Cpu, src: u64, size: OperandSize) {
    let mut fl = cpu.state.rflags;
    match size {
        OperandSize::Bits8 => {
            let product = (cpu.state.read_gpr(GPR_RAX) & 0xFF) * (src & 0xFF);
            cpu.state.write_gpr_sized(GPR_RAX, OperandSize::Bits16, product);
            mul_flags(&mut fl, product > 0xFF);
        }
        _ => {
            let a = cpu.state.read_gpr_sized(GPR_RAX, size);
            let product = (a as u128) * (src as u128);
            let mask = size.mask() as u128;
            cpu.state.write_gpr_sized(GPR_RAX, size, product as u64);
            cpu.state
                .write_gpr_sized(GPR_RDX, size, (product >> (size.bytes() * 8)) as u64);
            mul_flags(&mut fl, product > mask);
        }
    }
    cpu.state.rflags = fl;
}

fn imul_one_operand(cpu: &mut Cpu, src: u64, size: OperandSize) {
    let bytes = size.bytes();
    let mut fl = cpu.state.rflags;
    match size {
        OperandSize::Bits8 => {
            let a = sign_extend(cpu.state.read_gpr(GPR_RAX), 1);
            let product = a * sign_extend(src, 1);
            cpu.state
                .write_gpr_sized(GPR_RAX, OperandSize::Bits16, product as u64);
            mul_flags(&mut fl, product != sign_extend(product as u64, 1));
        }
        _ => {
            let a = sign_extend(cpu.state.read_gpr(GPR_RAX), bytes) as i128;
            let product = a * sign_extend(src, bytes) as i128;
            let low = product as u64 & size.mask();
            cpu.state.write_gpr_sized(GPR_RAX, size, low);
            cpu.state
                .write_gpr_sized(GPR_RDX, size, (product >> (bytes * 8)) as u64);
            mul_flags(&mut fl, product != sign_extend(low, bytes) as i128);
        }
    }
    cpu.state.rflags = fl;
}

/// DIV: unsigned divide of the double-width accumulator pair.
///
/// Divide-by-zero and quotient overflow raise #DE with RAX/RDX untouched.
fn div_unsigned(cpu: &mut Cpu, divisor: u64, size: OperandSize) -> Result<(), CpuError> {
    if divisor == 0 {
        return Err(CpuError::Divide);
    }
    match size {
        OperandSize::Bits8 => {
            let dividend = cpu.state.read_gpr(GPR_RAX) & 0xFFFF;
            let q = dividend / divisor;
            if q > 0xFF {
                return Err(CpuError::Divide);
            }
            let r = dividend % divisor;
            // AL = quotient, AH = remainder.
            cpu.state
                .write_gpr_sized(GPR_RAX, OperandSize::Bits16, q | (r << 8));
        }
        _ => {
            let bits = size.bytes() * 8;
            let high = cpu.state.read_gpr_sized(GPR_RDX, size) as u128;
            let low = cpu.state.read_gpr_sized(GPR_RAX, size) as u128;
            let dividend = (high << bits) | low;
            let q = dividend / divisor as u128;
            if q > size.mask() as u128 {
                return Err(CpuError::Divide);
            }
            let r = dividend % divisor as u128;
            cpu.state.write_gpr_sized(GPR_RAX, size, q as u64);
            cpu.state.write_gpr_sized(GPR_RDX, size, r as u64);
        }
    }
    Ok(())
}

fn div_signed(cpu: &mut Cpu, divisor_raw: u64, size: OperandSize) -> Result<(), CpuError> {
    let bytes = size.bytes();
    let divisor = sign_extend(divisor_raw, bytes) as i128;
    if divisor == 0 {
        return Err(CpuError::Divide);
    }
    match size {
        OperandSize::Bits8 => {
            let dividend = cpu.state.read_gpr(GPR_RAX) as u16 as i16 as i128;
            let q = dividend / divisor;
            let r = dividend % divisor;
            if q > i8::MAX as i128 || q < i8::MIN as i128 {
                return Err(CpuError::Divide);
            }
            cpu.state.write_gpr_sized(
                GPR_RAX,
                OperandSize::Bits16,
                (q as u64 & 0xFF) | ((r as u64 & 0xFF) << 8),
            );
        }
        _ => {
            let bits = bytes * 8;
            let high = cpu.state.read_gpr_sized(GPR_RDX, size) as u128;
            let low = cpu.state.read_gpr_sized(GPR_RAX, size) as u128;
            let dividend = ((high << bits) | low) as i128;
            // Shift into the signed double-width range.
            let dividend = dividend << (128 - 2 * bits) >> (128 - 2 * bits);
            let q = dividend / divisor;
            let r = dividend % divisor;
            let max = (1i128 << (bits - 1)) - 1;
            if q > max || q < -max - 1 {
                return Err(CpuError::Divide);
            }
            cpu.state.write_gpr_sized(GPR_RAX, size, q as u64);
            cpu.state.write_gpr_sized(GPR_RDX, size, r as u64);
        }
    }
    Ok(())
}

/// Group 4 (0xFE): INC/DEC r/m8. CF is preserved.
pub(super) fn group4_inc_dec<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let rm = read_rm(cpu, bus, inst, pc, OperandSize::Bits8)?;
    let mut fl = cpu.state.rflags;
    let result = match inst.modrm.map(|m| m.reg()).unwrap_or(0) {
        0 => inc_with_flags(&mut fl, rm, 1),
        _ => dec_with_flags(&mut fl, rm, 1),
    };
    cpu.state.rflags = fl;
    write_rm(cpu, bus, inst, pc, OperandSize::Bits8, result)?;
    Ok(Flow::Next)
}

/// Group 5 (0xFF): INC/DEC/CALL/JMP/PUSH r/m.
pub(super) fn group5<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    match inst.modrm.map(|m| m.reg()).unwrap_or(0) {
        0 | 1 => {
            let size = inst.operand_size();
            let rm = read_rm(cpu, bus, inst, pc, size)?;
            let mut fl = cpu.state.rflags;
            let result = if inst.modrm.map(|m| m.reg()) == Some(0) {
                inc_with_flags(&mut fl, rm, size.bytes())
            } else {
                dec_with_flags(&mut fl, rm, size.bytes())
            };
            cpu.state.rflags = fl;
            write_rm(cpu, bus, inst, pc, size, result)?;
            Ok(Flow::Next)
        }
        2 => {
            // CALL r/m64: near indirect.
            let target = read_rm(cpu, bus, inst, pc, OperandSize::Bits64)?;
            flow::push64(cpu, bus, pc.wrapping_add(inst.len as u64))?;
            cpu.state.rip = target;
            Ok(Flow::Jump)
        }
        4 => {
            let target = read_rm(cpu, bus, inst, pc, OperandSize::Bits64)?;
            cpu.state.rip = target;
            Ok(Flow::Jump)
        }
        6 => {
            let value = read_rm(cpu, bus, inst, pc, OperandSize::Bits64)?;
            flow::push64(cpu, bus, value)?;
            Ok(Flow::Next)
        }
        reg => {
            tracing::warn!(reg, "unsupported group-5 form, halting");
            cpu.state.halted = true;
            Ok(Flow::Next)
        }
    }
}

/// MOV between register and r/m (0x88..0x8B).
pub(super) fn mov_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    if inst.opcode & 2 == 0 {
        let value = read_reg_operand(cpu, inst, size);
        write_rm(cpu, bus, inst, pc, size, value)?;
    } else {
        let value = read_rm(cpu, bus, inst, pc, size)?;
        write_reg_operand(cpu, inst, size, value);
    }
    Ok(Flow::Next)
}

/// MOV accumulator to/from an absolute 64-bit address (0xA0..0xA3).
pub(super) fn mov_moffs<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
) -> Result<Flow, CpuError> {
    let addr = inst.imm;
    let size = if inst.opcode & 1 == 0 {
        OperandSize::Bits8
    } else {
        inst.operand_size()
    };
    if inst.opcode < 0xA2 {
        let value = bus.read_sized(addr, size.bytes())?;
        cpu.state.write_gpr_sized(GPR_RAX, size, value);
    } else {
        let value = cpu.state.read_gpr_sized(GPR_RAX, size);
        bus.write_sized(addr, size.bytes(), value)?;
    }
    Ok(Flow::Next)
}

/// MOV r, imm (0xB0..0xBF).
pub(super) fn mov_imm_reg(cpu: &mut Cpu, inst: &Instruction) -> Result<Flow, CpuError> {
    if inst.opcode < 0xB8 {
        cpu.state
            .write_reg8(inst.opcode_reg(), inst.rex.is_some(), inst.imm);
    } else {
        // B8+r with REX.W carries a full 64-bit immediate.
        cpu.state
            .write_gpr_sized(inst.opcode_reg(), inst.operand_size(), inst.imm);
    }
    Ok(Flow::Next)
}

/// MOV r/m, imm (0xC6/0xC7).
pub(super) fn mov_imm_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let value = immediate_for(inst, size);
    write_rm(cpu, bus, inst, pc, size, value)?;
    Ok(Flow::Next)
}

/// LEA: effective address without the memory access.
pub(super) fn lea(cpu: &mut Cpu, inst: &Instruction, pc: u64) -> Result<Flow, CpuError> {
    if let Some(m) = inst.memory_ref() {
        let addr = effective_addr(&cpu.state, inst, pc, &m);
        cpu.state
            .write_gpr_sized(inst.modrm_reg(), inst.operand_size(), addr);
    }
    Ok(Flow::Next)
}

/// MOVSXD r64, r/m32 (0x63).
pub(super) fn movsxd<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let src = read_rm(cpu, bus, inst, pc, OperandSize::Bits32)?;
    let size = inst.operand_size();
    write_reg_operand(cpu, inst, size, sign_extend(src, 4) as u64);
    Ok(Flow::Next)
}

/// MOVZX/MOVSX (0x0FB6/0x0FB7/0x0FBE/0x0FBF).
pub(super) fn movzx_movsx<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let src_size = if inst.opcode & 1 == 0 {
        OperandSize::Bits8
    } else {
        OperandSize::Bits16
    };
    let src = read_rm(cpu, bus, inst, pc, src_size)?;
    let value = if inst.opcode >= 0x0FBE {
        sign_extend(src, src_size.bytes()) as u64
    } else {
        src
    };
    write_reg_operand(cpu, inst, inst.operand_size(), value);
    Ok(Flow::Next)
}

/// IMUL r, r/m, imm (0x69/0x6B).
pub(super) fn imul_imm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let src = read_rm(cpu, bus, inst, pc, size)?;
    let imm = if inst.opcode == 0x6B {
        sign_extend(inst.imm, 1)
    } else {
        sign_extend(inst.imm, 4.min(size.bytes()))
    };
    imul_flags_truncate(cpu, inst, size, src, imm as i128);
    Ok(Flow::Next)
}

/// IMUL r, r/m (0x0FAF).
pub(super) fn imul_reg<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let src = read_rm(cpu, bus, inst, pc, size)?;
    let dest = sign_extend(read_reg_operand(cpu, inst, size), size.bytes()) as i128;
    imul_flags_truncate(cpu, inst, size, src, dest);
    Ok(Flow::Next)
}

fn imul_flags_truncate(
    cpu: &mut Cpu,
    inst: &Instruction,
    size: OperandSize,
    src: u64,
    other: i128,
) {
    let bytes = size.bytes();
    let product = sign_extend(src, bytes) as i128 * other;
    let low = product as u64 & size.mask();
    let mut fl = cpu.state.rflags;
    mul_flags(&mut fl, product != sign_extend(low, bytes) as i128);
    cpu.state.rflags = fl;
    write_reg_operand(cpu, inst, size, low);
}

/// TEST r/m, r (0x84/0x85).
pub(super) fn test_rm_reg<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let a = read_rm(cpu, bus, inst, pc, size)?;
    let b = read_reg_operand(cpu, inst, size);
    let mut fl = cpu.state.rflags;
    logic_with_flags(&mut fl, a & b, size.bytes());
    cpu.state.rflags = fl;
    Ok(Flow::Next)
}

/// TEST accumulator, imm (0xA8/0xA9).
pub(super) fn test_acc_imm(cpu: &mut Cpu, inst: &Instruction) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let a = cpu.state.read_gpr_sized(GPR_RAX, size);
    let mut fl = cpu.state.rflags;
    logic_with_flags(&mut fl, a & immediate_for(inst, size), size.bytes());
    cpu.state.rflags = fl;
    Ok(Flow::Next)
}

/// XCHG r/m, r (0x86/0x87).
pub(super) fn xchg_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let rm = read_rm(cpu, bus, inst, pc, size)?;
    let reg = read_reg_operand(cpu, inst, size);
    write_rm(cpu, bus, inst, pc, size, reg)?;
    write_reg_operand(cpu, inst, size, rm);
    Ok(Flow::Next)
}

/// XCHG accumulator, r (0x91..0x97).
pub(super) fn xchg_acc(cpu: &mut Cpu, inst: &Instruction) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let reg = inst.opcode_reg();
    let a = cpu.state.read_gpr_sized(GPR_RAX, size);
    let b = cpu.state.read_gpr_sized(reg, size);
    cpu.state.write_gpr_sized(GPR_RAX, size, b);
    cpu.state.write_gpr_sized(reg, size, a);
    Ok(Flow::Next)
}

/// CBW/CWDE/CDQE (0x98): sign-extend the accumulator in place.
pub(super) fn sign_extend_acc(cpu: &mut Cpu, inst: &Instruction) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let half = size.bytes() / 2;
    let value = sign_extend(cpu.state.read_gpr(GPR_RAX), half) as u64;
    cpu.state.write_gpr_sized(GPR_RAX, size, value);
    Ok(Flow::Next)
}

/// CWD/CDQ/CQO (0x99): sign-fill RDX from the accumulator.
pub(super) fn sign_extend_acc_pair(cpu: &mut Cpu, inst: &Instruction) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let a = sign_extend(cpu.state.read_gpr(GPR_RAX), size.bytes());
    let fill = if a < 0 { u64::MAX } else { 0 };
    cpu.state.write_gpr_sized(GPR_RDX, size, fill);
    Ok(Flow::Next)
}

/// CMOVcc (0x0F40..0x0F4F). The destination is written even when the
/// condition is false, so a 32-bit form always zero-extends.
pub(super) fn cmovcc<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let src = read_rm(cpu, bus, inst, pc, size)?;
    let value = if condition(cpu.state.rflags, (inst.opcode & 0xF) as u8) {
        src
    } else {
        read_reg_operand(cpu, inst, size)
    };
    write_reg_operand(cpu, inst, size, value);
    Ok(Flow::Next)
}

/// SETcc (0x0F90..0x0F9F).
pub(super) fn setcc<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let value = condition(cpu.state.rflags, (inst.opcode & 0xF) as u8) as u64;
    write_rm(cpu, bus, inst, pc, OperandSize::Bits8, value)?;
    Ok(Flow::Next)
}

/// BT/BTS/BTR/BTC r/m, r (0x0FA3/0x0FAB/0x0FB3/0x0FBB).
pub(super) fn bt_reg<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let bits = size.bytes() as u64 * 8;
    let offset = read_reg_operand(cpu, inst, size);
    let op = ((inst.opcode >> 3) & 3) as u8; // 0 BT, 1 BTS, 2 BTR, 3 BTC

    if let Some(m) = inst.memory_ref() {
        // Memory forms address the bit string relative to the operand.
        let signed = sign_extend(offset, size.bytes());
        let addr = effective_addr(&cpu.state, inst, pc, &m).wrapping_add((signed >> 3) as u64);
        let bit = (signed & 7) as u32;
        let byte = bus.read_u8(addr)?;
        cpu.state.rflags.set(RFlags::CF, byte as u64 >> bit & 1 != 0);
        if let Some(updated) = bt_update(op, byte as u64, bit) {
            bus.write_u8(addr, updated as u8)?;
        }
    } else {
        let bit = (offset % bits) as u32;
        let value = cpu.state.read_gpr_sized(inst.modrm_rm(), size);
        let rm = inst.modrm_rm();
        let state = &mut cpu.state;
        let cf = value >> bit & 1 != 0;
        state.rflags.set(RFlags::CF, cf);
        if let Some(updated) = bt_update(op, value, bit) {
            state.write_gpr_sized(rm, size, updated);
        }
    }
    Ok(Flow::Next)
}

fn bt_update(op: u8, value: u64, bit: u32) -> Option<u64> {
    match op {
        0 => None,
        1 => Some(value | 1 << bit),
        2 => Some(value & !(1 << bit)),
        _ => Some(value ^ 1 << bit),
    }
}

/// Group 8 (0x0FBA): BT/BTS/BTR/BTC r/m, imm8.
pub(super) fn bt_imm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let bits = size.bytes() as u64 * 8;
    let bit = (inst.imm % bits) as u32;
    let op = match inst.modrm.map(|m| m.reg()) {
        Some(4) => 0,
        Some(5) => 1,
        Some(6) => 2,
        Some(7) => 3,
        _ => {
            cpu.state.halted = true;
            return Ok(Flow::Next);
        }
    };
    let value = read_rm(cpu, bus, inst, pc, size)?;
    cpu.state.rflags.set(RFlags::CF, value >> bit & 1 != 0);
    if let Some(updated) = bt_update(op, value, bit) {
        write_rm(cpu, bus, inst, pc, size, updated)?;
    }
    Ok(Flow::Next)
}

/// BSF/BSR (0x0FBC/0x0FBD). A zero source sets ZF and leaves the destination
/// unchanged.
pub(super) fn bit_scan<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
) -> Result<Flow, CpuError> {
    let size = inst.operand_size();
    let src = read_rm(cpu, bus, inst, pc, size)?;
    if src == 0 {
        cpu.state.rflags.set(RFlags::ZF, true);
        return Ok(Flow::Next);
    }
    cpu.state.rflags.set(RFlags::ZF, false);
    let index = if inst.opcode == 0x0FBC {
        src.trailing_zeros()
    } else {
        63 - src.leading_zeros()
    };
    write_reg_operand(cpu, inst, size, index as u64);
    Ok(Flow::Next)
}

/// BSWAP r (0x0FC8+r).
pub(super) fn bswap(cpu: &mut Cpu, inst: &Instruction) -> Result<Flow, CpuError> {
    let reg = inst.opcode_reg();
    let size = inst.operand_size();
    let value = cpu.state.read_gpr_sized(reg, size);
    let swapped = match size {
        OperandSize::Bits64 => value.swap_bytes(),
        _ => (value as u32).swap_bytes() as u64,
    };
    cpu.state.write_gpr_sized(reg, size, swapped);
    Ok(Flow::Next)
}

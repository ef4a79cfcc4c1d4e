//! Lowering from decoded instructions to block IR.
//!
//! Only the 64-bit register-to-register and simple-addressing subset lowers
//! to real IR; anything outside it becomes a `Bailout` that hands the rest of
//! the block back to the interpreter. Flag-setting ALU ops are lowered with
//! `set_flags` on; a later pass strips the ones nothing observes.

use orion_x86::{Instruction, OperandSize};

use crate::block::{BasicBlock, BlockInst};
use crate::ir::{BinOp, BlockIr, CmpOp, IrOp, MemSize, Operand, Place};

/// Lower a basic block. Always produces a terminated block: the final op is
/// an `Exit`, `ExitIf`, or `Bailout`.
pub fn lower_block(block: &BasicBlock) -> BlockIr {
    let mut ir = BlockIr::default();

    let n = block.insts.len();
    for (i, bi) in block.insts.iter().enumerate() {
        // CMP + Jcc at the end of the block fuses into Cmp/ExitIf. The IR
        // evaluator still materializes the compare's flags, so resumed
        // interpretation observes the same RFLAGS either way.
        if i + 2 == n && try_fuse_cmp_jcc(&mut ir, bi, &block.insts[i + 1]) {
            return ir;
        }
        if !lower_inst(&mut ir, bi) {
            ir.ops.push(IrOp::Bailout { rip: bi.pc });
            return ir;
        }
    }

    // Fell off the end (instruction cap): continue at the fall-through pc.
    let next = block.entry.wrapping_add(block.byte_len);
    if !matches!(
        ir.ops.last(),
        Some(IrOp::Exit { .. } | IrOp::ExitIf { .. } | IrOp::Bailout { .. })
    ) {
        ir.ops.push(IrOp::Exit {
            next_rip: Operand::Imm(next as i64),
        });
    }
    ir
}

/// Returns false when the instruction cannot be expressed in IR.
fn lower_inst(ir: &mut BlockIr, bi: &BlockInst) -> bool {
    let inst = &bi.inst;

    // Prefixed forms and sub-64-bit operand sizes stay in the interpreter:
    // partial-register merge semantics are not modeled in IR.
    if inst.prefixes.lock || inst.prefixes.rep.is_some() || inst.prefixes.segment.is_some() {
        return false;
    }

    match inst.opcode {
        // MOV r64, imm.
        0xB8..=0xBF if wide(inst) => {
            ir.ops.push(IrOp::Set {
                dst: Place::Reg(inst.opcode_reg()),
                src: Operand::Imm(inst.imm as i64),
            });
            true
        }
        // MOV r/m64, r64 and MOV r64, r/m64.
        0x89 if wide(inst) => lower_mov_store_or_reg(ir, inst),
        0x8B if wide(inst) => lower_mov_load_or_reg(ir, inst),
        // MOV r/m64, imm32 (sign-extended).
        0xC7 if wide(inst) && inst.modrm.is_some_and(|m| m.reg() == 0) => {
            let imm = Operand::Imm(inst.imm as u32 as i32 as i64);
            match simple_mem(ir, inst) {
                MemOrReg::Reg(reg) => {
                    ir.ops.push(IrOp::Set {
                        dst: Place::Reg(reg),
                        src: imm,
                    });
                    true
                }
                MemOrReg::Mem(addr) => {
                    ir.ops.push(IrOp::Store {
                        addr,
                        value: imm,
                        size: MemSize::U64,
                    });
                    true
                }
                MemOrReg::Unsupported => false,
            }
        }
        // ALU r/m64, r64 register forms.
        0x01 | 0x09 | 0x21 | 0x29 | 0x31 if wide(inst) && is_reg_direct(inst) => {
            let op = alu_binop(inst.opcode);
            let dst = inst.modrm_rm();
            ir.ops.push(IrOp::Bin {
                dst: Place::Reg(dst),
                op,
                lhs: Operand::Reg(dst),
                rhs: Operand::Reg(inst.modrm_reg()),
                set_flags: true,
            });
            true
        }
        // ALU r64, r/m64 register forms.
        0x03 | 0x0B | 0x23 | 0x2B | 0x33 if wide(inst) && is_reg_direct(inst) => {
            let op = alu_binop(inst.opcode & !0x02);
            let dst = inst.modrm_reg();
            ir.ops.push(IrOp::Bin {
                dst: Place::Reg(dst),
                op,
                lhs: Operand::Reg(dst),
                rhs: Operand::Reg(inst.modrm_rm()),
                set_flags: true,
            });
            true
        }
        // Group 1 with immediate, register destination, ADD/SUB/AND/OR/XOR.
        0x81 | 0x83 if wide(inst) && is_reg_direct(inst) => {
            let op = match inst.modrm.map(|m| m.reg()) {
                Some(0) => BinOp::Add,
                Some(1) => BinOp::Or,
                Some(4) => BinOp::And,
                Some(5) => BinOp::Sub,
                Some(6) => BinOp::Xor,
                _ => return false, // ADC/SBB/CMP carry or flag semantics
            };
            let imm = if inst.opcode == 0x83 {
                inst.imm as u8 as i8 as i64
            } else {
                inst.imm as u32 as i32 as i64
            };
            let dst = inst.modrm_rm();
            ir.ops.push(IrOp::Bin {
                dst: Place::Reg(dst),
                op,
                lhs: Operand::Reg(dst),
                rhs: Operand::Imm(imm),
                set_flags: true,
            });
            true
        }
        // SHL/SHR/SAR r64, imm8.
        0xC1 if wide(inst) && is_reg_direct(inst) => {
            let op = match inst.modrm.map(|m| m.reg()) {
                Some(4 | 6) => BinOp::Shl,
                Some(5) => BinOp::ShrU,
                Some(7) => BinOp::SarS,
                _ => return false,
            };
            let dst = inst.modrm_rm();
            ir.ops.push(IrOp::Bin {
                dst: Place::Reg(dst),
                op,
                lhs: Operand::Reg(dst),
                rhs: Operand::Imm((inst.imm & 0x3F) as i64),
                set_flags: true,
            });
            true
        }
        // IMUL r64, r/m64 register form; flags are CF/OF only and the pass
        // pipeline treats them like the other ALU writers.
        0x0FAF if wide(inst) && is_reg_direct(inst) => {
            let dst = inst.modrm_reg();
            ir.ops.push(IrOp::Bin {
                dst: Place::Reg(dst),
                op: BinOp::Mul,
                lhs: Operand::Reg(dst),
                rhs: Operand::Reg(inst.modrm_rm()),
                set_flags: true,
            });
            true
        }
        // LEA r64 with a lowerable address.
        0x8D if wide(inst) => {
            if let Some(addr) = lower_addr(ir, inst) {
                ir.ops.push(IrOp::Set {
                    dst: Place::Reg(inst.modrm_reg()),
                    src: addr,
                });
                true
            } else {
                false
            }
        }
        // JMP rel: block terminator with a static target.
        0xE9 | 0xEB => {
            ir.ops.push(IrOp::Exit {
                next_rip: Operand::Imm(inst.branch_target(bi.pc) as i64),
            });
            true
        }
        0x90 => true, // NOP lowers to nothing
        _ => false,
    }
}

/// Fuse `cmp; jcc` into `Cmp` + `ExitIf` when both sides fit the IR subset.
fn try_fuse_cmp_jcc(ir: &mut BlockIr, cmp: &BlockInst, jcc: &BlockInst) -> bool {
    let ci = &cmp.inst;
    if !wide(ci) || !is_reg_direct(ci) || ci.prefixes.segment.is_some() {
        return false;
    }
    let (lhs, rhs) = match ci.opcode {
        0x39 => (Operand::Reg(ci.modrm_rm()), Operand::Reg(ci.modrm_reg())),
        0x3B => (Operand::Reg(ci.modrm_reg()), Operand::Reg(ci.modrm_rm())),
        0x81 if ci.modrm.is_some_and(|m| m.reg() == 7) => (
            Operand::Reg(ci.modrm_rm()),
            Operand::Imm(ci.imm as u32 as i32 as i64),
        ),
        0x83 if ci.modrm.is_some_and(|m| m.reg() == 7) => (
            Operand::Reg(ci.modrm_rm()),
            Operand::Imm(ci.imm as u8 as i8 as i64),
        ),
        _ => return false,
    };

    let ji = &jcc.inst;
    let cc = match ji.opcode {
        op if (0x70..=0x7F).contains(&op) => (op & 0xF) as u8,
        op if (0x0F80..=0x0F8F).contains(&op) => (op & 0xF) as u8,
        _ => return false,
    };
    let op = match cc {
        0x2 => CmpOp::LtU,
        0x3 => CmpOp::GeU,
        0x4 => CmpOp::Eq,
        0x5 => CmpOp::Ne,
        0xC => CmpOp::LtS,
        0xD => CmpOp::GeS,
        _ => return false,
    };

    let t = ir.new_temp();
    ir.ops.push(IrOp::Cmp {
        dst: Place::Temp(t),
        op,
        lhs,
        rhs,
    });
    ir.ops.push(IrOp::ExitIf {
        cond: Operand::Temp(t),
        next_rip: Operand::Imm(ji.branch_target(jcc.pc) as i64),
        fallthrough_rip: jcc.pc.wrapping_add(ji.len as u64),
    });
    true
}

fn wide(inst: &Instruction) -> bool {
    inst.operand_size() == OperandSize::Bits64
}

fn is_reg_direct(inst: &Instruction) -> bool {
    inst.modrm.is_some_and(|m| m.mode() == 3)
}

fn alu_binop(opcode: u32) -> BinOp {
    match opcode {
        0x01 => BinOp::Add,
        0x09 => BinOp::Or,
        0x21 => BinOp::And,
        0x29 => BinOp::Sub,
        0x31 => BinOp::Xor,
        _ => unreachable!(),
    }
}

enum MemOrReg {
    Reg(u8),
    Mem(Operand),
    Unsupported,
}

/// Classify the r/m operand: register-direct, or a lowerable address.
fn simple_mem(ir: &mut BlockIr, inst: &Instruction) -> MemOrReg {
    if is_reg_direct(inst) {
        return MemOrReg::Reg(inst.modrm_rm());
    }
    match lower_addr(ir, inst) {
        Some(addr) => MemOrReg::Mem(addr),
        None => MemOrReg::Unsupported,
    }
}

/// Lower `[base + index*scale + disp]` into an operand, emitting address
/// arithmetic on temps as needed. RIP-relative forms are not lowered (the
/// IR has no notion of the current instruction pointer).
fn lower_addr(ir: &mut BlockIr, inst: &Instruction) -> Option<Operand> {
    let m = inst.memory_ref()?;
    if m.rip_relative {
        return None;
    }

    let mut operand = match m.base {
        Some(base) => Operand::Reg(base),
        None => Operand::Imm(0),
    };

    if let Some(index) = m.index {
        let scaled = if m.scale == 1 {
            Operand::Reg(index)
        } else {
            let t = ir.new_temp();
            ir.ops.push(IrOp::Bin {
                dst: Place::Temp(t),
                op: BinOp::Shl,
                lhs: Operand::Reg(index),
                rhs: Operand::Imm(m.scale.trailing_zeros() as i64),
                set_flags: false,
            });
            Operand::Temp(t)
        };
        let t = ir.new_temp();
        ir.ops.push(IrOp::Bin {
            dst: Place::Temp(t),
            op: BinOp::Add,
            lhs: operand,
            rhs: scaled,
            set_flags: false,
        });
        operand = Operand::Temp(t);
    }

    if m.disp != 0 {
        let t = ir.new_temp();
        ir.ops.push(IrOp::Bin {
            dst: Place::Temp(t),
            op: BinOp::Add,
            lhs: operand,
            rhs: Operand::Imm(m.disp as i64),
            set_flags: false,
        });
        operand = Operand::Temp(t);
    }
    Some(operand)
}

fn lower_mov_store_or_reg(ir: &mut BlockIr, inst: &Instruction) -> bool {
    match simple_mem(ir, inst) {
        MemOrReg::Reg(rm) => {
            ir.ops.push(IrOp::Set {
                dst: Place::Reg(rm),
                src: Operand::Reg(inst.modrm_reg()),
            });
            true
        }
        MemOrReg::Mem(addr) => {
            ir.ops.push(IrOp::Store {
                addr,
                value: Operand::Reg(inst.modrm_reg()),
                size: MemSize::U64,
            });
            true
        }
        MemOrReg::Unsupported => false,
    }
}

fn lower_mov_load_or_reg(ir: &mut BlockIr, inst: &Instruction) -> bool {
    match simple_mem(ir, inst) {
        MemOrReg::Reg(rm) => {
            ir.ops.push(IrOp::Set {
                dst: Place::Reg(inst.modrm_reg()),
                src: Operand::Reg(rm),
            });
            true
        }
        MemOrReg::Mem(addr) => {
            ir.ops.push(IrOp::Load {
                dst: Place::Reg(inst.modrm_reg()),
                addr,
                size: MemSize::U64,
            });
            true
        }
        MemOrReg::Unsupported => false,
    }
}

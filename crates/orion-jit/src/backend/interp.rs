//! Interpreter-side execution of compiled blocks.
//!
//! `replay` drives the decoded instructions through the execution engine
//! and is the semantic oracle for the other backends. `eval_ir` runs the
//! optimized block IR directly; flag-setting ops and compares go through
//! the engine's flag helpers, so architectural RFLAGS is exact at every
//! exit even when the compare was fused into the terminator.

use orion_cpu::{flags, Cpu, CpuBus, CpuError, RFlags};

use crate::backend::CompiledBlock;
use crate::ir::{BinOp, BlockIr, CmpOp, IrOp, Operand, Place};
use crate::opt::passes::const_fold::eval_binop;

/// How IR evaluation left the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrExit {
    /// Block ran to an exit; continue at this address.
    Jump(u64),
    /// Unlowerable instruction reached; the interpreter resumes here.
    Bailout(u64),
}

/// Replay the block's instructions one at a time.
///
/// Stops early when an instruction redirects RIP out of the block (taken
/// branch, delivered fault) or halts the CPU; the remaining entries belong
/// to a path not taken.
pub fn replay<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    block: &CompiledBlock,
) -> Result<(), CpuError> {
    for bi in &block.insts {
        if cpu.state.halted || !cpu.state.running || cpu.state.rip != bi.pc {
            break;
        }
        cpu.execute_decoded(bus, &bi.inst, bi.pc)?;
        cpu.state.inst_count = cpu.state.inst_count.wrapping_add(1);
    }
    Ok(())
}

/// Evaluate block IR against live CPU state.
pub fn eval_ir<B: CpuBus>(cpu: &mut Cpu, bus: &mut B, ir: &BlockIr) -> Result<IrExit, CpuError> {
    let mut temps = vec![0u64; ir.temp_count as usize];

    let value = |operand: Operand, temps: &[u64], cpu: &Cpu| -> u64 {
        match operand {
            Operand::Imm(v) => v as u64,
            Operand::Reg(r) => cpu.state.read_gpr(r),
            Operand::Temp(t) => temps[t.0 as usize],
        }
    };

    for op in &ir.ops {
        match op {
            IrOp::Set { dst, src } => {
                let v = value(*src, &temps, cpu);
                write_place(cpu, &mut temps, *dst, v);
            }
            IrOp::Bin {
                dst,
                op,
                lhs,
                rhs,
                set_flags,
            } => {
                let a = value(*lhs, &temps, cpu);
                let b = value(*rhs, &temps, cpu);
                let v = if *set_flags {
                    bin_with_flags(&mut cpu.state.rflags, *op, a, b)
                } else {
                    eval_binop(*op, a as i64, b as i64) as u64
                };
                write_place(cpu, &mut temps, *dst, v);
            }
            IrOp::Cmp { dst, op, lhs, rhs } => {
                let a = value(*lhs, &temps, cpu);
                let b = value(*rhs, &temps, cpu);
                // The fused CMP still owns the architectural flags.
                flags::cmp_with_flags(&mut cpu.state.rflags, a, b, 8);
                let taken = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::LtU => a < b,
                    CmpOp::GeU => a >= b,
                    CmpOp::LtS => (a as i64) < (b as i64),
                    CmpOp::GeS => (a as i64) >= (b as i64),
                };
                write_place(cpu, &mut temps, *dst, taken as u64);
            }
            IrOp::Load { dst, addr, size } => {
                let addr = value(*addr, &temps, cpu);
                let v = bus.read_sized(addr, size.bytes())?;
                write_place(cpu, &mut temps, *dst, v);
            }
            IrOp::Store { addr, value: v, size } => {
                let addr = value(*addr, &temps, cpu);
                let v = value(*v, &temps, cpu);
                bus.write_sized(addr, size.bytes(), v)?;
            }
            IrOp::Exit { next_rip } => {
                return Ok(IrExit::Jump(value(*next_rip, &temps, cpu)));
            }
            IrOp::ExitIf {
                cond,
                next_rip,
                fallthrough_rip,
            } => {
                return Ok(if value(*cond, &temps, cpu) != 0 {
                    IrExit::Jump(value(*next_rip, &temps, cpu))
                } else {
                    IrExit::Jump(*fallthrough_rip)
                });
            }
            IrOp::Bailout { rip } => return Ok(IrExit::Bailout(*rip)),
        }
    }
    unreachable!("lowered blocks always terminate")
}

fn write_place(cpu: &mut Cpu, temps: &mut [u64], place: Place, value: u64) {
    match place {
        Place::Reg(r) => cpu.state.write_gpr(r, value),
        Place::Temp(t) => temps[t.0 as usize] = value,
    }
}

/// Flag-exact 64-bit binary op, sharing the interpreter's helpers.
fn bin_with_flags(fl: &mut RFlags, op: BinOp, a: u64, b: u64) -> u64 {
    match op {
        BinOp::Add => flags::add_with_flags(fl, a, b, false, 8),
        BinOp::Sub => flags::sub_with_flags(fl, a, b, false, 8),
        BinOp::And => flags::logic_with_flags(fl, a & b, 8),
        BinOp::Or => flags::logic_with_flags(fl, a | b, 8),
        BinOp::Xor => flags::logic_with_flags(fl, a ^ b, 8),
        BinOp::Shl => flags::shl_with_flags(fl, a, b, 8),
        BinOp::ShrU => flags::shr_with_flags(fl, a, b, 8),
        BinOp::SarS => flags::sar_with_flags(fl, a, b, 8),
        BinOp::Mul => {
            let full = (a as i64 as i128).wrapping_mul(b as i64 as i128);
            let result = full as u64;
            flags::mul_flags(fl, full != result as i64 as i128);
            result
        }
    }
}

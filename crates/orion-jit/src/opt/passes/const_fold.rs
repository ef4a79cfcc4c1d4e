//! Constant propagation and folding over temps.
//!
//! Temps are single-assignment, so a temp defined by an immediate can be
//! substituted everywhere. Ops that still set architectural flags are left
//! in place (their operands may still be substituted).

use std::collections::HashMap;

use crate::ir::{BinOp, BlockIr, IrOp, Operand, Place, Temp};

pub fn eval_binop(op: BinOp, lhs: i64, rhs: i64) -> i64 {
    let (a, b) = (lhs as u64, rhs as u64);
    let r = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32 & 63),
        BinOp::ShrU => a.wrapping_shr(b as u32 & 63),
        BinOp::SarS => ((a as i64).wrapping_shr(b as u32 & 63)) as u64,
        BinOp::Mul => a.wrapping_mul(b),
    };
    r as i64
}

pub fn run(ir: &mut BlockIr) -> bool {
    let mut consts: HashMap<Temp, i64> = HashMap::new();
    let mut changed = false;

    let mut subst = |operand: &mut Operand, consts: &HashMap<Temp, i64>, changed: &mut bool| {
        if let Operand::Temp(t) = operand {
            if let Some(&v) = consts.get(t) {
                *operand = Operand::Imm(v);
                *changed = true;
            }
        }
    };

    for op in &mut ir.ops {
        match op {
            IrOp::Set { dst, src } => {
                subst(src, &consts, &mut changed);
                if let (Place::Temp(t), Operand::Imm(v)) = (*dst, *src) {
                    consts.insert(t, v);
                }
            }
            IrOp::Bin {
                dst,
                op: bin,
                lhs,
                rhs,
                set_flags,
            } => {
                subst(lhs, &consts, &mut changed);
                subst(rhs, &consts, &mut changed);
                if let (Operand::Imm(a), Operand::Imm(b)) = (*lhs, *rhs) {
                    // Folding away a flag write would lose the flags.
                    if !*set_flags {
                        let v = eval_binop(*bin, a, b);
                        if let Place::Temp(t) = *dst {
                            consts.insert(t, v);
                        }
                        *op = IrOp::Set {
                            dst: *dst,
                            src: Operand::Imm(v),
                        };
                        changed = true;
                    }
                }
            }
            IrOp::Cmp { lhs, rhs, .. } => {
                subst(lhs, &consts, &mut changed);
                subst(rhs, &consts, &mut changed);
            }
            IrOp::Load { addr, .. } => subst(addr, &consts, &mut changed),
            IrOp::Store { addr, value, .. } => {
                subst(addr, &consts, &mut changed);
                subst(value, &consts, &mut changed);
            }
            IrOp::Exit { next_rip } => subst(next_rip, &consts, &mut changed),
            IrOp::ExitIf { cond, next_rip, .. } => {
                subst(cond, &consts, &mut changed);
                subst(next_rip, &consts, &mut changed);
            }
            IrOp::Bailout { .. } => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_chains_of_immediates() {
        let mut ir = BlockIr::default();
        let t0 = ir.new_temp();
        let t1 = ir.new_temp();
        ir.ops = vec![
            IrOp::Set {
                dst: Place::Temp(t0),
                src: Operand::Imm(10),
            },
            IrOp::Bin {
                dst: Place::Temp(t1),
                op: BinOp::Shl,
                lhs: Operand::Temp(t0),
                rhs: Operand::Imm(2),
                set_flags: false,
            },
            IrOp::Set {
                dst: Place::Reg(0),
                src: Operand::Temp(t1),
            },
        ];
        assert!(run(&mut ir));
        assert_eq!(
            ir.ops[2],
            IrOp::Set {
                dst: Place::Reg(0),
                src: Operand::Imm(40),
            }
        );
    }

    #[test]
    fn flag_setting_ops_are_not_folded_away() {
        let mut ir = BlockIr::default();
        ir.ops = vec![IrOp::Bin {
            dst: Place::Reg(0),
            op: BinOp::Add,
            lhs: Operand::Imm(1),
            rhs: Operand::Imm(2),
            set_flags: true,
        }];
        run(&mut ir);
        assert!(matches!(ir.ops[0], IrOp::Bin { .. }));
    }

    #[test]
    fn shift_counts_are_masked() {
        assert_eq!(eval_binop(BinOp::Shl, 1, 65), 2);
        assert_eq!(eval_binop(BinOp::SarS, -8, 1), -4);
    }
}

//! Common subexpression elimination over flag-free binary ops.
//!
//! Temps are single-assignment, so an expression stays valid until one of
//! its GPR operands is redefined. Loads are never merged: a store in
//! between could change the value.

use std::collections::HashMap;

use crate::ir::{BinOp, BlockIr, Gpr, IrOp, Operand, Place, Temp};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ExprKey {
    op: BinOp,
    lhs: Operand,
    rhs: Operand,
}

impl ExprKey {
    fn mentions_reg(&self, reg: Gpr) -> bool {
        self.lhs == Operand::Reg(reg) || self.rhs == Operand::Reg(reg)
    }
}

pub fn run(ir: &mut BlockIr) -> bool {
    let mut avail: HashMap<ExprKey, Temp> = HashMap::new();
    let mut changed = false;

    for op in &mut ir.ops {
        // A GPR write invalidates expressions that read that GPR.
        let clobbered = match op {
            IrOp::Set { dst: Place::Reg(r), .. }
            | IrOp::Bin { dst: Place::Reg(r), .. }
            | IrOp::Cmp { dst: Place::Reg(r), .. }
            | IrOp::Load { dst: Place::Reg(r), .. } => Some(*r),
            _ => None,
        };

        if let IrOp::Bin {
            dst: Place::Temp(t),
            op: bin,
            lhs,
            rhs,
            set_flags: false,
        } = op
        {
            let key = ExprKey {
                op: *bin,
                lhs: *lhs,
                rhs: *rhs,
            };
            if let Some(&prev) = avail.get(&key) {
                *op = IrOp::Set {
                    dst: Place::Temp(*t),
                    src: Operand::Temp(prev),
                };
                changed = true;
            } else {
                avail.insert(key, *t);
            }
        }

        if let Some(reg) = clobbered {
            avail.retain(|key, _| !key.mentions_reg(reg));
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(dst: Temp, lhs: Operand, rhs: Operand) -> IrOp {
        IrOp::Bin {
            dst: Place::Temp(dst),
            op: BinOp::Add,
            lhs,
            rhs,
            set_flags: false,
        }
    }

    #[test]
    fn repeated_expression_becomes_a_copy() {
        let mut ir = BlockIr::default();
        let t0 = ir.new_temp();
        let t1 = ir.new_temp();
        ir.ops = vec![
            add(t0, Operand::Reg(1), Operand::Imm(8)),
            add(t1, Operand::Reg(1), Operand::Imm(8)),
        ];
        assert!(run(&mut ir));
        assert_eq!(
            ir.ops[1],
            IrOp::Set {
                dst: Place::Temp(t1),
                src: Operand::Temp(t0),
            }
        );
    }

    #[test]
    fn reg_redefinition_invalidates() {
        let mut ir = BlockIr::default();
        let t0 = ir.new_temp();
        let t1 = ir.new_temp();
        ir.ops = vec![
            add(t0, Operand::Reg(1), Operand::Imm(8)),
            IrOp::Set {
                dst: Place::Reg(1),
                src: Operand::Imm(0),
            },
            add(t1, Operand::Reg(1), Operand::Imm(8)),
        ];
        assert!(!run(&mut ir));
        assert!(matches!(ir.ops[2], IrOp::Bin { .. }));
    }
}

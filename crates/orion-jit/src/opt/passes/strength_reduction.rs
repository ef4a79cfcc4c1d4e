//! Multiply-by-power-of-two to shift rewriting.
//!
//! Shift flag semantics differ from IMUL, so only flag-free multiplies are
//! touched. Multiplies by 0 and 1 are the peephole pass's business.

use crate::ir::{BinOp, BlockIr, IrOp, Operand};

pub fn run(ir: &mut BlockIr) -> bool {
    let mut changed = false;
    for op in &mut ir.ops {
        let IrOp::Bin {
            op: bin @ BinOp::Mul,
            lhs,
            rhs,
            set_flags: false,
            ..
        } = op
        else {
            continue;
        };

        // Multiplication commutes; put the constant on the right.
        if matches!(*lhs, Operand::Imm(_)) && !matches!(*rhs, Operand::Imm(_)) {
            std::mem::swap(lhs, rhs);
            changed = true;
        }
        if let Operand::Imm(c) = *rhs {
            let c = c as u64;
            if c.is_power_of_two() && c > 1 {
                *bin = BinOp::Shl;
                *rhs = Operand::Imm(c.trailing_zeros() as i64);
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Place;

    fn mul(lhs: Operand, rhs: Operand) -> IrOp {
        IrOp::Bin {
            dst: Place::Reg(0),
            op: BinOp::Mul,
            lhs,
            rhs,
            set_flags: false,
        }
    }

    #[test]
    fn power_of_two_multiply_becomes_shift() {
        let mut ir = BlockIr {
            ops: vec![
                mul(Operand::Reg(1), Operand::Imm(8)),
                mul(Operand::Imm(16), Operand::Reg(2)),
            ],
            ..Default::default()
        };
        assert!(run(&mut ir));
        assert_eq!(
            ir.ops[0],
            IrOp::Bin {
                dst: Place::Reg(0),
                op: BinOp::Shl,
                lhs: Operand::Reg(1),
                rhs: Operand::Imm(3),
                set_flags: false,
            }
        );
        assert_eq!(
            ir.ops[1],
            IrOp::Bin {
                dst: Place::Reg(0),
                op: BinOp::Shl,
                lhs: Operand::Reg(2),
                rhs: Operand::Imm(4),
                set_flags: false,
            }
        );
    }

    #[test]
    fn non_power_and_flagged_multiplies_survive() {
        let flagged = IrOp::Bin {
            dst: Place::Reg(0),
            op: BinOp::Mul,
            lhs: Operand::Reg(1),
            rhs: Operand::Imm(4),
            set_flags: true,
        };
        let mut ir = BlockIr {
            ops: vec![mul(Operand::Reg(1), Operand::Imm(6)), flagged.clone()],
            ..Default::default()
        };
        assert!(!run(&mut ir));
        assert_eq!(ir.ops[1], flagged);
    }
}

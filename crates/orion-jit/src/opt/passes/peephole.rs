//! Local algebraic simplifications.
//!
//! Only flag-free ops are rewritten: `add rax, 0` with live flags still
//! clears CF and must stay.

use crate::ir::{BinOp, BlockIr, IrOp, Operand, Place};

pub fn run(ir: &mut BlockIr) -> bool {
    let mut changed = false;

    for op in &mut ir.ops {
        let IrOp::Bin {
            dst,
            op: bin,
            lhs,
            rhs,
            set_flags: false,
        } = op
        else {
            continue;
        };

        let simplified = match (*bin, *lhs, *rhs) {
            (BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor, l, Operand::Imm(0)) => Some(l),
            (BinOp::Add | BinOp::Or | BinOp::Xor, Operand::Imm(0), r) => Some(r),
            (BinOp::Shl | BinOp::ShrU | BinOp::SarS, l, Operand::Imm(0)) => Some(l),
            (BinOp::Mul, l, Operand::Imm(1)) | (BinOp::Mul, Operand::Imm(1), l) => Some(l),
            (BinOp::Mul | BinOp::And, _, Operand::Imm(0))
            | (BinOp::Mul | BinOp::And, Operand::Imm(0), _) => Some(Operand::Imm(0)),
            (BinOp::Xor | BinOp::Sub, l, r) if l == r && !matches!(l, Operand::Imm(_)) => {
                Some(Operand::Imm(0))
            }
            (BinOp::And | BinOp::Or, l, r) if l == r => Some(l),
            _ => None,
        };
        if let Some(src) = simplified {
            *op = IrOp::Set { dst: *dst, src };
            changed = true;
        }
    }

    // Self-moves contribute nothing.
    let before = ir.ops.len();
    ir.ops.retain(|op| {
        !matches!(
            op,
            IrOp::Set {
                dst: Place::Reg(d),
                src: Operand::Reg(s),
            } if d == s
        )
    });
    changed || ir.ops.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinOp, lhs: Operand, rhs: Operand) -> IrOp {
        IrOp::Bin {
            dst: Place::Reg(0),
            op,
            lhs,
            rhs,
            set_flags: false,
        }
    }

    #[test]
    fn identities_collapse_to_moves() {
        let mut ir = BlockIr {
            ops: vec![
                bin(BinOp::Add, Operand::Reg(1), Operand::Imm(0)),
                bin(BinOp::Mul, Operand::Reg(2), Operand::Imm(1)),
                bin(BinOp::Xor, Operand::Reg(3), Operand::Reg(3)),
            ],
            ..Default::default()
        };
        assert!(run(&mut ir));
        assert_eq!(
            ir.ops,
            vec![
                IrOp::Set {
                    dst: Place::Reg(0),
                    src: Operand::Reg(1),
                },
                IrOp::Set {
                    dst: Place::Reg(0),
                    src: Operand::Reg(2),
                },
                IrOp::Set {
                    dst: Place::Reg(0),
                    src: Operand::Imm(0),
                },
            ]
        );
    }

    #[test]
    fn flag_setting_identity_is_untouched() {
        let keep = IrOp::Bin {
            dst: Place::Reg(0),
            op: BinOp::Add,
            lhs: Operand::Reg(0),
            rhs: Operand::Imm(0),
            set_flags: true,
        };
        let mut ir = BlockIr {
            ops: vec![keep.clone()],
            ..Default::default()
        };
        assert!(!run(&mut ir));
        assert_eq!(ir.ops, vec![keep]);
    }

    #[test]
    fn self_moves_are_dropped() {
        let mut ir = BlockIr {
            ops: vec![IrOp::Set {
                dst: Place::Reg(5),
                src: Operand::Reg(5),
            }],
            ..Default::default()
        };
        assert!(run(&mut ir));
        assert!(ir.ops.is_empty());
    }
}

//! Dead flag-write elimination.
//!
//! Flags escape a block only through its final state: the interpreter that
//! resumes after the exit sees whatever the last flag writer produced. Every
//! earlier flag write in a straight-line block is overwritten before it can
//! be observed, so its `set_flags` can be dropped, unlocking folding of the
//! op itself.

use crate::ir::{BlockIr, IrOp};

pub fn run(ir: &mut BlockIr) -> bool {
    let last_writer = ir
        .ops
        .iter()
        .rposition(|op| matches!(op, IrOp::Bin { set_flags: true, .. } | IrOp::Cmp { .. }));
    let Some(last) = last_writer else {
        return false;
    };

    let mut changed = false;
    for op in &mut ir.ops[..last] {
        if let IrOp::Bin { set_flags, .. } = op {
            if *set_flags {
                *set_flags = false;
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, Operand, Place};

    fn bin(flags: bool) -> IrOp {
        IrOp::Bin {
            dst: Place::Reg(0),
            op: BinOp::Add,
            lhs: Operand::Reg(0),
            rhs: Operand::Imm(1),
            set_flags: flags,
        }
    }

    #[test]
    fn only_last_writer_keeps_flags() {
        let mut ir = BlockIr {
            ops: vec![bin(true), bin(true), bin(true)],
            ..Default::default()
        };
        assert!(run(&mut ir));
        assert_eq!(ir.ops, vec![bin(false), bin(false), bin(true)]);
        // Idempotent.
        assert!(!run(&mut ir));
    }

    #[test]
    fn cmp_counts_as_a_flag_writer() {
        let mut ir = BlockIr::default();
        let t = ir.new_temp();
        ir.ops = vec![
            bin(true),
            IrOp::Cmp {
                dst: Place::Temp(t),
                op: crate::ir::CmpOp::Eq,
                lhs: Operand::Reg(0),
                rhs: Operand::Imm(0),
            },
        ];
        assert!(run(&mut ir));
        assert_eq!(ir.ops[0], bin(false));
    }
}

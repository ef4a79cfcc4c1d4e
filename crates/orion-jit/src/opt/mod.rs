//! Block IR optimization pipeline.
//!
//! Each pass is `run(&mut BlockIr) -> bool` (whether anything changed).
//! Opt level selects the set:
//!   0: nothing
//!   1: flag elimination, constant folding, dead code elimination
//!   2: level 1 plus CSE, peephole, strength reduction, scheduling
//!   3: level 2 plus analysis hints (advisory, never transforming)

pub mod passes;

use crate::ir::BlockIr;

/// Run the pipeline for `opt_level`, iterating the transforming passes to a
/// fixpoint (bounded, in case two passes ping-pong).
pub fn run_pipeline(ir: &mut BlockIr, opt_level: u8) -> u32 {
    let mut total = 0u32;
    if opt_level == 0 {
        return 0;
    }

    for _ in 0..8 {
        let mut changed = false;
        changed |= passes::flag_elim::run(ir);
        changed |= passes::const_fold::run(ir);
        if opt_level >= 2 {
            changed |= passes::cse::run(ir);
            changed |= passes::peephole::run(ir);
            changed |= passes::strength_reduction::run(ir);
            changed |= passes::sched::run(ir);
        }
        changed |= passes::dce::run(ir);
        if !changed {
            break;
        }
        total += 1;
    }

    if opt_level >= 3 {
        passes::hints::run(ir);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, IrOp, Operand, Place};

    #[test]
    fn pipeline_folds_through_dead_temps() {
        // t0 = 2; t1 = t0 + 3; rax = t1  ==>  rax = 5 with both temps gone.
        let mut ir = BlockIr::default();
        let t0 = ir.new_temp();
        let t1 = ir.new_temp();
        ir.ops = vec![
            IrOp::Set {
                dst: Place::Temp(t0),
                src: Operand::Imm(2),
            },
            IrOp::Bin {
                dst: Place::Temp(t1),
                op: BinOp::Add,
                lhs: Operand::Temp(t0),
                rhs: Operand::Imm(3),
                set_flags: false,
            },
            IrOp::Set {
                dst: Place::Reg(0),
                src: Operand::Temp(t1),
            },
            IrOp::Exit {
                next_rip: Operand::Imm(0x100),
            },
        ];

        run_pipeline(&mut ir, 2);
        assert_eq!(
            ir.ops,
            vec![
                IrOp::Set {
                    dst: Place::Reg(0),
                    src: Operand::Imm(5),
                },
                IrOp::Exit {
                    next_rip: Operand::Imm(0x100),
                },
            ]
        );
    }

    #[test]
    fn level_zero_is_identity() {
        let mut ir = BlockIr::default();
        let t = ir.new_temp();
        ir.ops = vec![IrOp::Set {
            dst: Place::Temp(t),
            src: Operand::Imm(1),
        }];
        let before = ir.clone();
        run_pipeline(&mut ir, 0);
        assert_eq!(ir, before);
    }
}

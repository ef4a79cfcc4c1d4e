//! Block-local scheduling: pure temp definitions sink toward their first
//! use, shortening live ranges ahead of linear-scan allocation.
//!
//! Only flag-free ops that define a temp and touch no memory move. A def
//! never crosses a write to a GPR it reads, and never crosses a block
//! terminator.

use crate::ir::{BlockIr, Gpr, IrOp, Operand, Place, Temp};

pub fn run(ir: &mut BlockIr) -> bool {
    let mut changed = false;
    let mut i = ir.ops.len();
    while i > 0 {
        i -= 1;
        let Some(def) = sinkable_def(&ir.ops[i]) else {
            continue;
        };
        let Some(first_use) = ir.ops[i + 1..]
            .iter()
            .position(|op| uses_temp(op, def))
            .map(|off| i + 1 + off)
        else {
            // No user in the block; dead-code elimination owns this case.
            continue;
        };

        let reads = gpr_reads(&ir.ops[i]);
        let mut stop = first_use;
        for j in i + 1..first_use {
            if writes_any_gpr(&ir.ops[j], &reads) || is_terminator(&ir.ops[j]) {
                stop = j;
                break;
            }
        }
        if stop > i + 1 {
            let op = ir.ops.remove(i);
            ir.ops.insert(stop - 1, op);
            changed = true;
        }
    }
    changed
}

fn sinkable_def(op: &IrOp) -> Option<Temp> {
    match op {
        IrOp::Set {
            dst: Place::Temp(t),
            ..
        } => Some(*t),
        IrOp::Bin {
            dst: Place::Temp(t),
            set_flags: false,
            ..
        } => Some(*t),
        _ => None,
    }
}

fn uses_temp(op: &IrOp, t: Temp) -> bool {
    let mut used = false;
    op.for_each_use(|operand| used |= *operand == Operand::Temp(t));
    used
}

fn gpr_reads(op: &IrOp) -> Vec<Gpr> {
    let mut regs = Vec::new();
    op.for_each_use(|operand| {
        if let Operand::Reg(r) = operand {
            regs.push(*r);
        }
    });
    regs
}

fn writes_any_gpr(op: &IrOp, regs: &[Gpr]) -> bool {
    let dst = match op {
        IrOp::Set { dst, .. }
        | IrOp::Bin { dst, .. }
        | IrOp::Cmp { dst, .. }
        | IrOp::Load { dst, .. } => dst,
        _ => return false,
    };
    matches!(dst, Place::Reg(r) if regs.contains(r))
}

fn is_terminator(op: &IrOp) -> bool {
    matches!(
        op,
        IrOp::Exit { .. } | IrOp::ExitIf { .. } | IrOp::Bailout { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defs_sink_to_their_first_use() {
        let mut ir = BlockIr::default();
        let t0 = ir.new_temp();
        ir.ops = vec![
            IrOp::Set {
                dst: Place::Temp(t0),
                src: Operand::Imm(7),
            },
            IrOp::Set {
                dst: Place::Reg(1),
                src: Operand::Imm(1),
            },
            IrOp::Set {
                dst: Place::Reg(2),
                src: Operand::Imm(2),
            },
            IrOp::Set {
                dst: Place::Reg(0),
                src: Operand::Temp(t0),
            },
            IrOp::Exit {
                next_rip: Operand::Imm(0x100),
            },
        ];

        assert!(run(&mut ir));
        assert_eq!(
            ir.ops[2],
            IrOp::Set {
                dst: Place::Temp(t0),
                src: Operand::Imm(7),
            }
        );
        assert_eq!(
            ir.ops[3],
            IrOp::Set {
                dst: Place::Reg(0),
                src: Operand::Temp(t0),
            }
        );
        // Already adjacent to its use; a second run moves nothing.
        assert!(!run(&mut ir));
    }

    #[test]
    fn operand_redefinition_blocks_the_sink() {
        let mut ir = BlockIr::default();
        let t0 = ir.new_temp();
        let before = vec![
            IrOp::Bin {
                dst: Place::Temp(t0),
                op: crate::ir::BinOp::Add,
                lhs: Operand::Reg(0),
                rhs: Operand::Imm(1),
                set_flags: false,
            },
            IrOp::Set {
                dst: Place::Reg(0),
                src: Operand::Imm(5),
            },
            IrOp::Set {
                dst: Place::Reg(3),
                src: Operand::Temp(t0),
            },
            IrOp::Exit {
                next_rip: Operand::Imm(0x100),
            },
        ];
        ir.ops = before.clone();

        assert!(!run(&mut ir));
        assert_eq!(ir.ops, before);
    }
}

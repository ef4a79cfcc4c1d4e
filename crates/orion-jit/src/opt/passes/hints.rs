//! Advisory analysis hints. Never transforms the block.
//!
//! Backends are free to ignore every hint; nothing here affects
//! architectural state.

use crate::ir::{BlockIr, IrOp, Operand};

/// Blocks at most this many ops long qualify as unroll candidates.
const UNROLL_MAX_OPS: usize = 16;

pub fn run(ir: &mut BlockIr) -> bool {
    let mut hints = ir.hints;

    // Static branch prediction for the terminating conditional exit:
    // backward branches are loop latches and predicted taken.
    let cond_exit = ir.ops.iter().rev().find_map(|op| match op {
        IrOp::ExitIf {
            next_rip: Operand::Imm(target),
            fallthrough_rip,
            ..
        } => Some((*target as u64, *fallthrough_rip)),
        _ => None,
    });
    if let Some((target, fallthrough)) = cond_exit {
        let backward = target < fallthrough;
        hints.predict_taken = Some(backward);
        hints.unroll_candidate = backward && ir.ops.len() <= UNROLL_MAX_OPS;
    }

    hints.vector_stride = detect_stride(ir);

    let changed = hints != ir.hints;
    ir.hints = hints;
    changed
}

/// Offset of a memory address relative to some base operand. Addresses are
/// either the base itself (offset 0) or a temp defined as `base + imm`.
fn address_offset(ir: &BlockIr, addr: &Operand) -> Option<(Operand, i64)> {
    if let Operand::Temp(t) = addr {
        for op in &ir.ops {
            if op.def_temp() == Some(*t) {
                if let IrOp::Bin {
                    op: crate::ir::BinOp::Add,
                    lhs,
                    rhs: Operand::Imm(d),
                    set_flags: false,
                    ..
                } = op
                {
                    return Some((*lhs, *d));
                }
                return Some((*addr, 0));
            }
        }
    }
    Some((*addr, 0))
}

/// Constant positive stride shared by every memory access off one base.
fn detect_stride(ir: &BlockIr) -> Option<u32> {
    let mut accesses: Vec<(Operand, i64)> = Vec::new();
    for op in &ir.ops {
        let addr = match op {
            IrOp::Load { addr, .. } | IrOp::Store { addr, .. } => addr,
            _ => continue,
        };
        accesses.push(address_offset(ir, addr)?);
    }
    if accesses.len() < 2 {
        return None;
    }

    let base = accesses[0].0;
    if accesses.iter().any(|(b, _)| *b != base) {
        return None;
    }
    let stride = accesses[1].1 - accesses[0].1;
    if stride <= 0 {
        return None;
    }
    for pair in accesses.windows(2) {
        if pair[1].1 - pair[0].1 != stride {
            return None;
        }
    }
    u32::try_from(stride).ok()
}

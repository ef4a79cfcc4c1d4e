//! Dead code elimination for unused temp definitions.
//!
//! A `Cmp` is never removed even when its temp is unused: it materializes
//! architectural flags, and if it is the block's last flag writer those
//! flags are what resumed interpretation observes.

use std::collections::HashSet;

use crate::ir::{BlockIr, IrOp, Operand, Temp};

pub fn run(ir: &mut BlockIr) -> bool {
    let mut changed = false;
    loop {
        let mut used: HashSet<Temp> = HashSet::new();
        for op in &ir.ops {
            op.for_each_use(|operand| {
                if let Operand::Temp(t) = operand {
                    used.insert(*t);
                }
            });
        }

        let before = ir.ops.len();
        ir.ops.retain(|op| {
            if op.has_side_effect() || matches!(op, IrOp::Cmp { .. }) {
                return true;
            }
            match op.def_temp() {
                Some(t) => used.contains(&t),
                None => true,
            }
        });
        if ir.ops.len() == before {
            return changed;
        }
        changed = true;
    }
}

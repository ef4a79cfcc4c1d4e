//! Live-range computation for block temporaries.
//!
//! Temps are single-assignment and blocks are straight-line, so a live range
//! is just `[definition index, last use index]`.

use crate::ir::{BlockIr, Operand, Temp};

/// Register/spill decision for one temp, filled in by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Index into the allocator's register pool.
    Reg(u8),
    /// Byte offset below the frame base, always negative and 8-aligned.
    Spill(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub temp: Temp,
    pub start: usize,
    pub end: usize,
    /// Use count; denser ranges are costlier to spill.
    pub spill_cost: u32,
    pub assignment: Option<Assignment>,
}

/// Compute live ranges, ordered by definition point.
pub fn live_ranges(ir: &BlockIr) -> Vec<LiveRange> {
    let mut ranges: Vec<Option<LiveRange>> = vec![None; ir.temp_count as usize];

    for (idx, op) in ir.ops.iter().enumerate() {
        if let Some(t) = op.def_temp() {
            ranges[t.0 as usize] = Some(LiveRange {
                temp: t,
                start: idx,
                end: idx,
                spill_cost: 0,
                assignment: None,
            });
        }
        op.for_each_use(|operand| {
            if let Operand::Temp(t) = operand {
                if let Some(range) = ranges[t.0 as usize].as_mut() {
                    range.end = idx;
                    range.spill_cost += 1;
                }
            }
        });
    }

    let mut out: Vec<LiveRange> = ranges.into_iter().flatten().collect();
    out.sort_by_key(|r| r.start);
    out
}

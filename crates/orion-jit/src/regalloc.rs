//! Linear-scan register allocation over block live ranges.
//!
//! Allocation never fails: when the pool is exhausted, the active range with
//! the furthest end point is evicted to a spill slot. Spill slots are 8-byte
//! stack offsets below the frame base, handed out lazily so short blocks pay
//! nothing.

use crate::liveness::{Assignment, LiveRange};

#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub ranges: Vec<LiveRange>,
    /// Total spill area required, in bytes.
    pub spill_bytes: u32,
}

pub fn allocate(mut ranges: Vec<LiveRange>, pool_size: usize) -> AllocationResult {
    debug_assert!(pool_size > 0);
    // Indices into `ranges` currently holding a register, kept sorted by end.
    let mut active: Vec<usize> = Vec::new();
    let mut free: Vec<u8> = (0..pool_size as u8).rev().collect();
    let mut next_spill: i32 = 0;

    let mut alloc_slot = |next_spill: &mut i32| {
        *next_spill -= 8;
        Assignment::Spill(*next_spill)
    };

    for i in 0..ranges.len() {
        let start = ranges[i].start;

        // Expire ranges that ended before this one starts.
        active.retain(|&j| {
            if ranges[j].end < start {
                if let Some(Assignment::Reg(r)) = ranges[j].assignment {
                    free.push(r);
                }
                false
            } else {
                true
            }
        });

        if let Some(reg) = free.pop() {
            ranges[i].assignment = Some(Assignment::Reg(reg));
            active.push(i);
            continue;
        }

        // Pool exhausted: evict whichever live range ends furthest away,
        // unless the new range itself ends last.
        let &victim = active
            .iter()
            .max_by_key(|&&j| ranges[j].end)
            .expect("pool exhausted implies active ranges");
        if ranges[victim].end > ranges[i].end {
            let reg = match ranges[victim].assignment {
                Some(Assignment::Reg(r)) => r,
                _ => unreachable!("active ranges hold registers"),
            };
            ranges[victim].assignment = Some(alloc_slot(&mut next_spill));
            active.retain(|&j| j != victim);
            ranges[i].assignment = Some(Assignment::Reg(reg));
            active.push(i);
        } else {
            ranges[i].assignment = Some(alloc_slot(&mut next_spill));
        }
    }

    AllocationResult {
        spill_bytes: next_spill.unsigned_abs(),
        ranges,
    }
}

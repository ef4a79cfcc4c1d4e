//! Allocator invariants: returned virtual ranges never overlap and every
//! allocated page translates to its own physical frame.

use std::collections::HashSet;

use orion_mmu::{page_align_up, Mmu, Protection, PAGE_SIZE};
use proptest::prelude::*;

proptest! {
    #[test]
    fn allocations_are_disjoint_and_translatable(
        sizes in prop::collection::vec(1u64..4 * PAGE_SIZE, 1..16),
    ) {
        let mmu = Mmu::new(PAGE_SIZE, 1 << 24);
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        let mut frames = HashSet::new();

        for &size in &sizes {
            let vbase = mmu.allocate_virtual_memory(size, Protection::RW).unwrap();
            let aligned = page_align_up(size);

            for &(start, len) in &ranges {
                prop_assert!(vbase + aligned <= start || start + len <= vbase);
            }
            for page in (0..aligned).step_by(PAGE_SIZE as usize) {
                let paddr = mmu.translate(vbase + page, Protection::WRITE).unwrap();
                prop_assert!(frames.insert(paddr & !(PAGE_SIZE - 1)));
            }
            ranges.push((vbase, aligned));
        }
    }
}

//! The cache must be transparent: bytes read through it always equal what
//! a cacheless flat store would return, across fills, evictions, and
//! bypassing accesses.

use orion_mem::{CacheSim, PhysMemory};
use proptest::prelude::*;

const MEM_SIZE: usize = 0x8000;

proptest! {
    #[test]
    fn cached_reads_match_a_flat_shadow(
        writes in prop::collection::vec(
            (0u64..(MEM_SIZE as u64 - 8), any::<u64>(), 1usize..=8),
            1..128,
        ),
    ) {
        let mut phys = PhysMemory::new(MEM_SIZE);
        // Tiny geometry so the sequence forces evictions.
        let mut cache = CacheSim::new(4, 2);
        let mut shadow = vec![0u8; MEM_SIZE];

        for &(addr, value, len) in &writes {
            let bytes = &value.to_le_bytes()[..len];
            cache.write(&mut phys, addr, bytes).unwrap();
            shadow[addr as usize..addr as usize + len].copy_from_slice(bytes);
        }

        let mut buf = [0u8; 64];
        for addr in (0..MEM_SIZE as u64).step_by(64) {
            cache.read(&mut phys, addr, &mut buf).unwrap();
            prop_assert_eq!(&buf[..], &shadow[addr as usize..addr as usize + 64]);
        }
    }
}

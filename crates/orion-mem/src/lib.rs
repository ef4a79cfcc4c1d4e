//! Physical memory backing store and the L1 cache simulator.
//!
//! [`PhysMemory`] is the authoritative flat byte array. [`CacheSim`] is a
//! set-associative write-through cache that sits in front of it on the
//! load/store path; it exists for latency accounting and must never change
//! the bytes an access observes.

mod cache;
mod phys;

pub use cache::{CacheSim, CacheStats, LINE_SIZE};
pub use phys::PhysMemory;

use thiserror::Error;

/// Physical memory access error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("physical access out of bounds: {paddr:#x}+{len}")]
    OutOfBounds { paddr: u64, len: usize },
}

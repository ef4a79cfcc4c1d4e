//! Entry-pc-keyed cache of compiled blocks.
//!
//! Writes into guest code must invalidate synchronously: the memory system
//! calls [`TraceCache::invalidate_range`] before the write completes, so a
//! stale translation can never run after the bytes underneath it changed.
//! Blocks already executing keep their `Arc` and finish; only future
//! lookups are affected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::backend::CompiledBlock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceCacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub invalidated_blocks: u64,
}

#[derive(Default)]
pub struct TraceCache {
    blocks: Mutex<HashMap<u64, Arc<CompiledBlock>>>,
    lookups: AtomicU64,
    hits: AtomicU64,
    invalidated: AtomicU64,
}

impl TraceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, pc: u64) -> Option<Arc<CompiledBlock>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.blocks.lock().unwrap().get(&pc).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Whether a translation exists, without touching hit statistics.
    pub fn contains(&self, pc: u64) -> bool {
        self.blocks.lock().unwrap().contains_key(&pc)
    }

    /// Publish a translation, replacing any previous one for the entry.
    pub fn insert(&self, block: Arc<CompiledBlock>) {
        self.blocks.lock().unwrap().insert(block.entry, block);
    }

    /// Drop every block overlapping `[start, start + len)`. Returns how many
    /// were removed.
    pub fn invalidate_range(&self, start: u64, len: u64) -> usize {
        if len == 0 {
            return 0;
        }
        let mut blocks = self.blocks.lock().unwrap();
        let before = blocks.len();
        blocks.retain(|_, block| !block.overlaps(start, len));
        let removed = before - blocks.len();
        if removed > 0 {
            self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
            trace!(
                start = format_args!("{start:#x}"),
                len,
                removed,
                "trace cache invalidation"
            );
        }
        removed
    }

    pub fn clear(&self) {
        self.blocks.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TraceCacheStats {
        TraceCacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            invalidated_blocks: self.invalidated.load(Ordering::Relaxed),
        }
    }
}

use crate::Protection;

/// Number of TLB slots.
pub const TLB_ENTRIES: usize = 256;

/// One cached translation. `vpage`/`ppage` are page-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpage: u64,
    pub ppage: u64,
    pub protection: Protection,
}

/// Fixed-size translation cache with round-robin replacement.
///
/// The TLB is advisory: a hit with insufficient cached protection must fall
/// back to the page table, because the entry may predate a protection change.
#[derive(Debug)]
pub struct Tlb {
    entries: [Option<TlbEntry>; TLB_ENTRIES],
    next_slot: usize,
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: [None; TLB_ENTRIES],
            next_slot: 0,
        }
    }

    pub fn lookup(&mut self, vpage: u64) -> Option<TlbEntry> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.vpage == vpage)
            .copied()
    }

    /// Insert a translation, replacing any existing entry for the same page,
    /// otherwise taking the next round-robin slot.
    pub fn insert(&mut self, entry: TlbEntry) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(e) if e.vpage == entry.vpage) {
                *slot = Some(entry);
                return;
            }
        }
        self.entries[self.next_slot] = Some(entry);
        self.next_slot = (self.next_slot + 1) % TLB_ENTRIES;
    }

    pub fn flush(&mut self) {
        self.entries = [None; TLB_ENTRIES];
        self.next_slot = 0;
    }

    pub fn flush_page(&mut self, vpage: u64) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(e) if e.vpage == vpage) {
                *slot = None;
            }
        }
    }

    /// Drop every entry whose page overlaps `[vbase, vbase+size)`.
    pub fn flush_range(&mut self, vbase: u64, size: u64) {
        let end = vbase.saturating_add(size);
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(e) if e.vpage >= vbase && e.vpage < end) {
                *slot = None;
            }
        }
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

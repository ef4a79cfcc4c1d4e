//! Virtual memory manager: regions, page table, TLB, fault delivery.
//!
//! Translation resolves through the TLB first, then the page table, then the
//! registered page-fault handler (retried once). The TLB is an advisory cache
//! of page-table truth: an entry whose cached protection does not cover the
//! requested access falls through to the page table rather than faulting
//! directly.
//!
//! Structural tables (regions, page table, free list) sit behind a mutex held
//! only for the duration of the update; the fault-handler callback always
//! runs with no lock held, since handlers may recursively map memory.

mod tlb;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;
use thiserror::Error;
use tracing::trace;

pub use tlb::{Tlb, TlbEntry, TLB_ENTRIES};

/// Page size; the unit of mapping.
pub const PAGE_SIZE: u64 = 4096;

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

bitflags! {
    /// Page protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    pub const RX: Protection = Protection::READ.union(Protection::EXECUTE);
    pub const RWX: Protection = Protection::RW.union(Protection::EXECUTE);
}

/// Backing type tag carried by a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    SystemRam,
    GpuMemory,
    SharedMemory,
    DeviceMemory,
    KernelMemory,
}

/// One mapped virtual range.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub vbase: u64,
    pub pbase: u64,
    pub size: u64,
    pub protection: Protection,
    pub mem_type: MemoryType,
    pub name: String,
}

impl MemoryRegion {
    #[inline]
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vbase && vaddr - self.vbase < self.size
    }

    fn overlaps(&self, vbase: u64, size: u64) -> bool {
        vbase < self.vbase + self.size && self.vbase < vbase + size
    }
}

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY: u64 = 1 << 6;
/// Software bit: write faults duplicate the page before the store proceeds.
const PTE_COW: u64 = 1 << 9;
const PTE_NX: u64 = 1 << 63;
const PTE_PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000; // 40-bit frame number

/// Packed page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u64);

impl Pte {
    pub fn new(paddr: u64, protection: Protection, user: bool) -> Self {
        let mut bits = (paddr & PTE_PFN_MASK) | PTE_PRESENT;
        if protection.contains(Protection::WRITE) {
            bits |= PTE_WRITABLE;
        }
        if !protection.contains(Protection::EXECUTE) {
            bits |= PTE_NX;
        }
        if user {
            bits |= PTE_USER;
        }
        Pte(bits)
    }

    #[inline]
    pub fn present(self) -> bool {
        self.0 & PTE_PRESENT != 0
    }

    #[inline]
    pub fn writable(self) -> bool {
        self.0 & PTE_WRITABLE != 0
    }

    #[inline]
    pub fn user(self) -> bool {
        self.0 & PTE_USER != 0
    }

    #[inline]
    pub fn no_execute(self) -> bool {
        self.0 & PTE_NX != 0
    }

    #[inline]
    pub fn dirty(self) -> bool {
        self.0 & PTE_DIRTY != 0
    }

    #[inline]
    pub fn accessed(self) -> bool {
        self.0 & PTE_ACCESSED != 0
    }

    #[inline]
    pub fn cow(self) -> bool {
        self.0 & PTE_COW != 0
    }

    #[inline]
    pub fn paddr(self) -> u64 {
        self.0 & PTE_PFN_MASK
    }

    /// Effective protection derived from present/writable/no-execute.
    pub fn protection(self) -> Protection {
        let mut prot = Protection::READ;
        if self.writable() {
            prot |= Protection::WRITE;
        }
        if !self.no_execute() {
            prot |= Protection::EXECUTE;
        }
        prot
    }
}

/// Mapping/unmapping error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmuError {
    #[error("mapping {vbase:#x}+{size:#x} overlaps an existing region")]
    Overlap { vbase: u64, size: u64 },
    #[error("no mapped region at {vaddr:#x}")]
    NoRegion { vaddr: u64 },
    #[error("virtual address space exhausted for allocation of {size:#x} bytes")]
    OutOfVirtualSpace { size: u64 },
}

/// Translation failure surfaced to the access path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateFault {
    #[error("no mapping for {vaddr:#x}")]
    NotMapped { vaddr: u64 },
    #[error("protection violation at {vaddr:#x} (required {required:?})")]
    Protection { vaddr: u64, required: Protection },
    /// Write hit a copy-on-write page; the caller must duplicate the page
    /// (see [`Mmu::resolve_cow_write`]) and retry.
    #[error("copy-on-write fault at {vaddr:#x}")]
    CopyOnWrite { vaddr: u64 },
}

/// Page-fault collaborator: `(vaddr, required) -> resolved?`.
///
/// Returning `true` means a mapping now exists and translation should be
/// retried once; `false` means the access is permanently invalid.
pub type FaultHandler = Box<dyn FnMut(u64, Protection) -> bool + Send>;

#[derive(Debug, Default)]
pub struct MmuStats {
    pub tlb_hits: AtomicU64,
    pub tlb_misses: AtomicU64,
    pub page_faults: AtomicU64,
    pub cow_breaks: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    vbase: u64,
    size: u64,
}

#[derive(Default)]
struct Tables {
    regions: Vec<MemoryRegion>,
    page_table: BTreeMap<u64, Pte>,
    free_blocks: Vec<FreeBlock>,
}

/// The virtual memory manager.
pub struct Mmu {
    tables: Mutex<Tables>,
    tlb: Mutex<Tlb>,
    fault_handler: Mutex<Option<FaultHandler>>,
    /// Bump allocator for physical frames handed out by
    /// [`Mmu::allocate_virtual_memory`] and copy-on-write duplication.
    next_phys: AtomicU64,
    phys_limit: u64,
    stats: MmuStats,
}

impl Mmu {
    /// `phys_alloc_base..phys_limit` is the physical range available to the
    /// MMU's own frame allocator (anonymous allocations, COW copies).
    pub fn new(phys_alloc_base: u64, phys_limit: u64) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            tlb: Mutex::new(Tlb::new()),
            fault_handler: Mutex::new(None),
            next_phys: AtomicU64::new(page_align_up(phys_alloc_base)),
            phys_limit,
            stats: MmuStats::default(),
        }
    }

    pub fn stats(&self) -> &MmuStats {
        &self.stats
    }

    pub fn set_fault_handler(&self, handler: FaultHandler) {
        *self.fault_handler.lock().unwrap() = Some(handler);
    }

    pub fn clear_fault_handler(&self) {
        *self.fault_handler.lock().unwrap() = None;
    }

    /// Map `[vaddr, vaddr+size)` to `[paddr, ...)`.
    ///
    /// Addresses are aligned down and the size up to page granularity. The
    /// range must not overlap an existing region. Installs one PTE per page
    /// and primes the TLB.
    pub fn map_memory(
        &self,
        vaddr: u64,
        paddr: u64,
        size: u64,
        protection: Protection,
        mem_type: MemoryType,
        name: &str,
    ) -> Result<MemoryRegion, MmuError> {
        let vbase = page_align_down(vaddr);
        let pbase = page_align_down(paddr);
        let size = page_align_up(size + (vaddr - vbase));
        debug_assert!(size > 0);

        let region = MemoryRegion {
            vbase,
            pbase,
            size,
            protection,
            mem_type,
            name: name.to_owned(),
        };

        {
            let mut tables = self.tables.lock().unwrap();
            if tables.regions.iter().any(|r| r.overlaps(vbase, size)) {
                return Err(MmuError::Overlap { vbase, size });
            }
            let user = !matches!(mem_type, MemoryType::KernelMemory);
            for off in (0..size).step_by(PAGE_SIZE as usize) {
                tables
                    .page_table
                    .insert(vbase + off, Pte::new(pbase + off, protection, user));
            }
            tables.regions.push(region.clone());
        }

        let mut tlb = self.tlb.lock().unwrap();
        for off in (0..size).step_by(PAGE_SIZE as usize) {
            tlb.insert(TlbEntry {
                vpage: vbase + off,
                ppage: pbase + off,
                protection,
            });
        }
        drop(tlb);

        trace!(vbase, pbase, size, ?protection, name, "map_memory");
        Ok(region)
    }

    /// Remove the mapping at `vaddr` and return its range to the free list.
    pub fn unmap_memory(&self, vaddr: u64) -> Result<MemoryRegion, MmuError> {
        let region = {
            let mut tables = self.tables.lock().unwrap();
            let idx = tables
                .regions
                .iter()
                .position(|r| r.contains(vaddr))
                .ok_or(MmuError::NoRegion { vaddr })?;
            let region = tables.regions.swap_remove(idx);
            for off in (0..region.size).step_by(PAGE_SIZE as usize) {
                tables.page_table.remove(&(region.vbase + off));
            }
            tables.free_blocks.push(FreeBlock {
                vbase: region.vbase,
                size: region.size,
            });
            region
        };

        self.tlb.lock().unwrap().flush_range(region.vbase, region.size);
        trace!(vbase = region.vbase, size = region.size, "unmap_memory");
        Ok(region)
    }

    /// First-fit anonymous allocation: finds a free virtual range (recycled
    /// blocks first), backs it with fresh physical frames, and maps it.
    pub fn allocate_virtual_memory(
        &self,
        size: u64,
        protection: Protection,
    ) -> Result<u64, MmuError> {
        let size = page_align_up(size);

        let vbase = {
            let mut tables = self.tables.lock().unwrap();
            let mut found = None;
            for (idx, block) in tables.free_blocks.iter().enumerate() {
                if block.size >= size {
                    found = Some(idx);
                    break;
                }
            }
            match found {
                Some(idx) => {
                    let block = tables.free_blocks[idx];
                    if block.size == size {
                        tables.free_blocks.swap_remove(idx);
                    } else {
                        tables.free_blocks[idx] = FreeBlock {
                            vbase: block.vbase + size,
                            size: block.size - size,
                        };
                    }
                    block.vbase
                }
                None => {
                    // No recycled block fits; take fresh space above the
                    // highest existing region.
                    let top = tables
                        .regions
                        .iter()
                        .map(|r| r.vbase + r.size)
                        .max()
                        .unwrap_or(PAGE_SIZE);
                    page_align_up(top)
                }
            }
        };

        let paddr = self
            .alloc_phys_frames(size)
            .ok_or(MmuError::OutOfVirtualSpace { size })?;
        self.map_memory(vbase, paddr, size, protection, MemoryType::SystemRam, "anon")?;
        Ok(vbase)
    }

    /// Change the protection of an existing mapped range, flushing the TLB.
    pub fn protect(&self, vaddr: u64, size: u64, protection: Protection) -> Result<(), MmuError> {
        let vbase = page_align_down(vaddr);
        let size = page_align_up(size + (vaddr - vbase));
        {
            let mut tables = self.tables.lock().unwrap();
            if !tables.regions.iter().any(|r| r.contains(vbase)) {
                return Err(MmuError::NoRegion { vaddr });
            }
            for region in &mut tables.regions {
                if region.contains(vbase) {
                    region.protection = protection;
                }
            }
            for off in (0..size).step_by(PAGE_SIZE as usize) {
                let page = vbase + off;
                if let Some(pte) = tables.page_table.get(&page).copied() {
                    let mut new = Pte::new(pte.paddr(), protection, pte.user());
                    if pte.cow() {
                        new.0 |= PTE_COW;
                    }
                    tables.page_table.insert(page, new);
                }
            }
        }
        self.tlb.lock().unwrap().flush_range(vbase, size);
        Ok(())
    }

    /// Mark a mapped range copy-on-write: the pages read as shared until the
    /// first write, which must duplicate them via [`Mmu::resolve_cow_write`].
    pub fn mark_cow(&self, vaddr: u64, size: u64) -> Result<(), MmuError> {
        let vbase = page_align_down(vaddr);
        let size = page_align_up(size + (vaddr - vbase));
        {
            let mut tables = self.tables.lock().unwrap();
            if !tables.regions.iter().any(|r| r.contains(vbase)) {
                return Err(MmuError::NoRegion { vaddr });
            }
            for off in (0..size).step_by(PAGE_SIZE as usize) {
                let page = vbase + off;
                if let Some(pte) = tables.page_table.get_mut(&page) {
                    pte.0 |= PTE_COW;
                    pte.0 &= !PTE_WRITABLE;
                }
            }
        }
        self.tlb.lock().unwrap().flush_range(vbase, size);
        Ok(())
    }

    /// Translate a virtual address, requiring `required` protection.
    ///
    /// Order: TLB (advisory; protection cross-checked), page table, then the
    /// registered fault handler, retried exactly once on success.
    pub fn translate(&self, vaddr: u64, required: Protection) -> Result<u64, TranslateFault> {
        let page = page_align_down(vaddr);
        let offset = vaddr - page;

        {
            let mut tlb = self.tlb.lock().unwrap();
            if let Some(entry) = tlb.lookup(page) {
                if entry.protection.contains(required) {
                    self.stats.tlb_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.ppage + offset);
                }
                // Cached protection is insufficient; the entry may be stale.
                // Fall through to the page table, never fault from the TLB.
            }
        }
        self.stats.tlb_misses.fetch_add(1, Ordering::Relaxed);

        match self.walk(page, offset, required) {
            Ok(paddr) => return Ok(paddr),
            // Only a missing mapping is worth asking the fault handler about;
            // protection and COW faults are definitive answers.
            Err(TranslateFault::NotMapped { .. }) => {}
            Err(fault) => return Err(fault),
        }

        // Miss: give the fault handler one chance to install a mapping. The
        // handler is taken out of its slot so it runs with no MMU lock held;
        // a re-entrant fault inside it resolves to NotMapped instead of
        // deadlocking.
        self.stats.page_faults.fetch_add(1, Ordering::Relaxed);
        let taken = self.fault_handler.lock().unwrap().take();
        let resolved = match taken {
            Some(mut handler) => {
                let resolved = handler(vaddr, required);
                let mut guard = self.fault_handler.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(handler);
                }
                resolved
            }
            None => false,
        };
        if resolved {
            return self.walk(page, offset, required);
        }
        Err(TranslateFault::NotMapped { vaddr })
    }

    /// Page-table walk for one page. Updates accessed/dirty bits.
    fn walk(&self, page: u64, offset: u64, required: Protection) -> Result<u64, TranslateFault> {
        let mut tables = self.tables.lock().unwrap();
        let pte = match tables.page_table.get_mut(&page) {
            Some(pte) if pte.present() => pte,
            _ => return Err(TranslateFault::NotMapped { vaddr: page + offset }),
        };

        if required.contains(Protection::WRITE) && pte.cow() {
            return Err(TranslateFault::CopyOnWrite { vaddr: page + offset });
        }
        if !pte.protection().contains(required) {
            return Err(TranslateFault::Protection {
                vaddr: page + offset,
                required,
            });
        }

        pte.0 |= PTE_ACCESSED;
        if required.contains(Protection::WRITE) {
            pte.0 |= PTE_DIRTY;
        }
        let entry = TlbEntry {
            vpage: page,
            ppage: pte.paddr(),
            protection: pte.protection(),
        };
        let paddr = pte.paddr() + offset;
        drop(tables);

        self.tlb.lock().unwrap().insert(entry);
        Ok(paddr)
    }

    /// Break copy-on-write for the page containing `vaddr`: allocates a fresh
    /// physical frame, rewrites the PTE to it writable, and returns
    /// `(old_paddr, new_paddr)` so the caller can copy the page contents
    /// before retrying the store.
    pub fn resolve_cow_write(&self, vaddr: u64) -> Result<(u64, u64), TranslateFault> {
        let page = page_align_down(vaddr);
        let new_frame = self
            .alloc_phys_frames(PAGE_SIZE)
            .ok_or(TranslateFault::NotMapped { vaddr })?;

        let old_paddr = {
            let mut tables = self.tables.lock().unwrap();
            let pte = match tables.page_table.get_mut(&page) {
                Some(pte) if pte.present() && pte.cow() => pte,
                _ => return Err(TranslateFault::NotMapped { vaddr }),
            };
            let old = pte.paddr();
            // The private copy gets write access back.
            let prot = pte.protection() | Protection::WRITE;
            *pte = Pte::new(new_frame, prot, pte.user());
            old
        };

        self.tlb.lock().unwrap().flush_range(page, PAGE_SIZE);
        self.stats.cow_breaks.fetch_add(1, Ordering::Relaxed);
        trace!(vaddr, old_paddr, new_frame, "copy-on-write break");
        Ok((old_paddr, new_frame))
    }

    /// Look up the region containing `vaddr`.
    pub fn region_for(&self, vaddr: u64) -> Option<MemoryRegion> {
        self.tables
            .lock()
            .unwrap()
            .regions
            .iter()
            .find(|r| r.contains(vaddr))
            .cloned()
    }

    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.tables.lock().unwrap().regions.clone()
    }

    pub fn flush_tlb(&self) {
        self.tlb.lock().unwrap().flush();
    }

    /// Allocate page frames from the MMU's physical bump allocator.
    pub fn alloc_phys_frames(&self, size: u64) -> Option<u64> {
        let size = page_align_up(size);
        let base = self.next_phys.fetch_add(size, Ordering::Relaxed);
        if base + size > self.phys_limit {
            return None;
        }
        Some(base)
    }
}

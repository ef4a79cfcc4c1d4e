//! The machine's memory system: MMU translation in front of the cached
//! physical store, wired to the JIT trace cache.
//!
//! Every guest-visible store invalidates overlapping translations before it
//! completes, so self-modifying code can never run a stale block. Mapping
//! always hands out fresh zeroed physical frames; unmapping returns the
//! virtual range but never recycles the frames, so a remap of the same
//! range cannot observe the previous contents.

use std::sync::Arc;

use orion_cpu::{BusError, CpuBus};
use orion_jit::TraceCache;
use orion_mem::{CacheSim, CacheStats, PhysMemory};
use orion_mmu::{
    MemoryRegion, MemoryType, Mmu, MmuError, Protection, TranslateFault, PAGE_SIZE,
};
use orion_x86::MAX_INST_LEN;
use tracing::trace;

pub struct LinearMemory {
    mmu: Mmu,
    phys: PhysMemory,
    cache: CacheSim,
    trace_cache: Arc<TraceCache>,
}

impl LinearMemory {
    pub fn new(
        ram_bytes: usize,
        cache_sets: usize,
        cache_ways: usize,
        trace_cache: Arc<TraceCache>,
    ) -> Self {
        Self {
            // Physical frame 0 stays unused so a zero paddr is never valid.
            mmu: Mmu::new(PAGE_SIZE, ram_bytes as u64),
            phys: PhysMemory::new(ram_bytes),
            cache: CacheSim::new(cache_sets, cache_ways),
            trace_cache,
        }
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn trace_cache(&self) -> &Arc<TraceCache> {
        &self.trace_cache
    }

    /// Map `size` bytes at `vaddr`, backed by fresh zeroed frames.
    pub fn map(
        &mut self,
        vaddr: u64,
        size: u64,
        protection: Protection,
        name: &str,
    ) -> Result<MemoryRegion, MmuError> {
        let aligned = orion_mmu::page_align_up(size.max(1));
        let paddr = self
            .mmu
            .alloc_phys_frames(aligned)
            .ok_or(MmuError::OutOfVirtualSpace { size: aligned })?;
        // Frames are never recycled, but zeroing keeps the contract explicit.
        let _ = self.phys.zero_range(paddr, aligned as usize);
        self.mmu
            .map_memory(vaddr, paddr, size, protection, MemoryType::SystemRam, name)
    }

    /// Unmap the region at `vaddr`, dropping any translations built over it.
    pub fn unmap(&mut self, vaddr: u64) -> Result<MemoryRegion, MmuError> {
        let region = self.mmu.unmap_memory(vaddr)?;
        self.trace_cache.invalidate_range(region.vbase, region.size);
        Ok(region)
    }

    /// Read guest-virtual memory, page chunk by page chunk.
    pub fn read_virt(&mut self, vaddr: u64, dst: &mut [u8]) -> Result<(), BusError> {
        let mut addr = vaddr;
        let mut dst = dst;
        while !dst.is_empty() {
            let chunk = chunk_len(addr, dst.len());
            let paddr = self
                .mmu
                .translate(addr, Protection::READ)
                .map_err(|f| bus_error(addr, f))?;
            self.cache
                .read(&mut self.phys, paddr, &mut dst[..chunk])
                .map_err(|_| BusError::Inaccessible { vaddr: addr })?;
            addr += chunk as u64;
            dst = &mut dst[chunk..];
        }
        Ok(())
    }

    /// Write guest-virtual memory. Breaks copy-on-write pages and notifies
    /// the trace cache synchronously, before any byte lands.
    pub fn write_virt(&mut self, vaddr: u64, src: &[u8]) -> Result<(), BusError> {
        self.trace_cache.invalidate_range(vaddr, src.len() as u64);

        let mut addr = vaddr;
        let mut src = src;
        while !src.is_empty() {
            let chunk = chunk_len(addr, src.len());
            let paddr = self.translate_for_write(addr)?;
            self.cache
                .write(&mut self.phys, paddr, &src[..chunk])
                .map_err(|_| BusError::Inaccessible { vaddr: addr })?;
            addr += chunk as u64;
            src = &src[chunk..];
        }
        Ok(())
    }

    /// Instruction window for the JIT analyzer; `None` when nothing at all
    /// is fetchable at `vaddr`.
    pub fn fetch_window(&mut self, vaddr: u64) -> Option<([u8; MAX_INST_LEN], usize)> {
        self.fetch(vaddr).ok()
    }

    fn translate_for_write(&mut self, vaddr: u64) -> Result<u64, BusError> {
        match self.mmu.translate(vaddr, Protection::WRITE) {
            Ok(paddr) => Ok(paddr),
            Err(TranslateFault::CopyOnWrite { .. }) => {
                self.break_cow(vaddr)?;
                self.mmu
                    .translate(vaddr, Protection::WRITE)
                    .map_err(|f| bus_error(vaddr, f))
            }
            Err(fault) => Err(bus_error(vaddr, fault)),
        }
    }

    /// Duplicate the faulting page into its fresh frame.
    fn break_cow(&mut self, vaddr: u64) -> Result<(), BusError> {
        let (old_paddr, new_paddr) = self
            .mmu
            .resolve_cow_write(vaddr)
            .map_err(|f| bus_error(vaddr, f))?;

        // The shared frame may have dirty lines; flush before the raw copy.
        let mut page = vec![0u8; PAGE_SIZE as usize];
        self.cache
            .writeback_range(&mut self.phys, old_paddr, PAGE_SIZE as usize)
            .and_then(|_| self.phys.read_bytes(old_paddr, &mut page))
            .and_then(|_| self.phys.write_bytes(new_paddr, &page))
            .map_err(|_| BusError::Inaccessible { vaddr })?;
        // The raw copy bypassed the cache.
        self.cache.invalidate_range(new_paddr, PAGE_SIZE as usize);
        trace!(
            vaddr = format_args!("{vaddr:#x}"),
            old_paddr,
            new_paddr,
            "duplicated copy-on-write page"
        );
        Ok(())
    }
}

/// Bytes until the end of the page containing `addr`, capped at `want`.
fn chunk_len(addr: u64, want: usize) -> usize {
    let to_page_end = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
    want.min(to_page_end)
}

fn bus_error(vaddr: u64, fault: TranslateFault) -> BusError {
    match fault {
        TranslateFault::Protection { required, .. } if required.contains(Protection::EXECUTE) => {
            BusError::NotExecutable { vaddr }
        }
        _ => BusError::Inaccessible { vaddr },
    }
}

macro_rules! bus_read {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, vaddr: u64) -> Result<$ty, BusError> {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            self.read_virt(vaddr, &mut buf)?;
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

macro_rules! bus_write {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, vaddr: u64, val: $ty) -> Result<(), BusError> {
            self.write_virt(vaddr, &val.to_le_bytes())
        }
    };
}

impl CpuBus for LinearMemory {
    bus_read!(read_u8, u8);
    bus_read!(read_u16, u16);
    bus_read!(read_u32, u32);
    bus_read!(read_u64, u64);
    bus_read!(read_u128, u128);

    bus_write!(write_u8, u8);
    bus_write!(write_u16, u16);
    bus_write!(write_u32, u32);
    bus_write!(write_u64, u64);
    bus_write!(write_u128, u128);

    fn fetch(&mut self, vaddr: u64) -> Result<([u8; MAX_INST_LEN], usize), BusError> {
        let mut window = [0u8; MAX_INST_LEN];
        let mut filled = 0usize;
        let mut addr = vaddr;

        while filled < MAX_INST_LEN {
            let chunk = chunk_len(addr, MAX_INST_LEN - filled);
            let paddr = match self.mmu.translate(addr, Protection::EXECUTE) {
                Ok(paddr) => paddr,
                // A short window near the end of executable memory is fine;
                // an empty one is a fetch fault.
                Err(_) if filled > 0 => break,
                Err(fault) => return Err(bus_error(addr, fault)),
            };
            self.cache
                .read(&mut self.phys, paddr, &mut window[filled..filled + chunk])
                .map_err(|_| BusError::Inaccessible { vaddr: addr })?;
            filled += chunk;
            addr += chunk as u64;
        }
        Ok((window, filled))
    }
}

use crate::MemError;

/// Flat physical memory.
///
/// All access is bounds-checked; the backing store is the single source of
/// truth for every byte that is not currently held dirty in a cache line.
#[derive(Debug, Clone)]
pub struct PhysMemory {
    data: Vec<u8>,
}

impl PhysMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn range(&self, paddr: u64, len: usize) -> Result<std::ops::Range<usize>, MemError> {
        let start = usize::try_from(paddr).map_err(|_| MemError::OutOfBounds { paddr, len })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(MemError::OutOfBounds { paddr, len })?;
        Ok(start..end)
    }

    pub fn read_bytes(&self, paddr: u64, dst: &mut [u8]) -> Result<(), MemError> {
        let range = self.range(paddr, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    pub fn write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), MemError> {
        let range = self.range(paddr, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    pub fn read_u8(&self, paddr: u64) -> Result<u8, MemError> {
        let mut b = [0u8; 1];
        self.read_bytes(paddr, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u64(&self, paddr: u64) -> Result<u64, MemError> {
        let mut b = [0u8; 8];
        self.read_bytes(paddr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u8(&mut self, paddr: u64, value: u8) -> Result<(), MemError> {
        self.write_bytes(paddr, &[value])
    }

    pub fn write_u64(&mut self, paddr: u64, value: u64) -> Result<(), MemError> {
        self.write_bytes(paddr, &value.to_le_bytes())
    }

    /// Zero-fill a range. Used when recycling physical pages so a fresh
    /// mapping never exposes a previous tenant's bytes.
    pub fn zero_range(&mut self, paddr: u64, len: usize) -> Result<(), MemError> {
        let range = self.range(paddr, len)?;
        self.data[range].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut mem = PhysMemory::new(0x1000);
        mem.write_u64(0x100, 0xDEAD_BEEF_0BAD_F00D).unwrap();
        assert_eq!(mem.read_u64(0x100).unwrap(), 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(mem.read_u8(0x100).unwrap(), 0x0D);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let mut mem = PhysMemory::new(0x100);
        assert_eq!(
            mem.read_u64(0xFC),
            Err(MemError::OutOfBounds {
                paddr: 0xFC,
                len: 8
            })
        );
        assert!(mem.write_u8(0x100, 1).is_err());
        assert!(mem.read_u8(u64::MAX).is_err());
    }
}

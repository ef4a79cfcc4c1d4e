use orion_x86::MAX_INST_LEN;
use thiserror::Error;

/// Memory access failure surfaced to the execution engine.
///
/// The bus implementation is expected to resolve recoverable conditions
/// (demand paging, copy-on-write) internally; an error reaching the CPU is
/// final for that access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("inaccessible guest address {vaddr:#x}")]
    Inaccessible { vaddr: u64 },
    #[error("execute permission missing at {vaddr:#x}")]
    NotExecutable { vaddr: u64 },
}

/// The CPU's view of memory.
pub trait CpuBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, BusError>;
    fn read_u16(&mut self, vaddr: u64) -> Result<u16, BusError>;
    fn read_u32(&mut self, vaddr: u64) -> Result<u32, BusError>;
    fn read_u64(&mut self, vaddr: u64) -> Result<u64, BusError>;
    fn read_u128(&mut self, vaddr: u64) -> Result<u128, BusError>;

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), BusError>;
    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), BusError>;
    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), BusError>;
    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), BusError>;
    fn write_u128(&mut self, vaddr: u64, val: u128) -> Result<(), BusError>;

    /// Fetch an instruction window at `vaddr`. Returns the window and the
    /// number of valid bytes, which may be short of [`MAX_INST_LEN`] near the
    /// end of a mapping.
    fn fetch(&mut self, vaddr: u64) -> Result<([u8; MAX_INST_LEN], usize), BusError>;

    fn read_sized(&mut self, vaddr: u64, bytes: usize) -> Result<u64, BusError> {
        match bytes {
            1 => self.read_u8(vaddr).map(u64::from),
            2 => self.read_u16(vaddr).map(u64::from),
            4 => self.read_u32(vaddr).map(u64::from),
            8 => self.read_u64(vaddr),
            _ => unreachable!("unsupported access width {bytes}"),
        }
    }

    fn write_sized(&mut self, vaddr: u64, bytes: usize, val: u64) -> Result<(), BusError> {
        match bytes {
            1 => self.write_u8(vaddr, val as u8),
            2 => self.write_u16(vaddr, val as u16),
            4 => self.write_u32(vaddr, val as u32),
            8 => self.write_u64(vaddr, val),
            _ => unreachable!("unsupported access width {bytes}"),
        }
    }
}

/// Identity-mapped flat bus for unit tests.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self { mem: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        &self.mem[start..start + len]
    }

    fn read_n<const N: usize>(&self, vaddr: u64) -> Result<[u8; N], BusError> {
        let start = vaddr as usize;
        let bytes = self
            .mem
            .get(start..start + N)
            .ok_or(BusError::Inaccessible { vaddr })?;
        Ok(bytes.try_into().unwrap())
    }

    fn write_n(&mut self, vaddr: u64, bytes: &[u8]) -> Result<(), BusError> {
        let start = vaddr as usize;
        let dst = self
            .mem
            .get_mut(start..start + bytes.len())
            .ok_or(BusError::Inaccessible { vaddr })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, BusError> {
        Ok(u8::from_le_bytes(self.read_n(vaddr)?))
    }

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, BusError> {
        Ok(u16::from_le_bytes(self.read_n(vaddr)?))
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, BusError> {
        Ok(u32::from_le_bytes(self.read_n(vaddr)?))
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, BusError> {
        Ok(u64::from_le_bytes(self.read_n(vaddr)?))
    }

    fn read_u128(&mut self, vaddr: u64) -> Result<u128, BusError> {
        Ok(u128::from_le_bytes(self.read_n(vaddr)?))
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), BusError> {
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), BusError> {
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), BusError> {
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), BusError> {
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn write_u128(&mut self, vaddr: u64, val: u128) -> Result<(), BusError> {
        self.write_n(vaddr, &val.to_le_bytes())
    }

    fn fetch(&mut self, vaddr: u64) -> Result<([u8; MAX_INST_LEN], usize), BusError> {
        let start = vaddr as usize;
        if start >= self.mem.len() {
            return Err(BusError::Inaccessible { vaddr });
        }
        let avail = (self.mem.len() - start).min(MAX_INST_LEN);
        let mut window = [0u8; MAX_INST_LEN];
        window[..avail].copy_from_slice(&self.mem[start..start + avail]);
        Ok((window, avail))
    }
}

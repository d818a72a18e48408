//! Emulated global memory
//!
//! The DRAM behind memory endpoints. It sits behind the interconnect, not
//! in an endpoint register, so accesses are serialized by a plain mutex
//! the way a memory controller serializes them.

use core_types::{Code, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Byte-addressable global memory shared by all PEs
pub struct MainMemory {
    bytes: Mutex<Vec<u8>>,
    size: usize,
}

impl MainMemory {
    /// Creates zeroed memory of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
            size,
        }
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(addr).map_err(|_| Code::InvArgs)?;
        let end = start.checked_add(len).ok_or(Code::InvArgs)?;
        if end > self.size {
            return Err(Code::InvArgs);
        }
        Ok(start..end)
    }

    /// Copies `len` bytes starting at `addr`
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.range(addr, len)?;
        Ok(self.lock()[range].to_vec())
    }

    /// Stores `data` at `addr`
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.lock()[range].copy_from_slice(data);
        Ok(())
    }

    /// Replaces the bytes at `addr` with `new` iff they equal `expected`
    pub fn compare_exchange(&self, addr: u64, expected: &[u8], new: &[u8]) -> Result<bool> {
        if expected.len() != new.len() {
            return Err(Code::InvArgs);
        }
        let range = self.range(addr, new.len())?;
        let mut bytes = self.lock();
        if bytes[range.clone()] != *expected {
            return Ok(false);
        }
        bytes[range].copy_from_slice(new);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mem = MainMemory::new(64);
        mem.write(8, b"hello").unwrap();
        assert_eq!(mem.read(8, 5).unwrap(), b"hello");
        assert_eq!(mem.read(0, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_out_of_range() {
        let mem = MainMemory::new(16);
        assert_eq!(mem.read(10, 7), Err(Code::InvArgs));
        assert_eq!(mem.write(u64::MAX, b"x"), Err(Code::InvArgs));
        assert!(mem.read(0, 16).is_ok());
    }

    #[test]
    fn test_compare_exchange() {
        let mem = MainMemory::new(16);
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.compare_exchange(0, &[9, 9, 9, 9], &[5, 5, 5, 5]), Ok(false));
        assert_eq!(mem.read(0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(mem.compare_exchange(0, &[1, 2, 3, 4], &[5, 5, 5, 5]), Ok(true));
        assert_eq!(mem.read(0, 4).unwrap(), vec![5, 5, 5, 5]);
        assert_eq!(mem.compare_exchange(0, &[1], &[1, 2]), Err(Code::InvArgs));
    }
}

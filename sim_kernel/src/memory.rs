//! Global memory allocation
//!
//! A first-fit free list over the emulated DRAM. Regions are handed out
//! in multiples of [`ALIGN`] bytes and merged with their neighbours when
//! they come back.

use core_types::{Code, Result};
use std::collections::BTreeMap;

/// Granularity of allocations
pub const ALIGN: u64 = 64;

fn align_up(size: u64) -> Result<u64> {
    size.checked_add(ALIGN - 1)
        .map(|s| s & !(ALIGN - 1))
        .ok_or(Code::OutOfMem)
}

/// Free regions of global memory
#[derive(Debug)]
pub struct MemoryMap {
    size: u64,
    free: BTreeMap<u64, u64>,
}

impl MemoryMap {
    /// Creates a map with all of `size` bytes free
    pub fn new(size: u64) -> Self {
        let mut free = BTreeMap::new();
        let size = size & !(ALIGN - 1);
        if size > 0 {
            free.insert(0, size);
        }
        Self { size, free }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not allocated
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Allocates `size` bytes anywhere and returns their address
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Code::InvArgs);
        }
        let size = align_up(size)?;
        let (addr, len) = self
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(a, l)| (*a, *l))
            .ok_or(Code::OutOfMem)?;
        self.free.remove(&addr);
        if len > size {
            self.free.insert(addr + size, len - size);
        }
        Ok(addr)
    }

    /// Allocates `size` bytes at exactly `addr`
    pub fn alloc_at(&mut self, addr: u64, size: u64) -> Result<()> {
        if size == 0 || addr % ALIGN != 0 {
            return Err(Code::InvArgs);
        }
        let size = align_up(size)?;
        let end = addr.checked_add(size).ok_or(Code::InvArgs)?;
        if end > self.size {
            return Err(Code::InvArgs);
        }
        let (start, len) = self
            .free
            .range(..=addr)
            .next_back()
            .map(|(a, l)| (*a, *l))
            .filter(|(a, l)| a + l >= end)
            .ok_or(Code::OutOfMem)?;
        self.free.remove(&start);
        if start < addr {
            self.free.insert(start, addr - start);
        }
        if start + len > end {
            self.free.insert(end, start + len - end);
        }
        Ok(())
    }

    /// Returns a region handed out by `alloc` or `alloc_at`
    pub fn free(&mut self, addr: u64, size: u64) {
        let Ok(mut size) = align_up(size) else {
            return;
        };
        let mut addr = addr;
        if let Some((&prev, &len)) = self.free.range(..addr).next_back() {
            if prev + len == addr {
                self.free.remove(&prev);
                addr = prev;
                size += len;
            }
        }
        if let Some(len) = self.free.remove(&(addr + size)) {
            size += len;
        }
        self.free.insert(addr, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_aligned() {
        let mut mem = MemoryMap::new(1024);
        assert_eq!(mem.alloc(10).unwrap(), 0);
        assert_eq!(mem.alloc(64).unwrap(), 64);
        assert_eq!(mem.free_bytes(), 1024 - 128);
    }

    #[test]
    fn test_out_of_memory() {
        let mut mem = MemoryMap::new(256);
        assert_eq!(mem.alloc(512), Err(Code::OutOfMem));
        assert_eq!(mem.alloc(0), Err(Code::InvArgs));
        mem.alloc(256).unwrap();
        assert_eq!(mem.alloc(1), Err(Code::OutOfMem));
    }

    #[test]
    fn test_free_merges() {
        let mut mem = MemoryMap::new(256);
        let a = mem.alloc(64).unwrap();
        let b = mem.alloc(64).unwrap();
        let c = mem.alloc(128).unwrap();
        mem.free(b, 64);
        mem.free(a, 64);
        mem.free(c, 128);
        assert_eq!(mem.free_bytes(), 256);
        assert_eq!(mem.alloc(256).unwrap(), 0);
    }

    #[test]
    fn test_alloc_at() {
        let mut mem = MemoryMap::new(1024);
        mem.alloc_at(128, 64).unwrap();
        assert_eq!(mem.alloc_at(128, 64), Err(Code::OutOfMem));
        assert_eq!(mem.alloc_at(100, 64), Err(Code::InvArgs));
        assert_eq!(mem.alloc_at(1024, 64), Err(Code::InvArgs));
        assert_eq!(mem.alloc(128).unwrap(), 0);
        assert_eq!(mem.alloc(64).unwrap(), 192);
        mem.free(128, 64);
        assert_eq!(mem.alloc(64).unwrap(), 128);
    }
}

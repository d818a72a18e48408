//! Selector and endpoint allocation

use core_types::{CapSel, Code, EpId, Result};
use dtu::EP_COUNT;
use kernel_api::{FIRST_FREE_EP, FIRST_FREE_SEL};

/// Hands out capability selectors
///
/// Ranges are always taken fresh from the top; single selectors are reused
/// once freed.
#[derive(Debug)]
pub struct SelAllocator {
    next: CapSel,
    free: Vec<CapSel>,
}

impl SelAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_FREE_SEL)
    }

    /// Allocator whose first selector is `first`, never below the reserved ones
    pub fn starting_at(first: CapSel) -> Self {
        Self {
            next: first.max(FIRST_FREE_SEL),
            free: Vec::new(),
        }
    }

    /// Allocates one selector
    pub fn alloc(&mut self) -> CapSel {
        match self.free.pop() {
            Some(sel) => sel,
            None => self.alloc_range(1),
        }
    }

    /// Allocates `count` contiguous selectors and returns the first
    pub fn alloc_range(&mut self, count: u32) -> CapSel {
        let start = self.next;
        self.next = self.next.saturating_add(count);
        start
    }

    /// Returns a selector whose capability is gone
    pub fn free(&mut self, sel: CapSel) {
        if sel >= FIRST_FREE_SEL && sel < self.next && !self.free.contains(&sel) {
            self.free.push(sel);
        }
    }
}

impl Default for SelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks which endpoints of the VPE's engine are in use
#[derive(Debug)]
pub struct EpAllocator {
    used: [bool; EP_COUNT],
}

impl EpAllocator {
    pub fn new() -> Self {
        let mut used = [false; EP_COUNT];
        for slot in used.iter_mut().take(FIRST_FREE_EP) {
            *slot = true;
        }
        Self { used }
    }

    /// Allocates the lowest free endpoint
    pub fn alloc(&mut self) -> Result<EpId> {
        let ep = self.used.iter().position(|u| !u).ok_or(Code::NoSpace)?;
        self.used[ep] = true;
        Ok(ep)
    }

    /// Releases an endpoint; reserved endpoints stay taken
    pub fn free(&mut self, ep: EpId) {
        if (FIRST_FREE_EP..EP_COUNT).contains(&ep) {
            self.used[ep] = false;
        }
    }

    /// Number of endpoints still available
    pub fn available(&self) -> usize {
        self.used.iter().filter(|u| !**u).count()
    }
}

impl Default for EpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

//! Memory gates

use crate::cap::ObjCap;
use crate::env::Env;
use crate::gate::Gate;
use core_types::{CapKind, CapSel, Code, MemoryPerms, Ownership, Result};
use std::fmt;

/// Access to a region of global memory
///
/// Offsets are relative to the start of the region. The kernel checks that
/// a derived gate never reaches outside its parent or gains permissions.
pub struct MemGate {
    gate: Gate,
}

impl MemGate {
    /// Allocates `size` bytes of global memory
    pub fn create_global(env: &Env, size: u64, perms: MemoryPerms) -> Result<Self> {
        Self::request(env, None, size, perms)
    }

    /// Requests the region at physical address `addr`
    pub fn create_global_at(env: &Env, addr: u64, size: u64, perms: MemoryPerms) -> Result<Self> {
        Self::request(env, Some(addr), size, perms)
    }

    fn request(env: &Env, addr: Option<u64>, size: u64, perms: MemoryPerms) -> Result<Self> {
        let sel = env.alloc_sel();
        if let Err(code) = env.syscalls().req_mem(sel, addr, size, perms) {
            env.free_sel(sel);
            return Err(code);
        }
        Ok(Self::bind(env, sel, Ownership::Owned))
    }

    /// Wraps an existing memory capability
    pub fn bind(env: &Env, sel: CapSel, ownership: Ownership) -> Self {
        Self {
            gate: Gate::new(ObjCap::new(env, CapKind::Mem, sel, ownership)),
        }
    }

    /// Creates a gate for `size` bytes at `offset` with at most `perms`
    pub fn derive(&self, offset: u64, size: u64, perms: MemoryPerms) -> Result<MemGate> {
        let env = self.gate.env();
        let sel = env.alloc_sel();
        if let Err(code) = env
            .syscalls()
            .derive_mem(self.sel(), sel, offset, size, perms)
        {
            env.free_sel(sel);
            return Err(code);
        }
        Ok(Self::bind(env, sel, Ownership::Owned))
    }

    pub fn sel(&self) -> CapSel {
        self.gate.sel()
    }

    /// Binds the gate to an endpoint now instead of on first use
    pub fn activate(&self) -> Result<()> {
        self.gate.activate().map(|_| ())
    }

    /// Fills `buf` from the region, starting at `offset`
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let len = buf.len();
        let data = self.gate.run(|dtu, ep| dtu.read(ep, offset, len))?;
        if data.len() != len {
            return Err(Code::InvArgs);
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Writes `data` to the region, starting at `offset`
    pub fn write(&self, data: &[u8], offset: u64) -> Result<()> {
        self.gate.run(|dtu, ep| dtu.write(ep, offset, data))
    }

    /// Replaces the bytes at `offset` by `new` if they equal `expected`
    pub fn compare_exchange(&self, offset: u64, expected: &[u8], new: &[u8]) -> Result<bool> {
        self.gate
            .run(|dtu, ep| dtu.cmpxchg(ep, offset, expected, new))
    }
}

impl fmt::Debug for MemGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemGate")
            .field("sel", &self.sel())
            .field("ep", &self.gate.ep())
            .finish()
    }
}

//! Child VPEs

use crate::cap::ObjCap;
use crate::env::Env;
use core_types::{CapKind, CapRange, CapSel, Code, Ownership, PeId, Result, VpeId};
use kernel_api::{VpeOp, FIRST_FREE_SEL};
use std::cell::Cell;
use std::fmt;

/// A VPE created by the caller
///
/// Capabilities delegated before [`Vpe::run`] land at the child's lowest
/// selectors, and the child's own allocator starts above them. Dropping
/// the handle tears the child down.
pub struct Vpe {
    cap: ObjCap,
    id: VpeId,
    name: String,
    next_sel: Cell<CapSel>,
}

impl Vpe {
    /// Creates a VPE on a free PE; it does not run anything yet
    pub fn new(env: &Env, name: &str) -> Result<Self> {
        let sel = env.alloc_sel();
        let id = match env.syscalls().create_vpe(sel, name) {
            Ok(id) => id,
            Err(code) => {
                env.free_sel(sel);
                return Err(code);
            }
        };
        log::debug!(target: "ipc", "{}: created child {} '{}'", env.vpe_id(), id, name);
        Ok(Self {
            cap: ObjCap::new(env, CapKind::Vpe, sel, Ownership::Owned),
            id,
            name: name.to_string(),
            next_sel: Cell::new(FIRST_FREE_SEL),
        })
    }

    pub fn id(&self) -> VpeId {
        self.id
    }

    pub fn sel(&self) -> CapSel {
        self.cap.sel()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn env(&self) -> &Env {
        self.cap.env()
    }

    /// Copies the caller's capabilities `own` into the child
    ///
    /// Returns the selectors they got in the child.
    pub fn delegate(&self, own: CapRange) -> Result<CapRange> {
        let dst = CapRange::new(self.next_sel.get(), own.count);
        self.env().syscalls().exchange(self.sel(), own, dst, false)?;
        self.next_sel.set(dst.end());
        Ok(dst)
    }

    /// Copies one capability into the child and returns its child selector
    pub fn delegate_obj(&self, sel: CapSel) -> Result<CapSel> {
        self.delegate(CapRange::single(sel)).map(|crd| crd.start)
    }

    /// Copies the child's capabilities `other` to fresh selectors of the caller
    pub fn obtain(&self, other: CapRange) -> Result<CapRange> {
        let own = CapRange::new(self.env().alloc_sels(other.count), other.count);
        self.env().syscalls().exchange(self.sel(), own, other, true)?;
        Ok(own)
    }

    /// Starts `program` on the child
    pub fn run<F>(&self, program: F) -> Result<()>
    where
        F: FnOnce(Env) -> i32 + Send + 'static,
    {
        self.env()
            .loader()
            .start(self.id, self.next_sel.get(), Box::new(program))?;
        self.env().syscalls().vpe_ctrl(self.sel(), VpeOp::Start)?;
        Ok(())
    }

    /// Blocks until the child exited and returns its exit code
    pub fn wait(&self) -> Result<i32> {
        let code = self.env().syscalls().vpe_ctrl(self.sel(), VpeOp::Wait)?;
        i32::try_from(code).map_err(|_| Code::InvArgs)
    }

    /// Tears the child down without waiting for it
    pub fn stop(&self) -> Result<()> {
        self.env()
            .syscalls()
            .vpe_ctrl(self.sel(), VpeOp::Stop)
            .map(|_| ())
    }

    /// Moves the child to another PE
    ///
    /// Gates bound to the child's old PE fail once and are reactivated.
    pub fn migrate(&self) -> Result<PeId> {
        let pe = self.env().syscalls().vpe_ctrl(self.sel(), VpeOp::Migrate)?;
        u32::try_from(pe).map(PeId::new).map_err(|_| Code::InvArgs)
    }
}

impl fmt::Debug for Vpe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vpe")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sel", &self.sel())
            .finish()
    }
}

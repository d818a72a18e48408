//! Selector ownership

use crate::env::Env;
use core_types::{CapKind, CapRange, CapSel, Ownership, Result, INVALID_SEL};
use kernel_api::SEL_VPE;
use std::cell::Cell;
use std::fmt;

/// A capability selector together with what releasing it does
///
/// Release is idempotent: the first call revokes and frees according to the
/// [`Ownership`], later calls do nothing. Dropping the handle releases it.
pub struct ObjCap {
    env: Env,
    kind: CapKind,
    sel: Cell<CapSel>,
    ownership: Cell<Ownership>,
}

impl ObjCap {
    pub fn new(env: &Env, kind: CapKind, sel: CapSel, ownership: Ownership) -> Self {
        Self {
            env: env.clone(),
            kind,
            sel: Cell::new(sel),
            ownership: Cell::new(ownership),
        }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn kind(&self) -> CapKind {
        self.kind
    }

    /// The selector; `INVALID_SEL` once released
    pub fn sel(&self) -> CapSel {
        self.sel.get()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership.get()
    }

    /// Changes what a later release does
    pub fn set_ownership(&self, ownership: Ownership) {
        self.ownership.set(ownership);
    }

    /// Returns true until the handle was released
    pub fn is_valid(&self) -> bool {
        self.sel.get() != INVALID_SEL
    }

    /// Revokes and frees according to the ownership
    ///
    /// The selector is only freed if the revoke succeeded, so it is never
    /// reused while the kernel still holds a capability there.
    pub fn release(&self) -> Result<()> {
        let sel = self.sel.replace(INVALID_SEL);
        if sel == INVALID_SEL {
            return Ok(());
        }
        let ownership = self.ownership.get();
        if ownership.revokes() {
            self.env
                .syscalls()
                .revoke(SEL_VPE, CapRange::single(sel), true)?;
        }
        if ownership.frees_sel() {
            self.env.free_sel(sel);
        }
        Ok(())
    }
}

impl Drop for ObjCap {
    fn drop(&mut self) {
        let sel = self.sel.get();
        if let Err(code) = self.release() {
            log::warn!(target: "ipc", "{} cap {} not released: {}", self.kind, sel, code);
        }
    }
}

impl fmt::Debug for ObjCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjCap")
            .field("kind", &self.kind)
            .field("sel", &self.sel.get())
            .field("ownership", &self.ownership.get())
            .finish()
    }
}

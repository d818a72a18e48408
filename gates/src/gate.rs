//! Endpoint binding shared by send and memory gates

use crate::cap::ObjCap;
use crate::env::Env;
use core_types::{CapSel, Code, EpId, Ownership, Result, INVALID_SEL};
use dtu::Dtu;
use std::cell::Cell;

/// A capability that is bound to an endpoint on first use
pub(crate) struct Gate {
    cap: ObjCap,
    ep: Cell<Option<EpId>>,
}

impl Gate {
    pub(crate) fn new(cap: ObjCap) -> Self {
        Self {
            cap,
            ep: Cell::new(None),
        }
    }

    /// A gate whose endpoint the kernel configured at VPE creation
    pub(crate) fn preset(cap: ObjCap, ep: EpId) -> Self {
        Self {
            cap,
            ep: Cell::new(Some(ep)),
        }
    }

    pub(crate) fn env(&self) -> &Env {
        self.cap.env()
    }

    pub(crate) fn cap(&self) -> &ObjCap {
        &self.cap
    }

    pub(crate) fn sel(&self) -> CapSel {
        self.cap.sel()
    }

    pub(crate) fn ep(&self) -> Option<EpId> {
        self.ep.get()
    }

    /// Binds the capability to a fresh endpoint unless already bound
    pub(crate) fn activate(&self) -> Result<EpId> {
        if let Some(ep) = self.ep.get() {
            return Ok(ep);
        }
        let env = self.env();
        let ep = env.alloc_ep()?;
        if let Err(code) = env.syscalls().activate(ep, INVALID_SEL, self.sel()) {
            env.free_ep(ep);
            return Err(code);
        }
        log::trace!(target: "ipc", "{} cap {} bound to ep {}", self.cap.kind(), self.sel(), ep);
        self.ep.set(Some(ep));
        Ok(ep)
    }

    /// Runs an engine command on the gate's endpoint
    ///
    /// If the peer went away or moved, the capability is activated again on
    /// the same endpoint and the command retried exactly once. A failed
    /// reactivation means the peer is gone for good.
    pub(crate) fn run<T>(&self, op: impl Fn(&Dtu, EpId) -> Result<T>) -> Result<T> {
        let ep = self.activate()?;
        let dtu = self.env().dtu();
        match op(dtu, ep) {
            Err(code) if code.is_peer_lifetime() && self.cap.ownership() != Ownership::Static => {
                log::debug!(
                    target: "ipc",
                    "{} cap {} on ep {}: {}, reactivating",
                    self.cap.kind(),
                    self.sel(),
                    ep,
                    code
                );
                let sel = self.sel();
                if self.env().syscalls().activate(ep, sel, sel).is_err() {
                    return Err(Code::VpeGone);
                }
                op(dtu, ep)
            }
            res => res,
        }
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        if self.cap.ownership() == Ownership::Static {
            return;
        }
        if let Some(ep) = self.ep.take() {
            self.env().free_ep(ep);
        }
    }
}

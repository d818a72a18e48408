//! Client side of a service session

use crate::cap::ObjCap;
use crate::env::Env;
use crate::send_gate::SendGate;
use core_types::{CapKind, CapRange, CapSel, Ownership, Result};
use ipc::{IStream, OStream};
use std::fmt;

/// An open session with a service
///
/// Capabilities travel over the session in both directions; the kernel
/// asks the server for consent each time. Dropping an owned session
/// revokes it, which tells the server to close its side.
pub struct Session {
    cap: ObjCap,
}

impl Session {
    /// Opens a session with the service registered as `name`
    pub fn open(env: &Env, name: &str, args: OStream) -> Result<Self> {
        let sel = env.alloc_sel();
        if let Err(code) = env.syscalls().create_sess(sel, name, args) {
            env.free_sel(sel);
            return Err(code);
        }
        log::debug!(target: "ipc", "{}: session {} with '{}'", env.vpe_id(), sel, name);
        Ok(Self::bind(env, sel, Ownership::Owned))
    }

    /// Wraps an existing session capability
    pub fn bind(env: &Env, sel: CapSel, ownership: Ownership) -> Self {
        Self {
            cap: ObjCap::new(env, CapKind::Session, sel, ownership),
        }
    }

    pub fn sel(&self) -> CapSel {
        self.cap.sel()
    }

    pub fn env(&self) -> &Env {
        self.cap.env()
    }

    /// Asks the server for `count` capabilities
    ///
    /// Returns where they landed and the server's reply arguments.
    pub fn obtain(&self, count: u32, args: OStream) -> Result<(CapRange, IStream)> {
        let caps = CapRange::new(self.env().alloc_sels(count), count);
        let reply = self.env().syscalls().obtain(self.sel(), caps, args)?;
        Ok((caps, reply))
    }

    /// Obtains a single send gate, the usual way to reach a server
    pub fn connect(&self, args: OStream) -> Result<SendGate> {
        let (caps, _) = self.obtain(1, args)?;
        Ok(SendGate::bind(self.env(), caps.start, Ownership::Owned))
    }

    /// Hands capabilities `caps` to the server
    pub fn delegate(&self, caps: CapRange, args: OStream) -> Result<IStream> {
        self.env().syscalls().delegate(self.sel(), caps, args)
    }

    /// Revokes the session now and reports the outcome
    pub fn close(self) -> Result<()> {
        self.cap.release()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("sel", &self.sel()).finish()
    }
}

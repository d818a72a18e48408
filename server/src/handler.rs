//! What a service implements
//!
//! The [`Server`](crate::Server) takes care of the control protocol; a
//! [`Handler`] only decides about sessions and their capabilities. Each
//! callback gets a [`Context`] through which it creates the gates a client
//! will talk to the session over.

use core_types::{CapRange, CapSel, Code, EpId, Result};
use dtu::UNLIMITED_CREDITS;
use gates::{Env, GateIStream, RecvBuf, RecvGate, SendGate};
use ipc::{IStream, OStream};
use kernel_api::SEL_VPE;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Capabilities a handler hands out or accepts, plus reply arguments
#[derive(Debug)]
pub struct Exchange {
    pub caps: CapRange,
    pub args: OStream,
}

impl Exchange {
    pub fn new(caps: CapRange) -> Self {
        Self {
            caps,
            args: OStream::new(),
        }
    }

    pub fn with_args(caps: CapRange, args: OStream) -> Self {
        Self { caps, args }
    }
}

/// Service behaviour behind the control protocol
pub trait Handler {
    /// Per-session state of the service
    type Session;

    /// Accepts or rejects a new session
    fn open(&mut self, ctx: &mut Context<'_>, args: &mut IStream) -> Result<Self::Session>;

    /// Hands `count` capabilities to the client
    fn obtain(
        &mut self,
        _ctx: &mut Context<'_>,
        _sess: &mut Self::Session,
        _count: u32,
        _args: &mut IStream,
    ) -> Result<Exchange> {
        Err(Code::NotSup)
    }

    /// Names the selectors `count` capabilities of the client go to
    fn delegate(
        &mut self,
        _ctx: &mut Context<'_>,
        _sess: &mut Self::Session,
        _count: u32,
        _args: &mut IStream,
    ) -> Result<Exchange> {
        Err(Code::NotSup)
    }

    /// Handles a message that arrived over one of the session's gates
    fn message(
        &mut self,
        _ctx: &mut Context<'_>,
        _sess: &mut Self::Session,
        msg: &mut GateIStream,
    ) -> Result<()> {
        msg.reply_error(Code::NotSup)
    }

    /// The session is gone; its gates are released after this returns
    fn close(&mut self, _ident: u64, _sess: Self::Session) {}

    /// The service is shutting down
    fn shutdown(&mut self) {}
}

pub(crate) type Dispatch = Rc<dyn Fn(u64, &mut GateIStream) -> Result<()>>;

/// Free message slots per receive buffer
#[derive(Debug)]
pub(crate) struct SlotPool {
    free: Vec<usize>,
}

impl SlotPool {
    /// Buffer 0 keeps one slot for the kernel's control messages
    pub(crate) fn new(buffers: usize, slots: usize) -> Self {
        let mut free = vec![slots; buffers];
        if let Some(first) = free.first_mut() {
            *first = first.saturating_sub(1);
        }
        Self { free }
    }

    /// Reserves `credits` slots in the first buffer that has them
    pub(crate) fn reserve(&mut self, credits: usize) -> Option<usize> {
        let buf = self.free.iter().position(|f| *f >= credits)?;
        self.free[buf] -= credits;
        Some(buf)
    }

    pub(crate) fn release(&mut self, buf: usize, credits: usize) {
        if let Some(free) = self.free.get_mut(buf) {
            *free += credits;
        }
    }

    pub(crate) fn total_free(&self) -> usize {
        self.free.iter().sum()
    }
}

struct Link {
    gate: SendGate,
    buf: usize,
    credits: usize,
}

/// The gates a session owns on the server side
///
/// A session is bound once it has a gate clients can send requests over.
/// Each gate reserves as many slots as it has credits; the reservation is
/// given back when the session closes.
#[derive(Default)]
pub struct SessionData {
    links: Vec<Link>,
    rgates: BTreeMap<usize, RecvGate>,
}

impl SessionData {
    pub fn is_bound(&self) -> bool {
        !self.links.is_empty()
    }

    /// Number of send gates created for the session
    pub fn gate_count(&self) -> usize {
        self.links.len()
    }

    /// Selectors of the session's send gates, in creation order
    pub fn gate_sels(&self) -> Vec<CapSel> {
        self.links.iter().map(|l| l.gate.sel()).collect()
    }

    /// Drops the gates created after the first `keep`
    pub(crate) fn rollback(&mut self, keep: usize, pool: &mut SlotPool) {
        for link in self.links.drain(keep..) {
            pool.release(link.buf, link.credits);
        }
    }

    /// Releases the gates and returns their slots to `pool`
    pub(crate) fn release(self, pool: &mut SlotPool) {
        for link in &self.links {
            pool.release(link.buf, link.credits);
        }
    }
}

/// What a handler callback may touch besides its own state
pub struct Context<'a> {
    pub(crate) env: &'a Env,
    pub(crate) ident: u64,
    pub(crate) bufs: &'a [Rc<RecvBuf>],
    pub(crate) pool: &'a mut SlotPool,
    pub(crate) data: &'a mut SessionData,
    pub(crate) dispatch: &'a Dispatch,
}

impl Context<'_> {
    pub fn env(&self) -> &Env {
        self.env
    }

    /// The session's identifier, which is also its gates' label
    pub fn ident(&self) -> u64 {
        self.ident
    }

    pub fn session(&self) -> &SessionData {
        self.data
    }

    /// Creates a send gate clients use to reach this session
    ///
    /// The gate stays with the server; the caller hands out its selector
    /// and the kernel copies it to the client. Replies `NoSpace` if no
    /// buffer has `credits` free slots.
    pub fn create_gate(&mut self, credits: u32) -> Result<CapSel> {
        if credits == 0 || credits == UNLIMITED_CREDITS {
            return Err(Code::InvArgs);
        }
        let slots = credits as usize;
        let buf = self.pool.reserve(slots).ok_or(Code::NoSpace)?;
        let ep: EpId = self.bufs[buf].ep();

        if !self.data.rgates.contains_key(&buf) {
            let rgate = RecvGate::create(&self.bufs[buf], self.ident);
            let dispatch = self.dispatch.clone();
            let ident = self.ident;
            rgate.subscribe(move |msg| dispatch(ident, msg));
            self.data.rgates.insert(buf, rgate);
        }

        match SendGate::create_for(self.env, SEL_VPE, ep, self.ident, credits) {
            Ok(gate) => {
                let sel = gate.sel();
                log::debug!(
                    target: "serv",
                    "session {}: gate {} on buffer {} with {} credits",
                    self.ident,
                    sel,
                    buf,
                    credits
                );
                self.data.links.push(Link {
                    gate,
                    buf,
                    credits: slots,
                });
                Ok(sel)
            }
            Err(code) => {
                self.pool.release(buf, slots);
                Err(code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_buffer_keeps_kernel_slot() {
        let mut pool = SlotPool::new(2, 4);
        assert_eq!(pool.total_free(), 7);
        assert_eq!(pool.reserve(3), Some(0));
        assert_eq!(pool.reserve(1), Some(1));
        assert_eq!(pool.reserve(4), None);
        assert_eq!(pool.reserve(3), Some(1));
        assert_eq!(pool.reserve(1), None);
    }

    #[test]
    fn test_release_returns_slots() {
        let mut pool = SlotPool::new(1, 4);
        assert_eq!(pool.reserve(3), Some(0));
        assert_eq!(pool.reserve(1), None);
        pool.release(0, 3);
        assert_eq!(pool.reserve(2), Some(0));
        pool.release(7, 1);
        assert_eq!(pool.total_free(), 1);
    }
}

//! Event services
//!
//! Clients delegate a send gate to their session and the server pushes
//! events through it. Each subscriber's receive buffer is its own: a full
//! buffer only affects that subscriber.

use crate::handler::{Context, Exchange, Handler};
use crate::server::Server;
use core_types::{CapRange, Code, Ownership, Result};
use gates::SendGate;
use ipc::{IStream, OStream};

/// Server-side state of one event session
#[derive(Default)]
pub struct EventSession {
    gate: Option<SendGate>,
}

impl EventSession {
    pub fn is_subscribed(&self) -> bool {
        self.gate.is_some()
    }

    /// Sends one event to the subscriber
    pub fn notify(&self, data: &[u8]) -> Result<()> {
        self.gate.as_ref().ok_or(Code::InvArgs)?.send(data)
    }
}

/// Accepts one delegated send gate per session
#[derive(Debug, Default)]
pub struct EventHandler {
    subscribed: usize,
}

impl EventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions that delegated their gate
    pub fn subscribers(&self) -> usize {
        self.subscribed
    }
}

impl Handler for EventHandler {
    type Session = EventSession;

    fn open(&mut self, _ctx: &mut Context<'_>, _args: &mut IStream) -> Result<EventSession> {
        Ok(EventSession::default())
    }

    fn delegate(
        &mut self,
        ctx: &mut Context<'_>,
        sess: &mut EventSession,
        count: u32,
        _args: &mut IStream,
    ) -> Result<Exchange> {
        if count != 1 || sess.is_subscribed() {
            return Err(Code::InvArgs);
        }
        // the kernel copies the client's gate here once we replied
        let sel = ctx.env().alloc_sel();
        sess.gate = Some(SendGate::bind(ctx.env(), sel, Ownership::Owned));
        self.subscribed += 1;
        log::debug!(target: "serv", "session {}: subscribed at {}", ctx.ident(), sel);
        Ok(Exchange::with_args(CapRange::single(sel), OStream::new()))
    }

    fn close(&mut self, _ident: u64, sess: EventSession) {
        if sess.is_subscribed() {
            self.subscribed -= 1;
        }
    }
}

impl Server<EventHandler> {
    /// Sends `data` to every subscribed session
    ///
    /// Returns the result per session ident. A subscriber whose buffer is
    /// full gets `NoRingSpace`; the others still receive the event.
    pub fn broadcast(&self, data: &[u8]) -> Vec<(u64, Result<()>)> {
        let mut results = Vec::new();
        self.for_each_session(|ident, sess| {
            if !sess.is_subscribed() {
                return;
            }
            let res = sess.notify(data);
            if let Err(code) = res {
                log::debug!(target: "serv", "event to session {} not delivered: {}", ident, code);
            }
            results.push((ident, res));
        });
        results
    }
}

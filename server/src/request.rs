//! Request/reply services

use crate::handler::{Context, Exchange, Handler};
use crate::ops::OperationTable;
use core_types::{CapRange, Code, Result};
use gates::GateIStream;
use ipc::IStream;

type Opener<S> = Box<dyn FnMut(u64, &mut IStream) -> Result<S>>;

/// A service whose clients send tagged requests over one private gate
///
/// A client obtains exactly one send gate per session; requests on it are
/// dispatched through the operation table.
pub struct RequestHandler<S> {
    ops: OperationTable<S>,
    credits: u32,
    opener: Opener<S>,
}

impl<S> RequestHandler<S> {
    /// Creates a handler; `open` builds the state of each new session
    pub fn new<F>(ops: OperationTable<S>, open: F) -> Self
    where
        F: FnMut(u64, &mut IStream) -> Result<S> + 'static,
    {
        Self {
            ops,
            credits: 1,
            opener: Box::new(open),
        }
    }

    /// Credits of each session gate, which is how many requests a client
    /// may have in flight
    pub fn with_credits(mut self, credits: u32) -> Self {
        self.credits = credits;
        self
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn ops(&self) -> &OperationTable<S> {
        &self.ops
    }
}

impl<S> Handler for RequestHandler<S> {
    type Session = S;

    fn open(&mut self, ctx: &mut Context<'_>, args: &mut IStream) -> Result<S> {
        (self.opener)(ctx.ident(), args)
    }

    fn obtain(
        &mut self,
        ctx: &mut Context<'_>,
        _sess: &mut S,
        count: u32,
        _args: &mut IStream,
    ) -> Result<Exchange> {
        if count != 1 || ctx.session().is_bound() {
            return Err(Code::InvArgs);
        }
        let sel = ctx.create_gate(self.credits)?;
        Ok(Exchange::new(CapRange::single(sel)))
    }

    fn message(&mut self, _ctx: &mut Context<'_>, sess: &mut S, msg: &mut GateIStream) -> Result<()> {
        self.ops.dispatch(sess, msg)
    }
}

//! # Echo Service
//!
//! A request/reply service that sends text back to its clients, reversed
//! or as it came.
//!
//! ## Philosophy
//!
//! The service is the smallest complete user of the server framework: a
//! session is opened through the kernel, the client obtains one send gate
//! and every request on it is dispatched through an operation table.
//!
//! ## Protocol
//!
//! Requests are `[op, ...]`, replies `[code, ...]`:
//!
//! - `[Reverse, text]` → `[0, reversed text]`
//! - `[Echo, text]` → `[0, text]`
//! - `[Count]` → `[0, requests answered so far in this session]`

use core_types::{Code, Result};
use gates::{Env, GateIStream, SendGate, Session};
use ipc::OStream;
use kernel_api::syscalls::reply_stream;
use server::{OperationTable, RequestHandler, Server, ServerConfig};

/// Name the service registers under
pub const SERVICE_NAME: &str = "echo";

/// Operations of the echo protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum EchoOp {
    Reverse = 0,
    Echo = 1,
    Count = 2,
}

impl EchoOp {
    /// Size of the operation table
    pub const COUNT: usize = 3;
}

impl From<EchoOp> for u64 {
    fn from(op: EchoOp) -> u64 {
        op as u64
    }
}

/// State of one client session
#[derive(Debug, Default)]
pub struct EchoSession {
    ident: u64,
    answered: u64,
}

impl EchoSession {
    pub fn ident(&self) -> u64 {
        self.ident
    }

    /// Text requests answered in this session
    pub fn answered(&self) -> u64 {
        self.answered
    }
}

fn ok_reply() -> OStream {
    reply_stream::<()>(&Ok(()))
}

fn reverse(sess: &mut EchoSession, msg: &mut GateIStream) -> Result<()> {
    let text: String = msg.pop()?;
    let reversed: String = text.chars().rev().collect();
    sess.answered += 1;
    log::trace!(target: "serv", "echo {}: reversed {} bytes", sess.ident, text.len());
    msg.reply_msg(ok_reply().push(&reversed))
}

fn echo(sess: &mut EchoSession, msg: &mut GateIStream) -> Result<()> {
    let text: String = msg.pop()?;
    sess.answered += 1;
    msg.reply_msg(ok_reply().push(&text))
}

fn count(sess: &mut EchoSession, msg: &mut GateIStream) -> Result<()> {
    msg.reply_msg(ok_reply().push(&sess.answered))
}

/// The operation table of the echo service
pub fn operations() -> Result<OperationTable<EchoSession>> {
    OperationTable::new(EchoOp::COUNT)
        .with(EchoOp::Reverse.into(), reverse)?
        .with(EchoOp::Echo.into(), echo)?
        .with(EchoOp::Count.into(), count)
}

/// Builds the handler; each session gate gets `credits` credits
pub fn handler(credits: u32) -> Result<RequestHandler<EchoSession>> {
    let ops = operations()?;
    Ok(RequestHandler::new(ops, |ident, _args| {
        Ok(EchoSession { ident, answered: 0 })
    })
    .with_credits(credits))
}

/// Registers the service as `name` on `env`'s VPE
pub fn register(
    env: &Env,
    name: &str,
    credits: u32,
    config: ServerConfig,
) -> Result<Server<RequestHandler<EchoSession>>> {
    Server::with_config(env, name, handler(credits)?, config)
}

/// Registers the service under [`SERVICE_NAME`] and serves until shut down
pub fn serve(env: &Env) -> Result<()> {
    let server = register(env, SERVICE_NAME, 1, ServerConfig::default())?;
    log::info!(target: "serv", "{}: echo service up", env.vpe_id());
    server.run()
}

/// Client side of an echo session
#[derive(Debug)]
pub struct EchoClient {
    session: Session,
    gate: SendGate,
}

impl EchoClient {
    /// Opens a session with the service registered as `name` and obtains
    /// its gate
    pub fn connect(env: &Env, name: &str) -> Result<Self> {
        let session = Session::open(env, name, OStream::new())?;
        let gate = session.connect(OStream::new())?;
        Ok(Self { session, gate })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn gate(&self) -> &SendGate {
        &self.gate
    }

    pub fn reverse(&self, text: &str) -> Result<String> {
        self.text_call(EchoOp::Reverse, text)
    }

    pub fn echo(&self, text: &str) -> Result<String> {
        self.text_call(EchoOp::Echo, text)
    }

    /// Requests the session has answered so far
    pub fn count(&self) -> Result<u64> {
        let mut reply = self.gate.call(OStream::new().push(&u64::from(EchoOp::Count)))?;
        reply.pop()
    }

    fn text_call(&self, op: EchoOp, text: &str) -> Result<String> {
        let mut reply = self
            .gate
            .call(OStream::new().push(&u64::from(op)).push(text))?;
        let text: String = reply.pop()?;
        if !reply.stream().is_empty() {
            return Err(Code::InvArgs);
        }
        Ok(text)
    }
}

//! Engine thread and command register
//!
//! The application hands one command at a time to its engine:
//!
//! ```text
//! app:    IDLE --claim--> BUSY --submit--> PENDING
//! engine: PENDING --take--> RUNNING --complete--> DONE
//!                                   --accept----> ACCEPTED --finish--> IDLE
//! app:    DONE --poll--> IDLE
//! ```
//!
//! Writes are accepted before they land; everything else completes with a
//! result the application picks up.

use crate::endpoint::{EpConfig, MemConfig};
use crate::fabric::{Fabric, PeState};
use core_types::{Code, EpId, Label, Result};
use ipc::{Message, MessageHeader};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::Duration;

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const PENDING: u8 = 2;
const RUNNING: u8 = 3;
const ACCEPTED: u8 = 4;
const DONE: u8 = 5;

/// A command for the engine
#[derive(Debug)]
pub(crate) enum Command {
    Send {
        ep: EpId,
        payload: Vec<u8>,
        reply_ep: Option<EpId>,
        reply_label: Label,
    },
    Reply {
        ep: EpId,
        slot: usize,
        payload: Vec<u8>,
    },
    Read {
        ep: EpId,
        offset: u64,
        len: usize,
    },
    Write {
        ep: EpId,
        offset: u64,
        data: Vec<u8>,
    },
    CmpXchg {
        ep: EpId,
        offset: u64,
        expected: Vec<u8>,
        new: Vec<u8>,
    },
}

pub(crate) struct CmdRegister {
    ctrl: AtomicU8,
    cmd: UnsafeCell<Option<Command>>,
    result: UnsafeCell<Option<Result<Vec<u8>>>>,
}

// SAFETY: `cmd` is written by the application between BUSY and PENDING and
// taken by the engine after PENDING → RUNNING; `result` is written by the
// engine before DONE and taken by the application before IDLE. Each
// hand-over is a release store observed with an acquire load.
unsafe impl Sync for CmdRegister {}

impl CmdRegister {
    pub(crate) fn new() -> Self {
        Self {
            ctrl: AtomicU8::new(IDLE),
            cmd: UnsafeCell::new(None),
            result: UnsafeCell::new(None),
        }
    }

    pub(crate) fn claim(&self) -> bool {
        self.ctrl
            .compare_exchange(IDLE, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn submit(&self, cmd: Command) {
        // SAFETY: BUSY was claimed by the caller.
        unsafe { *self.cmd.get() = Some(cmd) };
        self.ctrl.store(PENDING, Ordering::Release);
    }

    /// Result of the submitted command, if there is one yet
    ///
    /// With `accepted_is_done`, an accepted (or already finished) write
    /// counts as success.
    pub(crate) fn poll(&self, accepted_is_done: bool) -> Option<Result<Vec<u8>>> {
        match self.ctrl.load(Ordering::Acquire) {
            DONE => {
                // SAFETY: DONE hands the result cell to the application.
                let res = unsafe { (*self.result.get()).take() };
                self.ctrl.store(IDLE, Ordering::Release);
                Some(res.unwrap_or(Err(Code::InvArgs)))
            }
            ACCEPTED | IDLE if accepted_is_done => Some(Ok(Vec::new())),
            _ => None,
        }
    }

    fn take(&self) -> Option<Command> {
        self.ctrl
            .compare_exchange(PENDING, RUNNING, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        // SAFETY: RUNNING was claimed by the engine.
        unsafe { (*self.cmd.get()).take() }
    }

    fn complete(&self, res: Result<Vec<u8>>) {
        // SAFETY: the engine owns the register while RUNNING.
        unsafe { *self.result.get() = Some(res) };
        self.ctrl.store(DONE, Ordering::Release);
    }

    fn accept(&self) {
        self.ctrl.store(ACCEPTED, Ordering::Release);
    }

    fn finish(&self) {
        self.ctrl.store(IDLE, Ordering::Release);
    }
}

/// Starts the engine thread of a PE
pub(crate) fn spawn(
    state: Arc<PeState>,
    fabric: Weak<Fabric>,
    idle: Duration,
) -> std::io::Result<Thread> {
    let name = format!("dtu-{}", state.pe());
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || run(state, fabric, idle))?;
    Ok(handle.thread().clone())
}

fn run(state: Arc<PeState>, fabric: Weak<Fabric>, idle: Duration) {
    log::trace!(target: "dtu", "engine of {} started", state.pe());
    while state.is_alive() {
        match state.cmd.take() {
            Some(cmd) => match fabric.upgrade() {
                Some(fabric) => execute(&state, &fabric, cmd),
                None => state.cmd.complete(Err(Code::VpeGone)),
            },
            None => thread::park_timeout(idle),
        }
    }
    log::trace!(target: "dtu", "engine of {} stopped", state.pe());
}

fn execute(state: &PeState, fabric: &Fabric, cmd: Command) {
    let res = match cmd {
        Command::Send {
            ep,
            payload,
            reply_ep,
            reply_label,
        } => send(state, fabric, ep, payload, reply_ep, reply_label),
        Command::Reply { ep, slot, payload } => reply(state, fabric, ep, slot, payload),
        Command::Read { ep, offset, len } => mem_region(state, ep, offset, len, Access::Read)
            .and_then(|addr| fabric.memory().read(addr, len)),
        Command::Write { ep, offset, data } => {
            match mem_region(state, ep, offset, data.len(), Access::Write) {
                Ok(addr) => {
                    state.cmd.accept();
                    if let Err(code) = fabric.memory().write(addr, &data) {
                        log::warn!(target: "dtu", "{}: accepted write failed: {}", state.pe(), code);
                    }
                    state.cmd.finish();
                    return;
                }
                Err(code) => Err(code),
            }
        }
        Command::CmpXchg {
            ep,
            offset,
            expected,
            new,
        } => mem_region(state, ep, offset, new.len(), Access::ReadWrite)
            .and_then(|addr| fabric.memory().compare_exchange(addr, &expected, &new))
            .map(|swapped| vec![u8::from(swapped)]),
    };
    state.cmd.complete(res);
}

fn send(
    state: &PeState,
    fabric: &Fabric,
    ep: EpId,
    payload: Vec<u8>,
    reply_ep: Option<EpId>,
    reply_label: Label,
) -> Result<Vec<u8>> {
    let sep = state.ep(ep)?;
    let EpConfig::Send(cfg) = sep.snapshot() else {
        return Err(Code::EpInvalid);
    };
    if !Message::fits(payload.len(), cfg.msg_order) {
        return Err(Code::InvArgs);
    }
    sep.take_credit(cfg.credits)?;

    let header = MessageHeader {
        label: cfg.label,
        length: payload.len(),
        reply_ep,
        reply_label,
        sender_pe: state.pe(),
        sender_ep: ep,
        is_reply: false,
    };
    log::trace!(
        target: "dtu",
        "{}:{} -> {}:{} label={:#x} len={}",
        state.pe(),
        ep,
        cfg.target_pe,
        cfg.target_ep,
        cfg.label,
        payload.len()
    );
    match fabric.deliver(cfg.target_pe, cfg.target_ep, Message::new(header, payload)) {
        Ok(()) => Ok(Vec::new()),
        Err(code) => {
            sep.return_credit();
            Err(code)
        }
    }
}

fn reply(
    state: &PeState,
    fabric: &Fabric,
    ep: EpId,
    slot: usize,
    payload: Vec<u8>,
) -> Result<Vec<u8>> {
    let rep = state.ep(ep)?;
    if !matches!(rep.snapshot(), EpConfig::Receive(_)) {
        return Err(Code::EpInvalid);
    }
    let msg = rep.ring().header(slot)?;
    // the sender may look at its credits as soon as the reply is visible
    fabric.return_credit(msg.sender_pe, msg.sender_ep);
    let res = match msg.reply_ep {
        Some(reply_ep) => {
            let header = MessageHeader {
                label: msg.reply_label,
                length: payload.len(),
                reply_ep: None,
                reply_label: 0,
                sender_pe: state.pe(),
                sender_ep: ep,
                is_reply: true,
            };
            fabric.deliver(msg.sender_pe, reply_ep, Message::new(header, payload))
        }
        None => Err(Code::InvArgs),
    };
    rep.ring().ack(slot);
    res.map(|_| Vec::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    ReadWrite,
}

fn mem_region(state: &PeState, ep: EpId, offset: u64, len: usize, access: Access) -> Result<u64> {
    let EpConfig::Memory(MemConfig { addr, size, perms }) = state.ep(ep)?.snapshot() else {
        return Err(Code::EpInvalid);
    };
    let allowed = match access {
        Access::Read => perms.read,
        Access::Write => perms.write,
        Access::ReadWrite => perms.read && perms.write,
    };
    if !allowed {
        return Err(Code::NoPerm);
    }
    let len = u64::try_from(len).map_err(|_| Code::InvArgs)?;
    match offset.checked_add(len) {
        Some(end) if end <= size => addr.checked_add(offset).ok_or(Code::InvArgs),
        _ => Err(Code::InvArgs),
    }
}

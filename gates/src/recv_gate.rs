//! Receive buffers, receive gates and fetched messages
//!
//! A [`RecvBuf`] is an endpoint with a ring of message slots. Several
//! [`RecvGate`]s can share one buffer; they are told apart by the label
//! the kernel stamped into each send gate created for them.

use crate::env::Env;
use crate::send_gate::SendGate;
use crate::workloop::SubId;
use core_types::{Code, EpId, Label, Result};
use dtu::{Fetched, RecvConfig};
use ipc::{IStream, MessageHeader, OStream};
use kernel_api::{
    DEF_RBUF_MSG_ORDER, DEF_RBUF_ORDER, DEF_REP, SEL_VPE, SYSC_MSG_ORDER, SYSC_RBUF_ORDER, SYSC_REP,
};
use serde::de::DeserializeOwned;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A receive endpoint and its ring
pub struct RecvBuf {
    env: Env,
    ep: EpId,
    order: u8,
    msg_order: u8,
    owned: bool,
    attached: Cell<bool>,
}

impl RecvBuf {
    /// Attaches a new ring of `2^order` bytes in `2^msg_order` slots
    pub fn create(env: &Env, order: u8, msg_order: u8) -> Result<Rc<Self>> {
        RecvConfig { order, msg_order }.validate()?;
        let ep = env.alloc_ep()?;
        if let Err(code) = env.syscalls().attach_rb(SEL_VPE, ep, order, msg_order) {
            env.free_ep(ep);
            return Err(code);
        }
        log::debug!(
            target: "ipc",
            "{}: recv buffer on ep {} ({} slots)",
            env.vpe_id(),
            ep,
            1usize << (order - msg_order)
        );
        Ok(Rc::new(Self {
            env: env.clone(),
            ep,
            order,
            msg_order,
            owned: true,
            attached: Cell::new(true),
        }))
    }

    /// The buffer every VPE gets for replies to its own requests
    pub fn def(env: &Env) -> Rc<Self> {
        Self::preset(env, DEF_REP, DEF_RBUF_ORDER, DEF_RBUF_MSG_ORDER)
    }

    pub(crate) fn syscall(env: &Env) -> Rc<Self> {
        Self::preset(env, SYSC_REP, SYSC_RBUF_ORDER, SYSC_MSG_ORDER)
    }

    pub(crate) fn preset(env: &Env, ep: EpId, order: u8, msg_order: u8) -> Rc<Self> {
        Rc::new(Self {
            env: env.clone(),
            ep,
            order,
            msg_order,
            owned: false,
            attached: Cell::new(true),
        })
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn ep(&self) -> EpId {
        self.ep
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn msg_order(&self) -> u8 {
        self.msg_order
    }

    pub fn slots(&self) -> usize {
        1 << (self.order - self.msg_order)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    pub fn has_msgs(&self) -> bool {
        self.env.dtu().has_msgs(self.ep)
    }

    /// Takes the oldest unread message, whatever its label
    pub fn fetch(&self) -> Option<GateIStream> {
        let msg = self.env.dtu().fetch_msg(self.ep)?;
        Some(GateIStream::new(&self.env, self.ep, msg))
    }

    /// Blocks until a message arrives
    ///
    /// Gives up with `EpInvalid` once the buffer or the endpoint of `sgate`
    /// was invalidated, and with `VpeGone` once the VPE itself is gone.
    pub fn wait(&self, sgate: Option<&SendGate>) -> Result<GateIStream> {
        let dtu = self.env.dtu();
        loop {
            if let Some(msg) = self.fetch() {
                return Ok(msg);
            }
            if !dtu.is_alive() {
                return Err(Code::VpeGone);
            }
            if !dtu.is_valid(self.ep) {
                return Err(Code::EpInvalid);
            }
            if let Some(ep) = sgate.and_then(|g| g.ep()) {
                if !dtu.is_valid(ep) {
                    return Err(Code::EpInvalid);
                }
            }
            dtu.wait();
        }
    }

    /// Stops receiving: the endpoint is detached and its subscribers dropped
    pub fn disable(&self) -> Result<()> {
        self.env.workloop().drop_buffer(self.ep);
        if self.owned && self.attached.replace(false) {
            self.env.syscalls().detach_rb(SEL_VPE, self.ep)?;
        }
        Ok(())
    }
}

impl Drop for RecvBuf {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(code) = self.disable() {
            log::debug!(target: "ipc", "ep {}: detach failed: {}", self.ep, code);
        }
        self.env.free_ep(self.ep);
    }
}

impl fmt::Debug for RecvBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvBuf")
            .field("ep", &self.ep)
            .field("order", &self.order)
            .field("msg_order", &self.msg_order)
            .field("attached", &self.attached.get())
            .finish()
    }
}

/// Receives the messages of one label on a buffer
pub struct RecvGate {
    buf: Rc<RecvBuf>,
    label: Label,
    subs: RefCell<Vec<SubId>>,
}

impl RecvGate {
    /// A gate with a buffer of its own, using label 0
    pub fn new(env: &Env, order: u8, msg_order: u8) -> Result<Self> {
        let buf = RecvBuf::create(env, order, msg_order)?;
        Ok(Self::create(&buf, 0))
    }

    /// A gate for the messages labelled `label` on a shared buffer
    pub fn create(buf: &Rc<RecvBuf>, label: Label) -> Self {
        Self {
            buf: buf.clone(),
            label,
            subs: RefCell::new(Vec::new()),
        }
    }

    /// The gate on the default reply buffer
    pub fn def(env: &Env) -> Self {
        Self::create(&RecvBuf::def(env), 0)
    }

    pub fn buf(&self) -> &Rc<RecvBuf> {
        &self.buf
    }

    pub fn env(&self) -> &Env {
        self.buf.env()
    }

    pub fn ep(&self) -> EpId {
        self.buf.ep()
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn fetch(&self) -> Option<GateIStream> {
        self.buf.fetch()
    }

    /// Blocks until a message arrives on the buffer
    pub fn wait(&self, sgate: Option<&SendGate>) -> Result<GateIStream> {
        self.buf.wait(sgate)
    }

    /// Replies to the message in `slot`
    pub fn reply(&self, data: &[u8], slot: usize) -> Result<()> {
        self.env().dtu().reply(self.ep(), slot, data)
    }

    /// Has `handler` called by the work loop for each message with this
    /// gate's label
    ///
    /// Handlers subscribed to the same label run in subscription order. An
    /// error returned by a handler stops the loop.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: FnMut(&mut GateIStream) -> Result<()> + 'static,
    {
        let id = self
            .env()
            .workloop()
            .subscribe(self.ep(), self.label, Rc::new(RefCell::new(handler)));
        self.subs.borrow_mut().push(id);
    }

    /// Drops all handlers of this gate
    pub fn unsubscribe(&self) {
        let subs = std::mem::take(&mut *self.subs.borrow_mut());
        for id in subs {
            self.env().workloop().unsubscribe(self.ep(), id);
        }
    }
}

impl Drop for RecvGate {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for RecvGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvGate")
            .field("ep", &self.ep())
            .field("label", &self.label)
            .finish()
    }
}

/// A fetched message and a reader over its payload
///
/// The slot stays occupied until the message is replied to or the stream
/// is dropped.
pub struct GateIStream {
    env: Env,
    ep: EpId,
    slot: usize,
    header: MessageHeader,
    payload: Vec<u8>,
    stream: IStream,
    done: bool,
}

impl GateIStream {
    pub(crate) fn new(env: &Env, ep: EpId, msg: Fetched) -> Self {
        let stream = IStream::from_bytes(&msg.payload).unwrap_or_default();
        Self {
            env: env.clone(),
            ep,
            slot: msg.slot,
            header: msg.header,
            payload: msg.payload,
            stream,
            done: false,
        }
    }

    /// The label of the send gate the message came through
    pub fn label(&self) -> Label {
        self.header.label
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn ep(&self) -> EpId {
        self.ep
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pop<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.stream.pop()
    }

    pub fn pop_code(&mut self) -> Result<()> {
        self.stream.pop_code()
    }

    pub fn pop_stream(&mut self) -> Result<IStream> {
        self.stream.pop_stream()
    }

    pub fn stream(&mut self) -> &mut IStream {
        &mut self.stream
    }

    pub fn rewind(&mut self) {
        self.stream.rewind();
    }

    /// Frees the slot and keeps only the payload values not yet taken
    pub fn into_stream(mut self) -> IStream {
        std::mem::take(&mut self.stream)
    }

    /// Returns true once the message was replied to or acknowledged
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Sends `data` back to the sender
    ///
    /// The slot is freed and the sender's credit returned even if the
    /// reply cannot be delivered. A message can be replied to only once.
    pub fn reply(&mut self, data: &[u8]) -> Result<()> {
        if self.done {
            return Err(Code::InvArgs);
        }
        self.done = true;
        self.env.dtu().reply(self.ep, self.slot, data)
    }

    pub fn reply_msg(&mut self, os: OStream) -> Result<()> {
        let data = os.into_bytes()?;
        self.reply(&data)
    }

    /// Replies with nothing but an error code
    pub fn reply_error(&mut self, code: Code) -> Result<()> {
        self.reply_msg(OStream::new().push(&code.raw()))
    }

    /// Frees the slot without replying
    pub fn ack(&mut self) {
        if !self.done {
            self.done = true;
            self.env.dtu().ack(self.ep, self.slot);
        }
    }
}

impl Drop for GateIStream {
    fn drop(&mut self) {
        self.ack();
    }
}

impl fmt::Debug for GateIStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateIStream")
            .field("ep", &self.ep)
            .field("slot", &self.slot)
            .field("header", &self.header)
            .finish()
    }
}

//! Send gates

use crate::cap::ObjCap;
use crate::env::Env;
use crate::gate::Gate;
use crate::recv_gate::{GateIStream, RecvBuf, RecvGate};
use core_types::{CapKind, CapSel, Code, EpId, Label, Ownership, Result, INVALID_SEL};
use ipc::OStream;
use kernel_api::{DEF_REP, SEL_VPE, SYSC_REP, SYSC_SEP};
use std::cell::Cell;
use std::fmt;

/// Permission to send to one receive gate
///
/// Each send uses up one credit; the receiver's reply returns it. Replies
/// go to the default reply buffer unless another one is set.
pub struct SendGate {
    gate: Gate,
    reply_ep: Cell<EpId>,
}

impl SendGate {
    /// Creates a gate to `rgate`, which lives in the calling VPE
    pub fn create(rgate: &RecvGate, credits: u32) -> Result<Self> {
        Self::create_for(rgate.env(), SEL_VPE, rgate.ep(), rgate.label(), credits)
    }

    /// Creates a gate to endpoint `ep` of the VPE at `vpe_sel`
    pub fn create_for(
        env: &Env,
        vpe_sel: CapSel,
        ep: EpId,
        label: Label,
        credits: u32,
    ) -> Result<Self> {
        let sel = env.alloc_sel();
        if let Err(code) = env.syscalls().create_gate(vpe_sel, sel, label, ep, credits) {
            env.free_sel(sel);
            return Err(code);
        }
        Ok(Self::bind(env, sel, Ownership::Owned))
    }

    /// Wraps an existing send capability
    pub fn bind(env: &Env, sel: CapSel, ownership: Ownership) -> Self {
        Self {
            gate: Gate::new(ObjCap::new(env, CapKind::Send, sel, ownership)),
            reply_ep: Cell::new(DEF_REP),
        }
    }

    /// The gate to the kernel every VPE starts with
    pub(crate) fn syscall(env: &Env) -> Self {
        Self {
            gate: Gate::preset(
                ObjCap::new(env, CapKind::Send, INVALID_SEL, Ownership::Static),
                SYSC_SEP,
            ),
            reply_ep: Cell::new(SYSC_REP),
        }
    }

    /// Has replies delivered to `buf` instead of the default buffer
    pub fn set_reply_buf(&self, buf: &RecvBuf) {
        self.reply_ep.set(buf.ep());
    }

    pub fn sel(&self) -> CapSel {
        self.gate.sel()
    }

    /// The endpoint, once the gate was used or activated
    pub fn ep(&self) -> Option<EpId> {
        self.gate.ep()
    }

    pub fn ownership(&self) -> Ownership {
        self.gate.cap().ownership()
    }

    /// Binds the gate to an endpoint now instead of on first use
    pub fn activate(&self) -> Result<EpId> {
        self.gate.activate()
    }

    /// Credits left right now; `None` if unlimited
    pub fn credits(&self) -> Result<Option<u32>> {
        let ep = self.gate.activate()?;
        Ok(self.gate.env().dtu().credits(ep))
    }

    /// Sends `data` without waiting for a reply
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let reply_ep = self.reply_ep.get();
        self.gate
            .run(|dtu, ep| dtu.send(ep, data, 0, Some(reply_ep)))
    }

    pub fn send_msg(&self, os: OStream) -> Result<()> {
        let data = os.into_bytes()?;
        self.send(&data)
    }

    /// Sends `data` and blocks until the matching reply arrives
    ///
    /// Replies left over from earlier requests are dropped. If the gate's
    /// endpoint is invalidated while waiting, the receiver is gone.
    pub fn send_receive(&self, data: &[u8]) -> Result<GateIStream> {
        let env = self.gate.env();
        let label = env.next_reply_label();
        let reply_ep = self.reply_ep.get();
        self.gate
            .run(|dtu, ep| dtu.send(ep, data, label, Some(reply_ep)))?;

        let rbuf = if reply_ep == SYSC_REP {
            RecvBuf::syscall(env)
        } else if reply_ep == DEF_REP {
            RecvBuf::def(env)
        } else {
            RecvBuf::preset(env, reply_ep, 0, 0)
        };
        loop {
            let msg = rbuf.wait(Some(self)).map_err(|code| match code {
                Code::EpInvalid => Code::RecvGone,
                other => other,
            })?;
            if msg.label() == label {
                return Ok(msg);
            }
            log::debug!(
                target: "ipc",
                "ep {}: dropping stale reply {:#x}, expecting {:#x}",
                reply_ep,
                msg.label(),
                label
            );
        }
    }

    /// Sends a request and returns the reply with its code already checked
    pub fn call(&self, os: OStream) -> Result<GateIStream> {
        let data = os.into_bytes()?;
        let mut reply = self.send_receive(&data)?;
        reply.pop_code()?;
        Ok(reply)
    }
}

impl fmt::Debug for SendGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendGate")
            .field("sel", &self.sel())
            .field("ep", &self.ep())
            .field("reply_ep", &self.reply_ep.get())
            .finish()
    }
}

//! Kernel calls
//!
//! A syscall is an ordinary message on the VPE's syscall gate, followed by
//! a blocking wait for the reply on the syscall reply buffer. The kernel's
//! error code comes back as the first reply value.

use crate::env::Env;
use crate::recv_gate::GateIStream;
use crate::send_gate::SendGate;
use core_types::{CapRange, CapSel, EpId, Label, MemoryPerms, Result, VpeId};
use ipc::{IStream, OStream};
use kernel_api::syscalls::{
    ActivateArgs, AttachRbArgs, CreateGateArgs, CreateMapArgs, CreateSessArgs, CreateSessAtArgs,
    CreateSrvArgs, CreateVpeArgs, DeriveMemArgs, DetachRbArgs, ExchangeArgs, ExitArgs, ReqMemArgs,
    RevokeArgs, SessionXchgArgs, VpeCtrlArgs,
};
use kernel_api::{SyscallRequest, VpeOp};

/// Kernel calls on behalf of one VPE
pub struct Syscalls<'e> {
    env: &'e Env,
}

impl<'e> Syscalls<'e> {
    pub(crate) fn new(env: &'e Env) -> Self {
        Self { env }
    }

    fn call(&self, req: SyscallRequest) -> Result<GateIStream> {
        let op = req.opcode();
        log::trace!(target: "sysc", "{} -> {:?}", self.env.vpe_id(), op);
        let data = req.encode()?;
        let mut reply = SendGate::syscall(self.env).send_receive(&data)?;
        if let Err(code) = reply.pop_code() {
            log::debug!(target: "sysc", "{} {:?}: {}", self.env.vpe_id(), op, code);
            return Err(code);
        }
        Ok(reply)
    }

    fn simple(&self, req: SyscallRequest) -> Result<()> {
        self.call(req).map(|_| ())
    }

    /// Round trip without side effect
    pub fn noop(&self) -> Result<()> {
        self.simple(SyscallRequest::Noop)
    }

    /// Binds capability `new_sel` to endpoint `ep`
    ///
    /// `old_sel` names the capability bound so far, or `INVALID_SEL`.
    /// Passing the same selector twice refreshes a binding whose peer moved.
    pub fn activate(&self, ep: EpId, old_sel: CapSel, new_sel: CapSel) -> Result<()> {
        self.simple(SyscallRequest::Activate(ActivateArgs {
            ep,
            old_sel,
            new_sel,
        }))
    }

    /// Registers service `name`, reached through send gate `gate_sel`
    pub fn create_srv(&self, gate_sel: CapSel, srv_sel: CapSel, name: &str) -> Result<()> {
        self.simple(SyscallRequest::CreateSrv(CreateSrvArgs {
            gate_sel,
            srv_sel,
            name: name.to_string(),
        }))
    }

    /// Opens a session with service `name`
    pub fn create_sess(&self, sess_sel: CapSel, name: &str, args: OStream) -> Result<()> {
        self.simple(SyscallRequest::CreateSess(CreateSessArgs {
            sess_sel,
            name: name.to_string(),
            args: args.into_values()?,
        }))
    }

    /// Creates a session capability for one of the caller's own sessions
    pub fn create_sess_at(&self, srv_sel: CapSel, sess_sel: CapSel, ident: u64) -> Result<()> {
        self.simple(SyscallRequest::CreateSessAt(CreateSessAtArgs {
            srv_sel,
            sess_sel,
            ident,
        }))
    }

    /// Creates a send capability to endpoint `ep` of the VPE at `vpe_sel`
    pub fn create_gate(
        &self,
        vpe_sel: CapSel,
        dst_sel: CapSel,
        label: Label,
        ep: EpId,
        credits: u32,
    ) -> Result<()> {
        self.simple(SyscallRequest::CreateGate(CreateGateArgs {
            vpe_sel,
            dst_sel,
            label,
            ep,
            credits,
        }))
    }

    /// Creates a child VPE on a free PE
    pub fn create_vpe(&self, dst_sel: CapSel, name: &str) -> Result<VpeId> {
        let mut reply = self.call(SyscallRequest::CreateVpe(CreateVpeArgs {
            dst_sel,
            name: name.to_string(),
        }))?;
        Ok(VpeId::new(reply.pop()?))
    }

    /// Maps memory pages; there is no paging on this platform
    pub fn create_map(
        &self,
        vpe_sel: CapSel,
        mem_sel: CapSel,
        first: u64,
        pages: u64,
        perms: MemoryPerms,
    ) -> Result<()> {
        self.simple(SyscallRequest::CreateMap(CreateMapArgs {
            vpe_sel,
            mem_sel,
            first,
            pages,
            perms,
        }))
    }

    /// Configures endpoint `ep` as a receive buffer
    pub fn attach_rb(&self, vpe_sel: CapSel, ep: EpId, order: u8, msg_order: u8) -> Result<()> {
        self.simple(SyscallRequest::AttachRb(AttachRbArgs {
            vpe_sel,
            ep,
            order,
            msg_order,
        }))
    }

    /// Invalidates receive buffer `ep`
    pub fn detach_rb(&self, vpe_sel: CapSel, ep: EpId) -> Result<()> {
        self.simple(SyscallRequest::DetachRb(DetachRbArgs { vpe_sel, ep }))
    }

    /// Copies capabilities between the caller and the VPE at `vpe_sel`
    ///
    /// With `obtain` unset, `own` is copied to `other` in the other VPE;
    /// otherwise `other` is copied to `own`.
    pub fn exchange(
        &self,
        vpe_sel: CapSel,
        own: CapRange,
        other: CapRange,
        obtain: bool,
    ) -> Result<()> {
        self.simple(SyscallRequest::Exchange(ExchangeArgs {
            vpe_sel,
            own,
            other,
            obtain,
        }))
    }

    /// Controls a child VPE
    ///
    /// Returns the exit code for [`VpeOp::Wait`], the new PE for
    /// [`VpeOp::Migrate`] and zero otherwise.
    pub fn vpe_ctrl(&self, vpe_sel: CapSel, op: VpeOp) -> Result<i64> {
        let mut reply = self.call(SyscallRequest::VpeCtrl(VpeCtrlArgs { vpe_sel, op }))?;
        reply.pop()
    }

    /// Hands the caller's capabilities `caps` to the server of a session
    pub fn delegate(&self, sess_sel: CapSel, caps: CapRange, args: OStream) -> Result<IStream> {
        let mut reply = self.call(SyscallRequest::Delegate(SessionXchgArgs {
            sess_sel,
            caps,
            args: args.into_values()?,
        }))?;
        reply.pop_stream()
    }

    /// Receives capabilities from the server of a session into `caps`
    pub fn obtain(&self, sess_sel: CapSel, caps: CapRange, args: OStream) -> Result<IStream> {
        let mut reply = self.call(SyscallRequest::Obtain(SessionXchgArgs {
            sess_sel,
            caps,
            args: args.into_values()?,
        }))?;
        reply.pop_stream()
    }

    /// Allocates global memory, at `addr` if given
    pub fn req_mem(
        &self,
        dst_sel: CapSel,
        addr: Option<u64>,
        size: u64,
        perms: MemoryPerms,
    ) -> Result<()> {
        self.simple(SyscallRequest::ReqMem(ReqMemArgs {
            dst_sel,
            addr,
            size,
            perms,
        }))
    }

    /// Derives a memory capability for a subrange of `src_sel`
    pub fn derive_mem(
        &self,
        src_sel: CapSel,
        dst_sel: CapSel,
        offset: u64,
        size: u64,
        perms: MemoryPerms,
    ) -> Result<()> {
        self.simple(SyscallRequest::DeriveMem(DeriveMemArgs {
            src_sel,
            dst_sel,
            offset,
            size,
            perms,
        }))
    }

    /// Revokes `caps` of the VPE at `vpe_sel` and everything derived from them
    ///
    /// With `own` unset only the derived capabilities go away.
    pub fn revoke(&self, vpe_sel: CapSel, caps: CapRange, own: bool) -> Result<()> {
        self.simple(SyscallRequest::Revoke(RevokeArgs {
            vpe_sel,
            caps,
            own,
        }))
    }

    /// Terminates the caller; there is no reply
    pub fn exit(&self, code: i32) -> Result<()> {
        log::trace!(target: "sysc", "{} -> Exit({})", self.env.vpe_id(), code);
        let data = SyscallRequest::Exit(ExitArgs { code }).encode()?;
        SendGate::syscall(self.env).send(&data)
    }
}

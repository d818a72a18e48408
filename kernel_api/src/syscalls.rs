//! Syscall boundary implemented as tagged messages.
//!
//! A request is `[tag, record]`; a reply is `[code, result...]`. The
//! record layout is fixed per tag, so [`SyscallRequest::decode`] either
//! yields one of the closed set of operations or `InvArgs`.

use core_types::{CapRange, CapSel, Code, EpId, Label, MemoryPerms, Result};
use ipc::{IStream, OStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum Syscall {
    Activate = 0,
    CreateSrv,
    CreateSess,
    CreateSessAt,
    CreateGate,
    CreateVpe,
    CreateMap,
    AttachRb,
    DetachRb,
    Exchange,
    VpeCtrl,
    Delegate,
    Obtain,
    ReqMem,
    DeriveMem,
    Revoke,
    Exit,
    Noop,
}

impl Syscall {
    const ALL: [Syscall; 18] = [
        Syscall::Activate,
        Syscall::CreateSrv,
        Syscall::CreateSess,
        Syscall::CreateSessAt,
        Syscall::CreateGate,
        Syscall::CreateVpe,
        Syscall::CreateMap,
        Syscall::AttachRb,
        Syscall::DetachRb,
        Syscall::Exchange,
        Syscall::VpeCtrl,
        Syscall::Delegate,
        Syscall::Obtain,
        Syscall::ReqMem,
        Syscall::DeriveMem,
        Syscall::Revoke,
        Syscall::Exit,
        Syscall::Noop,
    ];
}

impl TryFrom<u64> for Syscall {
    type Error = Code;

    fn try_from(raw: u64) -> Result<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(Code::InvArgs)
    }
}

/// Operations of the `VpeCtrl` syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpeOp {
    /// Let the VPE run
    Start,
    /// Tear the VPE down
    Stop,
    /// Reply with the exit code once the VPE exited
    Wait,
    /// Move the VPE to another PE
    Migrate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateArgs {
    pub ep: EpId,
    pub old_sel: CapSel,
    pub new_sel: CapSel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSrvArgs {
    pub gate_sel: CapSel,
    pub srv_sel: CapSel,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessArgs {
    pub sess_sel: CapSel,
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessAtArgs {
    pub srv_sel: CapSel,
    pub sess_sel: CapSel,
    pub ident: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGateArgs {
    pub vpe_sel: CapSel,
    pub dst_sel: CapSel,
    pub label: Label,
    pub ep: EpId,
    pub credits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVpeArgs {
    pub dst_sel: CapSel,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMapArgs {
    pub vpe_sel: CapSel,
    pub mem_sel: CapSel,
    pub first: u64,
    pub pages: u64,
    pub perms: MemoryPerms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRbArgs {
    pub vpe_sel: CapSel,
    pub ep: EpId,
    pub order: u8,
    pub msg_order: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachRbArgs {
    pub vpe_sel: CapSel,
    pub ep: EpId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeArgs {
    pub vpe_sel: CapSel,
    pub own: CapRange,
    pub other: CapRange,
    /// Copy from the other VPE instead of to it
    pub obtain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpeCtrlArgs {
    pub vpe_sel: CapSel,
    pub op: VpeOp,
}

/// Arguments of capability exchanges over a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionXchgArgs {
    pub sess_sel: CapSel,
    pub caps: CapRange,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqMemArgs {
    pub dst_sel: CapSel,
    /// Fixed physical address, or anywhere
    pub addr: Option<u64>,
    pub size: u64,
    pub perms: MemoryPerms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeriveMemArgs {
    pub src_sel: CapSel,
    pub dst_sel: CapSel,
    pub offset: u64,
    pub size: u64,
    pub perms: MemoryPerms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeArgs {
    pub vpe_sel: CapSel,
    pub caps: CapRange,
    /// Also remove the capabilities themselves, not only their children
    pub own: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitArgs {
    pub code: i32,
}

/// A decoded syscall
#[derive(Debug, Clone, PartialEq)]
pub enum SyscallRequest {
    Activate(ActivateArgs),
    CreateSrv(CreateSrvArgs),
    CreateSess(CreateSessArgs),
    CreateSessAt(CreateSessAtArgs),
    CreateGate(CreateGateArgs),
    CreateVpe(CreateVpeArgs),
    CreateMap(CreateMapArgs),
    AttachRb(AttachRbArgs),
    DetachRb(DetachRbArgs),
    Exchange(ExchangeArgs),
    VpeCtrl(VpeCtrlArgs),
    Delegate(SessionXchgArgs),
    Obtain(SessionXchgArgs),
    ReqMem(ReqMemArgs),
    DeriveMem(DeriveMemArgs),
    Revoke(RevokeArgs),
    Exit(ExitArgs),
    Noop,
}

impl SyscallRequest {
    /// Tag of this request
    pub fn opcode(&self) -> Syscall {
        match self {
            SyscallRequest::Activate(_) => Syscall::Activate,
            SyscallRequest::CreateSrv(_) => Syscall::CreateSrv,
            SyscallRequest::CreateSess(_) => Syscall::CreateSess,
            SyscallRequest::CreateSessAt(_) => Syscall::CreateSessAt,
            SyscallRequest::CreateGate(_) => Syscall::CreateGate,
            SyscallRequest::CreateVpe(_) => Syscall::CreateVpe,
            SyscallRequest::CreateMap(_) => Syscall::CreateMap,
            SyscallRequest::AttachRb(_) => Syscall::AttachRb,
            SyscallRequest::DetachRb(_) => Syscall::DetachRb,
            SyscallRequest::Exchange(_) => Syscall::Exchange,
            SyscallRequest::VpeCtrl(_) => Syscall::VpeCtrl,
            SyscallRequest::Delegate(_) => Syscall::Delegate,
            SyscallRequest::Obtain(_) => Syscall::Obtain,
            SyscallRequest::ReqMem(_) => Syscall::ReqMem,
            SyscallRequest::DeriveMem(_) => Syscall::DeriveMem,
            SyscallRequest::Revoke(_) => Syscall::Revoke,
            SyscallRequest::Exit(_) => Syscall::Exit,
            SyscallRequest::Noop => Syscall::Noop,
        }
    }

    /// Encodes the request into message payload bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let os = OStream::new().push(&(self.opcode() as u64));
        let os = match self {
            SyscallRequest::Activate(a) => os.push(a),
            SyscallRequest::CreateSrv(a) => os.push(a),
            SyscallRequest::CreateSess(a) => os.push(a),
            SyscallRequest::CreateSessAt(a) => os.push(a),
            SyscallRequest::CreateGate(a) => os.push(a),
            SyscallRequest::CreateVpe(a) => os.push(a),
            SyscallRequest::CreateMap(a) => os.push(a),
            SyscallRequest::AttachRb(a) => os.push(a),
            SyscallRequest::DetachRb(a) => os.push(a),
            SyscallRequest::Exchange(a) => os.push(a),
            SyscallRequest::VpeCtrl(a) => os.push(a),
            SyscallRequest::Delegate(a) | SyscallRequest::Obtain(a) => os.push(a),
            SyscallRequest::ReqMem(a) => os.push(a),
            SyscallRequest::DeriveMem(a) => os.push(a),
            SyscallRequest::Revoke(a) => os.push(a),
            SyscallRequest::Exit(a) => os.push(a),
            SyscallRequest::Noop => os,
        };
        os.into_bytes()
    }

    /// Decodes message payload bytes into a request
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut is = IStream::from_bytes(bytes)?;
        Self::decode_stream(&mut is)
    }

    /// Decodes a request from a stream positioned at the tag
    pub fn decode_stream(is: &mut IStream) -> Result<Self> {
        let op = Syscall::try_from(is.pop::<u64>()?)?;
        Ok(match op {
            Syscall::Activate => SyscallRequest::Activate(is.pop()?),
            Syscall::CreateSrv => SyscallRequest::CreateSrv(is.pop()?),
            Syscall::CreateSess => SyscallRequest::CreateSess(is.pop()?),
            Syscall::CreateSessAt => SyscallRequest::CreateSessAt(is.pop()?),
            Syscall::CreateGate => SyscallRequest::CreateGate(is.pop()?),
            Syscall::CreateVpe => SyscallRequest::CreateVpe(is.pop()?),
            Syscall::CreateMap => SyscallRequest::CreateMap(is.pop()?),
            Syscall::AttachRb => SyscallRequest::AttachRb(is.pop()?),
            Syscall::DetachRb => SyscallRequest::DetachRb(is.pop()?),
            Syscall::Exchange => SyscallRequest::Exchange(is.pop()?),
            Syscall::VpeCtrl => SyscallRequest::VpeCtrl(is.pop()?),
            Syscall::Delegate => SyscallRequest::Delegate(is.pop()?),
            Syscall::Obtain => SyscallRequest::Obtain(is.pop()?),
            Syscall::ReqMem => SyscallRequest::ReqMem(is.pop()?),
            Syscall::DeriveMem => SyscallRequest::DeriveMem(is.pop()?),
            Syscall::Revoke => SyscallRequest::Revoke(is.pop()?),
            Syscall::Exit => SyscallRequest::Exit(is.pop()?),
            Syscall::Noop => SyscallRequest::Noop,
        })
    }
}

/// Starts a reply payload with the raw code of `res`
pub fn reply_stream<T>(res: &Result<T>) -> OStream {
    OStream::new().push(&Code::to_raw(res))
}

//! Syscall handlers
//!
//! One handler per operation. A handler checks everything before it
//! changes anything, so a failed syscall leaves no trace but its audit
//! record.

use crate::cap_table::{CapRef, KObject, MemObject, SendObject, SessionObject};
use crate::kernel::{Closer, Kernel, Outcome, KSYSC_REP};
use crate::pending::{CallQueue, Caller, ServiceCall, Waiter};
use crate::services::Service;
use core_types::{CapKind, CapabilityEvent, Code, Result, ServiceId, VpeId, INVALID_SEL};
use dtu::{EpConfig, MemConfig, RecvConfig, SendConfig, EP_COUNT};
use ipc::OStream;
use kernel_api::syscalls::{
    ActivateArgs, AttachRbArgs, CreateGateArgs, CreateSessArgs, CreateSessAtArgs, CreateSrvArgs,
    CreateVpeArgs, DeriveMemArgs, DetachRbArgs, ExchangeArgs, ReqMemArgs, RevokeArgs,
    SessionXchgArgs, VpeCtrlArgs,
};
use kernel_api::{ServiceRequest, SyscallRequest, VpeOp, FIRST_FREE_EP, SEL_MEM, SEL_VPE};

impl Kernel {
    /// Runs the handler of `req` on behalf of `caller`
    pub(crate) fn dispatch(&mut self, caller: Caller, req: SyscallRequest) -> Result<Outcome> {
        let vpe = caller.vpe;
        match req {
            SyscallRequest::Noop => Ok(Outcome::empty()),
            SyscallRequest::Activate(args) => self.activate(vpe, args),
            SyscallRequest::CreateSrv(args) => self.create_srv(vpe, args),
            SyscallRequest::CreateSess(args) => self.create_sess(caller, args),
            SyscallRequest::CreateSessAt(args) => self.create_sess_at(vpe, args),
            SyscallRequest::CreateGate(args) => self.create_gate(vpe, args),
            SyscallRequest::CreateVpe(args) => self.create_vpe_call(vpe, args),
            SyscallRequest::CreateMap(_) => Err(Code::NotSup),
            SyscallRequest::AttachRb(args) => self.attach_rb(vpe, args),
            SyscallRequest::DetachRb(args) => self.detach_rb(vpe, args),
            SyscallRequest::Exchange(args) => self.exchange(vpe, args),
            SyscallRequest::VpeCtrl(args) => self.vpe_ctrl(caller, args),
            SyscallRequest::Delegate(args) => self.session_xchg(caller, args, false),
            SyscallRequest::Obtain(args) => self.session_xchg(caller, args, true),
            SyscallRequest::ReqMem(args) => self.req_mem(vpe, args),
            SyscallRequest::DeriveMem(args) => self.derive_mem(vpe, args),
            SyscallRequest::Revoke(args) => self.revoke(caller, args),
            SyscallRequest::Exit(args) => {
                // no reply; the slot is free again right away
                self.dtu.ack(KSYSC_REP, caller.slot);
                self.terminate(vpe, args.code);
                Ok(Outcome::Silent)
            }
        }
    }

    fn activate(&mut self, vpe: VpeId, args: ActivateArgs) -> Result<Outcome> {
        let ActivateArgs { ep, old_sel, new_sel } = args;
        if !(FIRST_FREE_EP..EP_COUNT).contains(&ep) {
            return Err(Code::InvArgs);
        }
        let pe = self.alive(vpe)?.pe;

        let cfg = if new_sel == INVALID_SEL {
            EpConfig::Invalid
        } else {
            match self.caps.obj(CapRef::new(vpe, new_sel))? {
                KObject::Send(s) => EpConfig::Send(self.send_config(s)?),
                KObject::Mem(m) => EpConfig::Memory(MemConfig {
                    addr: m.addr,
                    size: m.size,
                    perms: m.perms,
                }),
                _ => return Err(Code::InvArgs),
            }
        };
        self.fabric.configure(pe, ep, cfg)?;

        let rec = self.vpes.get_mut(&vpe).ok_or(Code::VpeGone)?;
        if new_sel == INVALID_SEL {
            rec.bindings[ep] = None;
            self.record(CapabilityEvent::Deactivated { vpe, ep });
        } else {
            rec.bindings[ep] = Some(new_sel);
            self.record(CapabilityEvent::Activated {
                vpe,
                sel: new_sel,
                ep,
            });
        }
        log::debug!(target: "sysc", "{}: ep {} {} -> {}", vpe, ep, old_sel, new_sel);
        Ok(Outcome::empty())
    }

    /// Where a send capability points right now
    fn send_config(&self, s: SendObject) -> Result<SendConfig> {
        let pe = self.alive(s.vpe)?.pe;
        match self.fabric.ep_config(pe, s.ep)? {
            EpConfig::Receive(r) => Ok(SendConfig {
                target_pe: pe,
                target_ep: s.ep,
                label: s.label,
                msg_order: r.msg_order,
                credits: s.credits,
            }),
            _ => Err(Code::RecvGone),
        }
    }

    fn create_srv(&mut self, vpe: VpeId, args: CreateSrvArgs) -> Result<Outcome> {
        let CreateSrvArgs {
            gate_sel,
            srv_sel,
            name,
        } = args;
        let gate = match self.caps.obj(CapRef::new(vpe, gate_sel))? {
            KObject::Send(s) if s.vpe == vpe => s,
            _ => return Err(Code::InvArgs),
        };
        let srv_ref = CapRef::new(vpe, srv_sel);
        self.caps.check_free(srv_ref)?;

        let id = self.services.register(Service {
            id: ServiceId::new(),
            name: name.clone(),
            vpe,
            srv_sel,
            ep: gate.ep,
            label: gate.label,
            queue: CallQueue::with_capacity(self.config.service_queue_len),
            in_flight: None,
            shutdown_sent: false,
        })?;
        self.caps.insert(srv_ref, KObject::Service(id), None)?;
        self.record(CapabilityEvent::Created {
            vpe,
            sel: srv_sel,
            kind: CapKind::Service,
        });
        self.record(CapabilityEvent::ServiceRegistered {
            service: id,
            name: name.clone(),
        });
        log::info!(target: "sysc", "{} registered service '{}'", vpe, name);
        Ok(Outcome::empty())
    }

    fn create_sess(&mut self, caller: Caller, args: CreateSessArgs) -> Result<Outcome> {
        let CreateSessArgs {
            sess_sel,
            name,
            args,
        } = args;
        let service = self.services.find(&name).ok_or(Code::InvArgs)?.id;
        self.caps.check_free(CapRef::new(caller.vpe, sess_sel))?;
        self.enqueue(ServiceCall {
            service,
            req: ServiceRequest::Open { args },
            waiter: Waiter::Open { caller, sess_sel },
        })?;
        self.pump(service);
        Ok(Outcome::Deferred)
    }

    fn create_sess_at(&mut self, vpe: VpeId, args: CreateSessAtArgs) -> Result<Outcome> {
        let CreateSessAtArgs {
            srv_sel,
            sess_sel,
            ident,
        } = args;
        let srv_ref = CapRef::new(vpe, srv_sel);
        let KObject::Service(service) = self.caps.obj(srv_ref)? else {
            return Err(Code::InvArgs);
        };
        let obj = KObject::Session(SessionObject {
            service,
            ident,
            origin: true,
        });
        self.caps
            .insert(CapRef::new(vpe, sess_sel), obj, Some(srv_ref))?;
        self.record(CapabilityEvent::Created {
            vpe,
            sel: sess_sel,
            kind: CapKind::Session,
        });
        Ok(Outcome::empty())
    }

    fn create_gate(&mut self, vpe: VpeId, args: CreateGateArgs) -> Result<Outcome> {
        let CreateGateArgs {
            vpe_sel,
            dst_sel,
            label,
            ep,
            credits,
        } = args;
        let target = self.vpe_of_sel(vpe, vpe_sel)?;
        self.alive(target)?;
        if credits == 0 || ep >= EP_COUNT {
            return Err(Code::InvArgs);
        }
        let obj = KObject::Send(SendObject {
            vpe: target,
            ep,
            label,
            credits,
        });
        self.caps.insert(CapRef::new(vpe, dst_sel), obj, None)?;
        self.record(CapabilityEvent::Created {
            vpe,
            sel: dst_sel,
            kind: CapKind::Send,
        });
        Ok(Outcome::empty())
    }

    fn create_vpe_call(&mut self, vpe: VpeId, args: CreateVpeArgs) -> Result<Outcome> {
        let child = self.create_vpe(&args.name, Some(CapRef::new(vpe, args.dst_sel)))?;
        Ok(Outcome::Done(OStream::new().push(&child.raw())))
    }

    fn attach_rb(&mut self, vpe: VpeId, args: AttachRbArgs) -> Result<Outcome> {
        let AttachRbArgs {
            vpe_sel,
            ep,
            order,
            msg_order,
        } = args;
        let target = self.vpe_of_sel(vpe, vpe_sel)?;
        let pe = self.alive(target)?.pe;
        if !(FIRST_FREE_EP..EP_COUNT).contains(&ep) {
            return Err(Code::InvArgs);
        }
        self.fabric
            .configure(pe, ep, EpConfig::Receive(RecvConfig { order, msg_order }))?;
        if let Some(rec) = self.vpes.get_mut(&target) {
            rec.bindings[ep] = None;
        }
        Ok(Outcome::empty())
    }

    fn detach_rb(&mut self, vpe: VpeId, args: DetachRbArgs) -> Result<Outcome> {
        let DetachRbArgs { vpe_sel, ep } = args;
        let target = self.vpe_of_sel(vpe, vpe_sel)?;
        let pe = self.alive(target)?.pe;
        if !(FIRST_FREE_EP..EP_COUNT).contains(&ep) {
            return Err(Code::InvArgs);
        }
        self.fabric.configure(pe, ep, EpConfig::Invalid)?;
        self.unbind_senders(target, Some(ep));
        self.fail_ctrl_calls(target, ep);
        self.pump_all();
        Ok(Outcome::empty())
    }

    fn exchange(&mut self, vpe: VpeId, args: ExchangeArgs) -> Result<Outcome> {
        let ExchangeArgs {
            vpe_sel,
            own,
            other,
            obtain,
        } = args;
        let target = self.vpe_of_sel(vpe, vpe_sel)?;
        self.alive(target)?;
        if obtain {
            self.copy_caps(target, other, vpe, own)?;
        } else {
            self.copy_caps(vpe, own, target, other)?;
        }
        Ok(Outcome::empty())
    }

    fn vpe_ctrl(&mut self, caller: Caller, args: VpeCtrlArgs) -> Result<Outcome> {
        let VpeCtrlArgs { vpe_sel, op } = args;
        let target = self.vpe_of_sel(caller.vpe, vpe_sel)?;
        if target == caller.vpe {
            return Err(Code::InvArgs);
        }
        match op {
            VpeOp::Start => {
                self.start_vpe(target)?;
                Ok(Outcome::Done(OStream::new().push(&0i64)))
            }
            VpeOp::Stop => {
                self.alive(target)?;
                self.terminate(target, -1);
                Ok(Outcome::Done(OStream::new().push(&0i64)))
            }
            VpeOp::Wait => {
                let rec = self.vpes.get_mut(&target).ok_or(Code::VpeGone)?;
                match rec.exit_code {
                    Some(code) => Ok(Outcome::Done(OStream::new().push(&i64::from(code)))),
                    None => {
                        rec.waiters.push(caller);
                        Ok(Outcome::Deferred)
                    }
                }
            }
            VpeOp::Migrate => {
                let rec = self.alive(target)?;
                // the answer would go to the old PE
                if rec.pending.is_some() {
                    return Err(Code::MsgsWaiting);
                }
                let pe = self.fabric.migrate(rec.pe)?;
                if let Some(rec) = self.vpes.get_mut(&target) {
                    rec.pe = pe;
                }
                log::info!(target: "sysc", "{} migrated to {}", target, pe);
                Ok(Outcome::Done(OStream::new().push(&i64::from(pe.raw()))))
            }
        }
    }

    fn session_xchg(&mut self, caller: Caller, args: SessionXchgArgs, obtain: bool) -> Result<Outcome> {
        let SessionXchgArgs {
            sess_sel,
            caps,
            args,
        } = args;
        let KObject::Session(sess) = self.caps.obj(CapRef::new(caller.vpe, sess_sel))? else {
            return Err(Code::InvArgs);
        };
        if caps.count == 0 {
            return Err(Code::InvArgs);
        }
        for sel in caps.iter() {
            let r = CapRef::new(caller.vpe, sel);
            if obtain {
                self.caps.check_free(r)?;
            } else {
                self.caps.get(r)?;
            }
        }
        let (req, waiter) = if obtain {
            (
                ServiceRequest::Obtain {
                    ident: sess.ident,
                    count: caps.count,
                    args,
                },
                Waiter::Obtain { caller, caps },
            )
        } else {
            (
                ServiceRequest::Delegate {
                    ident: sess.ident,
                    count: caps.count,
                    args,
                },
                Waiter::Delegate { caller, caps },
            )
        };
        self.enqueue(ServiceCall {
            service: sess.service,
            req,
            waiter,
        })?;
        self.pump(sess.service);
        Ok(Outcome::Deferred)
    }

    fn req_mem(&mut self, vpe: VpeId, args: ReqMemArgs) -> Result<Outcome> {
        let ReqMemArgs {
            dst_sel,
            addr,
            size,
            perms,
        } = args;
        if size == 0 {
            return Err(Code::InvArgs);
        }
        let dst = CapRef::new(vpe, dst_sel);
        self.caps.check_free(dst)?;
        let addr = match addr {
            Some(addr) => self.mem.alloc_at(addr, size).map(|_| addr)?,
            None => self.mem.alloc(size)?,
        };
        let obj = KObject::Mem(MemObject {
            addr,
            size,
            perms,
            root: true,
        });
        self.caps.insert(dst, obj, None)?;
        self.record(CapabilityEvent::Created {
            vpe,
            sel: dst_sel,
            kind: CapKind::Mem,
        });
        log::debug!(target: "sysc", "{}: {} bytes at {:#x}", vpe, size, addr);
        Ok(Outcome::empty())
    }

    fn derive_mem(&mut self, vpe: VpeId, args: DeriveMemArgs) -> Result<Outcome> {
        let DeriveMemArgs {
            src_sel,
            dst_sel,
            offset,
            size,
            perms,
        } = args;
        let src = CapRef::new(vpe, src_sel);
        let KObject::Mem(parent) = self.caps.obj(src)? else {
            return Err(Code::InvArgs);
        };
        let end = offset.checked_add(size).ok_or(Code::InvArgs)?;
        if size == 0 || end > parent.size || !perms.is_subset_of(&parent.perms) {
            return Err(Code::InvArgs);
        }
        let obj = KObject::Mem(MemObject {
            addr: parent.addr + offset,
            size,
            perms,
            root: false,
        });
        self.caps.insert(CapRef::new(vpe, dst_sel), obj, Some(src))?;
        self.record(CapabilityEvent::Derived {
            vpe,
            parent: src_sel,
            child: dst_sel,
            perms,
        });
        Ok(Outcome::empty())
    }

    fn revoke(&mut self, caller: Caller, args: RevokeArgs) -> Result<Outcome> {
        let RevokeArgs { vpe_sel, caps, own } = args;
        let target = self.vpe_of_sel(caller.vpe, vpe_sel)?;
        for sel in caps.iter() {
            if own && target == caller.vpe && (sel == SEL_VPE || sel == SEL_MEM) {
                return Err(Code::InvArgs);
            }
            if !own {
                continue;
            }
            // a service goes only once nothing is left for it to answer
            if let Ok(KObject::Service(id)) = self.caps.obj(CapRef::new(target, sel)) {
                if let Some(srv) = self.services.get(id) {
                    let pe = self.alive(srv.vpe)?.pe;
                    if srv.is_busy() || self.fabric.has_msgs(pe, srv.ep) {
                        return Err(Code::MsgsWaiting);
                    }
                }
            }
        }

        let group = self.new_group(caller);
        let closer = Closer::Revoke {
            vpe: caller.vpe,
            group,
        };
        for sel in caps.iter() {
            self.revoke_tree(CapRef::new(target, sel), own, closer);
        }
        self.pump_all();

        let done = match self.groups.get_mut(&group) {
            Some(grp) => {
                grp.sealed = true;
                grp.outstanding == 0
            }
            None => true,
        };
        if done {
            self.groups.remove(&group);
            Ok(Outcome::empty())
        } else {
            Ok(Outcome::Deferred)
        }
    }
}

//! Kernel state and its event loop
//!
//! The kernel owns PE 0. Syscalls arrive in one receive buffer, answers of
//! services in another; a single thread takes them one at a time and never
//! blocks on anybody. Work that needs a service's answer is parked in a
//! pending record and finished when the answer arrives.

use crate::cap_table::{CapRef, CapSpace, KObject, MemObject, SessionObject};
use crate::capability_audit::{AuditEvent, CapabilityAuditLog};
use crate::config::KernelConfig;
use crate::memory::MemoryMap;
use crate::pending::{Caller, QueueError, RevokeGroup, ServiceCall, Waiter};
use crate::services::ServiceList;
use crate::vpes::{VpeRecord, VpeState};
use core_types::{
    CapKind, CapRange, CapSel, CapabilityEvent, Code, EpId, Label, MemoryPerms, PeId, Result,
    ServiceId, VpeId,
};
use dtu::{Dtu, EpConfig, Fabric, Fetched, RecvConfig, SendConfig};
use gates::{BootInfo, Loader};
use ipc::{IStream, OStream};
use kernel_api::syscalls::reply_stream;
use kernel_api::{
    ServiceCmd, ServiceRequest, SyscallRequest, SEL_MEM, SEL_VPE, SYSC_MSG_ORDER, SYSC_RBUF_ORDER,
    DEF_REP, SYSC_REP, SYSC_SEP,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Syscall buffer of the kernel
pub const KSYSC_REP: EpId = 0;
/// Buffer for answers of services
pub const KSRV_REP: EpId = 1;
/// Send endpoint for control requests, pointed at one service per call
pub const KSRV_SEP: EpId = 2;

/// How a syscall handler left its caller
pub(crate) enum Outcome {
    /// Answer now with these values after the code
    Done(OStream),
    /// Somebody else answers later
    Deferred,
    /// Nobody answers
    Silent,
}

impl Outcome {
    pub(crate) fn empty() -> Self {
        Outcome::Done(OStream::new())
    }
}

/// Who removes capabilities, and whether sessions are waited for
#[derive(Debug, Clone, Copy)]
pub(crate) enum Closer {
    /// A VPE is torn down; closes go out without anybody waiting
    Forced,
    /// A revoke syscall answered once its sessions are closed
    Revoke { vpe: VpeId, group: u64 },
}

#[derive(Debug)]
struct InFlight {
    service: ServiceId,
    cmd: ServiceCmd,
    waiter: Waiter,
}

/// Everything the kernel knows
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) fabric: Arc<Fabric>,
    pub(crate) dtu: Dtu,
    pub(crate) loader: Arc<dyn Loader>,
    pub(crate) caps: CapSpace,
    pub(crate) vpes: BTreeMap<VpeId, VpeRecord>,
    pub(crate) services: ServiceList,
    pub(crate) mem: MemoryMap,
    pub(crate) audit: CapabilityAuditLog,
    pub(crate) groups: HashMap<u64, RevokeGroup>,
    in_flight: HashMap<Label, InFlight>,
    next_vpe: u32,
    next_label: Label,
    next_group: u64,
}

impl Kernel {
    /// Configures the kernel's receive buffers on `dtu`, which must be PE 0
    pub fn setup_eps(fabric: &Fabric, dtu: &Dtu, config: &KernelConfig) -> Result<()> {
        let pe = dtu.pe();
        fabric.configure(
            pe,
            KSYSC_REP,
            EpConfig::Receive(RecvConfig {
                order: config.sysc_buf_order,
                msg_order: SYSC_MSG_ORDER,
            }),
        )?;
        fabric.configure(
            pe,
            KSRV_REP,
            EpConfig::Receive(RecvConfig {
                order: config.srv_buf_order,
                msg_order: SYSC_MSG_ORDER,
            }),
        )
    }

    pub fn new(
        config: KernelConfig,
        fabric: Arc<Fabric>,
        dtu: Dtu,
        loader: Arc<dyn Loader>,
    ) -> Self {
        let mem = MemoryMap::new(fabric.memory().size() as u64);
        log::debug!(target: "sysc", "kernel up on {}, {} bytes of memory", dtu.pe(), mem.size());
        Self {
            config,
            fabric,
            dtu,
            loader,
            caps: CapSpace::new(),
            vpes: BTreeMap::new(),
            services: ServiceList::new(),
            mem,
            audit: CapabilityAuditLog::new(),
            groups: HashMap::new(),
            in_flight: HashMap::new(),
            next_vpe: 1,
            next_label: 1,
            next_group: 1,
        }
    }

    pub fn audit(&self) -> &CapabilityAuditLog {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut CapabilityAuditLog {
        &mut self.audit
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.names()
    }

    /// VPEs that did not exit yet
    pub fn vpe_count(&self) -> usize {
        self.vpes.values().filter(|v| v.is_alive()).count()
    }

    pub fn exit_code(&self, vpe: VpeId) -> Option<i32> {
        self.vpes.get(&vpe).and_then(|v| v.exit_code)
    }

    pub fn pe_of(&self, vpe: VpeId) -> Option<PeId> {
        self.vpes.get(&vpe).filter(|v| v.is_alive()).map(|v| v.pe)
    }

    pub(crate) fn record(&mut self, event: CapabilityEvent) {
        self.audit.record(AuditEvent::Capability(event));
    }

    pub(crate) fn alive(&self, vpe: VpeId) -> Result<&VpeRecord> {
        self.vpes
            .get(&vpe)
            .filter(|v| v.is_alive())
            .ok_or(Code::VpeGone)
    }

    /// The VPE named by capability `sel` of `caller`
    pub(crate) fn vpe_of_sel(&self, caller: VpeId, sel: CapSel) -> Result<VpeId> {
        match self.caps.obj(CapRef::new(caller, sel))? {
            KObject::Vpe(vpe) => Ok(vpe),
            _ => Err(Code::InvArgs),
        }
    }

    fn alloc_label(&mut self) -> Label {
        let label = self.next_label;
        self.next_label = self.next_label.wrapping_add(1).max(1);
        label
    }

    // ---- VPEs ----

    /// Creates a VPE on a fresh PE
    ///
    /// With `parent`, the parent gets a VPE capability at the given
    /// selector, and the child's own capability derives from it.
    pub(crate) fn create_vpe(
        &mut self,
        name: &str,
        parent: Option<CapRef>,
    ) -> Result<VpeId> {
        if let Some(p) = parent {
            self.caps.check_free(p)?;
        }
        let pe = self.fabric.create_pe()?.pe();
        let addr = match self.mem.alloc(self.config.vpe_mem_size) {
            Ok(addr) => addr,
            Err(code) => {
                self.fabric.remove_pe(pe);
                return Err(code);
            }
        };
        let id = VpeId::new(self.next_vpe);
        if let Err(code) = self.setup_vpe_eps(id, pe) {
            self.mem.free(addr, self.config.vpe_mem_size);
            self.fabric.remove_pe(pe);
            return Err(code);
        }
        self.next_vpe += 1;

        self.caps.add_table(id);
        if let Some(p) = parent {
            self.caps.insert(p, KObject::Vpe(id), None)?;
            self.record(CapabilityEvent::Created {
                vpe: p.vpe,
                sel: p.sel,
                kind: CapKind::Vpe,
            });
        }
        let own = CapRef::new(id, SEL_VPE);
        self.caps.insert(own, KObject::Vpe(id), parent)?;
        self.caps.insert(
            CapRef::new(id, SEL_MEM),
            KObject::Mem(MemObject {
                addr,
                size: self.config.vpe_mem_size,
                perms: MemoryPerms::read_write(),
                root: true,
            }),
            None,
        )?;
        for (sel, kind) in [(SEL_VPE, CapKind::Vpe), (SEL_MEM, CapKind::Mem)] {
            self.record(CapabilityEvent::Created { vpe: id, sel, kind });
        }

        self.vpes
            .insert(id, VpeRecord::new(id, name, pe, parent.map(|p| p.vpe)));
        log::info!(target: "sysc", "created {} '{}' on {}", id, name, pe);
        Ok(id)
    }

    fn setup_vpe_eps(&self, id: VpeId, pe: PeId) -> Result<()> {
        self.fabric.configure(
            pe,
            SYSC_SEP,
            EpConfig::Send(SendConfig {
                target_pe: self.dtu.pe(),
                target_ep: KSYSC_REP,
                label: u64::from(id.raw()),
                msg_order: SYSC_MSG_ORDER,
                credits: 1,
            }),
        )?;
        self.fabric.configure(
            pe,
            SYSC_REP,
            EpConfig::Receive(RecvConfig {
                order: SYSC_RBUF_ORDER,
                msg_order: SYSC_MSG_ORDER,
            }),
        )?;
        self.fabric.configure(
            pe,
            DEF_REP,
            EpConfig::Receive(RecvConfig {
                order: self.config.def_buf_order,
                msg_order: self.config.def_msg_order,
            }),
        )
    }

    /// Hands `program` to a created VPE; `VpeCtrl(Start)` runs it
    pub(crate) fn load(&mut self, vpe: VpeId, first_sel: CapSel, program: gates::Program) -> Result<()> {
        let rec = self.vpes.get_mut(&vpe).ok_or(Code::InvArgs)?;
        if rec.state != VpeState::Created {
            return Err(Code::Exists);
        }
        rec.program = Some((first_sel, program));
        rec.state = VpeState::Loaded;
        Ok(())
    }

    /// Marks a VPE whose thread the platform starts itself
    pub(crate) fn mark_running(&mut self, vpe: VpeId) -> Result<()> {
        let rec = self.vpes.get_mut(&vpe).ok_or(Code::InvArgs)?;
        if rec.state != VpeState::Created {
            return Err(Code::Exists);
        }
        rec.state = VpeState::Running;
        Ok(())
    }

    /// What a thread needs to run as `vpe`
    pub(crate) fn boot_info(&self, vpe: VpeId, first_sel: CapSel) -> Result<BootInfo> {
        let rec = self.alive(vpe)?;
        Ok(BootInfo {
            vpe,
            name: rec.name.clone(),
            dtu: self.fabric.attach(rec.pe)?,
            loader: self.loader.clone(),
            first_sel,
        })
    }

    /// Runs the loaded program of `vpe` on a thread of its own
    pub(crate) fn start_vpe(&mut self, vpe: VpeId) -> Result<()> {
        let rec = self.vpes.get_mut(&vpe).ok_or(Code::InvArgs)?;
        if rec.state != VpeState::Loaded {
            return Err(Code::InvArgs);
        }
        let (first_sel, program) = rec.program.take().ok_or(Code::InvArgs)?;
        rec.state = VpeState::Running;
        let info = self.boot_info(vpe, first_sel)?;
        let name = info.name.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || crate::platform::run_program(info, program))
            .map_err(|err| {
                log::warn!(target: "sysc", "cannot start {}: {}", vpe, err);
                Code::NoFreeCore
            })?;
        log::debug!(target: "sysc", "started {}", vpe);
        Ok(())
    }

    /// Tears `vpe` down and answers everybody waiting for it
    pub(crate) fn terminate(&mut self, vpe: VpeId, code: i32) {
        let Some(rec) = self.vpes.get_mut(&vpe) else {
            return;
        };
        if !rec.is_alive() {
            return;
        }
        rec.state = VpeState::Dead;
        rec.exit_code = Some(code);
        rec.program = None;
        let pe = rec.pe;
        let waiters = std::mem::take(&mut rec.waiters);

        // its own waits will never be answered
        let dtu = &self.dtu;
        for other in self.vpes.values_mut() {
            other.waiters.retain(|c| {
                if c.vpe == vpe {
                    dtu.ack(KSYSC_REP, c.slot);
                    false
                } else {
                    true
                }
            });
        }

        for sel in self.caps.sels(vpe) {
            self.revoke_tree(CapRef::new(vpe, sel), true, Closer::Forced);
        }
        self.caps.remove_table(vpe);
        self.fabric.remove_pe(pe);
        self.unbind_senders(vpe, None);

        for caller in waiters {
            self.reply(caller, Ok(OStream::new().push(&i64::from(code))));
        }
        self.audit.record(AuditEvent::Exited { vpe, code });
        log::info!(target: "sysc", "{} exited with {}", vpe, code);

        self.pump_all();
        if self.config.auto_shutdown {
            self.auto_shutdown();
        }
    }

    /// Asks every service to shut down once only servers are left
    fn auto_shutdown(&mut self) {
        let alive: Vec<VpeId> = self
            .vpes
            .values()
            .filter(|v| v.is_alive())
            .map(|v| v.id)
            .collect();
        if alive.is_empty() || alive.iter().any(|v| self.services.owned_by(*v).is_empty()) {
            return;
        }
        self.shutdown_services();
    }

    /// Sends `Shutdown` to every service that did not get one yet
    pub fn shutdown_services(&mut self) {
        for id in self.services.ids() {
            let Some(srv) = self.services.get_mut(id) else {
                continue;
            };
            if srv.shutdown_sent {
                continue;
            }
            srv.shutdown_sent = true;
            log::debug!(target: "sysc", "shutting down '{}'", srv.name);
            let call = ServiceCall {
                service: id,
                req: ServiceRequest::Shutdown,
                waiter: Waiter::Shutdown,
            };
            if let Err(code) = self.enqueue(call) {
                log::warn!(target: "sysc", "shutdown of {:?} not queued: {}", id, code);
            }
        }
        self.pump_all();
    }

    /// Powers all PEs down so that blocked VPE threads return
    pub(crate) fn power_down(&mut self) {
        for rec in self.vpes.values_mut() {
            if rec.is_alive() {
                self.fabric.remove_pe(rec.pe);
            }
        }
    }

    // ---- capabilities ----

    /// Copies `src` of `from` to `dst` of `to`, each copy a child of its source
    pub(crate) fn copy_caps(
        &mut self,
        from: VpeId,
        src: CapRange,
        to: VpeId,
        dst: CapRange,
    ) -> Result<()> {
        if src.count != dst.count || src.count == 0 {
            return Err(Code::InvArgs);
        }
        let pairs: Vec<(CapRef, CapRef)> = src
            .iter()
            .zip(dst.iter())
            .map(|(s, d)| (CapRef::new(from, s), CapRef::new(to, d)))
            .collect();
        for (s, d) in &pairs {
            self.caps.get(*s)?;
            self.caps.check_free(*d)?;
        }
        for (s, d) in pairs {
            let obj = self.caps.obj(s)?.copied();
            self.caps.insert(d, obj, Some(s))?;
            self.record(CapabilityEvent::Exchanged {
                from,
                from_sel: s.sel,
                to,
                to_sel: d.sel,
            });
        }
        Ok(())
    }

    /// Invalidates the endpoints `cap` was bound to
    fn unbind(&mut self, cap: CapRef) {
        let Some(rec) = self.vpes.get_mut(&cap.vpe) else {
            return;
        };
        let eps = rec.eps_of(cap.sel);
        let (pe, alive) = (rec.pe, rec.is_alive());
        for ep in eps {
            rec.bindings[ep] = None;
            if alive {
                if let Err(code) = self.fabric.configure(pe, ep, EpConfig::Invalid) {
                    log::debug!(target: "sysc", "cannot invalidate {}:{}: {}", pe, ep, code);
                }
            }
            self.audit
                .record(AuditEvent::Capability(CapabilityEvent::Deactivated { vpe: cap.vpe, ep }));
        }
    }

    /// Invalidates every bound send endpoint that points at `ep` of `vpe`,
    /// or at any endpoint of `vpe` without `ep`
    ///
    /// Senders blocked on a reply see their endpoint go invalid and give
    /// up. The bindings stay, so a later send can still try to reactivate.
    pub(crate) fn unbind_senders(&mut self, vpe: VpeId, ep: Option<EpId>) {
        let mut stale = Vec::new();
        for rec in self.vpes.values().filter(|r| r.is_alive()) {
            for (sep, sel) in rec.bindings.iter().enumerate() {
                let Some(sel) = *sel else {
                    continue;
                };
                if let Ok(KObject::Send(s)) = self.caps.obj(CapRef::new(rec.id, sel)) {
                    if s.vpe == vpe && ep.map_or(true, |e| e == s.ep) {
                        stale.push((rec.id, rec.pe, sep));
                    }
                }
            }
        }
        for (holder, pe, sep) in stale {
            if let Err(code) = self.fabric.configure(pe, sep, EpConfig::Invalid) {
                log::debug!(target: "sysc", "cannot invalidate {}:{}: {}", pe, sep, code);
                continue;
            }
            log::debug!(target: "sysc", "{}: ep {} lost its receiver at {}", holder, sep, vpe);
            self.record(CapabilityEvent::Deactivated {
                vpe: holder,
                ep: sep,
            });
        }
    }

    /// Removes what was derived from `r` (and `r` with `own`) and cleans up
    /// behind each removed capability
    pub(crate) fn revoke_tree(&mut self, r: CapRef, own: bool, closer: Closer) {
        for (cref, cap) in self.caps.revoke(r, own) {
            self.record(CapabilityEvent::Revoked {
                vpe: cref.vpe,
                sel: cref.sel,
            });
            self.unbind(cref);
            match cap.obj {
                KObject::Mem(MemObject {
                    addr,
                    size,
                    root: true,
                    ..
                }) => self.mem.free(addr, size),
                KObject::Service(id) => self.remove_service(id),
                KObject::Session(SessionObject {
                    service,
                    ident,
                    origin: true,
                }) => self.close_session(service, ident, closer),
                // the parent's capability, not a copy of it
                KObject::Vpe(vpe) if vpe != cref.vpe && cap.parent().is_none() => {
                    self.terminate(vpe, -1)
                }
                _ => {}
            }
        }
    }

    fn close_session(&mut self, service: ServiceId, ident: u64, closer: Closer) {
        let Some(srv) = self.services.get(service) else {
            return;
        };
        // a server revoking its own session cannot answer the close
        let group = match closer {
            Closer::Revoke { vpe, group } if vpe != srv.vpe => Some(group),
            _ => None,
        };
        let call = ServiceCall {
            service,
            req: ServiceRequest::Close { ident },
            waiter: Waiter::Close { group },
        };
        match self.enqueue(call) {
            Ok(()) => {
                if let Some(g) = group.and_then(|g| self.groups.get_mut(&g)) {
                    g.outstanding += 1;
                }
            }
            Err(code) => {
                log::warn!(target: "sysc", "close of session {} not queued: {}", ident, code)
            }
        }
    }

    /// Answers the revoke of group `g` if it has nothing left to wait for
    pub(crate) fn finish_group(&mut self, g: u64) {
        if self.groups.get(&g).is_some_and(|grp| grp.is_done()) {
            if let Some(grp) = self.groups.remove(&g) {
                self.reply(grp.caller, Ok(OStream::new()));
            }
        }
    }

    pub(crate) fn new_group(&mut self, caller: Caller) -> u64 {
        let g = self.next_group;
        self.next_group += 1;
        self.groups.insert(g, RevokeGroup::new(caller));
        g
    }

    // ---- services ----

    fn remove_service(&mut self, id: ServiceId) {
        let Some(srv) = self.services.remove(id) else {
            return;
        };
        log::info!(target: "sysc", "service '{}' removed", srv.name);
        self.record(CapabilityEvent::ServiceRemoved { service: id });
        let mut queue = srv.queue;
        self.fail_calls(id, queue.drain());
    }

    /// Fails the queued and in-flight calls of the services listening on
    /// `ep` of `vpe`
    pub(crate) fn fail_ctrl_calls(&mut self, vpe: VpeId, ep: EpId) {
        for id in self.services.by_endpoint(vpe, ep) {
            let queued = match self.services.get_mut(id) {
                Some(srv) => {
                    srv.in_flight = None;
                    srv.queue.drain()
                }
                None => continue,
            };
            self.fail_calls(id, queued);
        }
    }

    fn fail_calls(&mut self, id: ServiceId, queued: Vec<ServiceCall>) {
        let labels: Vec<Label> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.service == id)
            .map(|(l, _)| *l)
            .collect();
        let mut failed: Vec<(ServiceCmd, Waiter)> = labels
            .into_iter()
            .filter_map(|l| self.in_flight.remove(&l))
            .map(|f| (f.cmd, f.waiter))
            .collect();
        failed.extend(queued.into_iter().map(|c| (c.req.cmd(), c.waiter)));
        for (cmd, waiter) in failed {
            self.complete(id, cmd, waiter, Err(Code::RecvGone));
        }
    }

    pub(crate) fn enqueue(&mut self, call: ServiceCall) -> Result<()> {
        let srv = self.services.get_mut(call.service).ok_or(Code::InvArgs)?;
        srv.queue.push(call).map_err(|QueueError::Full| Code::NoSpace)
    }

    pub(crate) fn pump_all(&mut self) {
        for id in self.services.ids() {
            self.pump(id);
        }
    }

    /// Sends the next queued call of `id` unless one is in flight
    pub(crate) fn pump(&mut self, id: ServiceId) {
        loop {
            let Some(srv) = self.services.get_mut(id) else {
                return;
            };
            if srv.in_flight.is_some() {
                return;
            }
            let Some(call) = srv.queue.pop() else {
                return;
            };
            let label = self.alloc_label();
            let cmd = call.req.cmd();
            match self.send_call(id, &call.req, label) {
                Ok(()) => {
                    if let Some(srv) = self.services.get_mut(id) {
                        srv.in_flight = Some(label);
                    }
                    self.in_flight.insert(
                        label,
                        InFlight {
                            service: id,
                            cmd,
                            waiter: call.waiter,
                        },
                    );
                    return;
                }
                Err(code) => {
                    log::debug!(target: "sysc", "{:?} to {:?} not sent: {}", cmd, id, code);
                    self.complete(id, cmd, call.waiter, Err(code));
                }
            }
        }
    }

    fn send_call(&self, id: ServiceId, req: &ServiceRequest, label: Label) -> Result<()> {
        let srv = self.services.get(id).ok_or(Code::RecvGone)?;
        let pe = self.alive(srv.vpe)?.pe;
        let EpConfig::Receive(rcfg) = self.fabric.ep_config(pe, srv.ep)? else {
            return Err(Code::RecvGone);
        };
        self.fabric.configure(
            self.dtu.pe(),
            KSRV_SEP,
            EpConfig::Send(SendConfig {
                target_pe: pe,
                target_ep: srv.ep,
                label: srv.label,
                msg_order: rcfg.msg_order,
                credits: 1,
            }),
        )?;
        let bytes = req.encode()?;
        self.dtu.send(KSRV_SEP, &bytes, label, Some(KSRV_REP))
    }

    fn handle_service_reply(&mut self, msg: Fetched) {
        self.dtu.ack(KSRV_REP, msg.slot);
        let Some(call) = self.in_flight.remove(&msg.header.label) else {
            log::debug!(target: "sysc", "stale service reply {:#x}", msg.header.label);
            return;
        };
        if let Some(srv) = self.services.get_mut(call.service) {
            srv.in_flight = None;
        }
        let res = IStream::from_bytes(&msg.payload).and_then(|mut is| {
            is.pop_code()?;
            Ok(is)
        });
        self.complete(call.service, call.cmd, call.waiter, res);
        self.pump(call.service);
    }

    /// Finishes whatever waited for a control request
    fn complete(&mut self, service: ServiceId, cmd: ServiceCmd, waiter: Waiter, res: Result<IStream>) {
        self.audit.record(AuditEvent::ServiceCall {
            service,
            cmd,
            code: Code::to_raw(&res),
        });
        match waiter {
            Waiter::Open { caller, sess_sel } => {
                let res = res.and_then(|mut is| is.pop::<u64>());
                let res = res.map(|ident| (ident, self.open_session(service, caller.vpe, sess_sel, ident)));
                match res {
                    Ok((_, Ok(()))) => self.reply(caller, Ok(OStream::new())),
                    Ok((ident, Err(code))) => {
                        // the server has a session nobody holds
                        self.close_session(service, ident, Closer::Forced);
                        self.reply(caller, Err(code));
                    }
                    Err(code) => self.reply(caller, Err(code)),
                }
            }
            Waiter::Obtain { caller, caps } | Waiter::Delegate { caller, caps } => {
                let obtain = matches!(cmd, ServiceCmd::Obtain);
                let res = res.and_then(|mut is| {
                    let srv_caps: CapRange = is.pop()?;
                    let args = is.pop_stream()?;
                    self.exchange_with_server(service, caller.vpe, caps, srv_caps, obtain)?;
                    Ok(args)
                });
                self.reply(caller, res.map(|args| OStream::new().push_stream(args.into_ostream())));
            }
            Waiter::Close { group } => {
                if let Err(code) = res {
                    log::debug!(target: "sysc", "close at {:?}: {}", service, code);
                }
                if let Some(g) = group {
                    if let Some(grp) = self.groups.get_mut(&g) {
                        grp.outstanding = grp.outstanding.saturating_sub(1);
                    }
                    self.finish_group(g);
                }
            }
            Waiter::Shutdown => {
                if let Err(code) = res {
                    log::debug!(target: "sysc", "shutdown of {:?}: {}", service, code);
                }
            }
        }
    }

    fn open_session(&mut self, service: ServiceId, client: VpeId, sel: CapSel, ident: u64) -> Result<()> {
        self.alive(client)?;
        let srv = self.services.get(service).ok_or(Code::RecvGone)?;
        let parent = CapRef::new(srv.vpe, srv.srv_sel);
        let obj = KObject::Session(SessionObject {
            service,
            ident,
            origin: true,
        });
        self.caps.insert(CapRef::new(client, sel), obj, Some(parent))?;
        self.record(CapabilityEvent::Created {
            vpe: client,
            sel,
            kind: CapKind::Session,
        });
        log::debug!(target: "sysc", "{} opened session {} at {}", client, ident, sel);
        Ok(())
    }

    fn exchange_with_server(
        &mut self,
        service: ServiceId,
        client: VpeId,
        caps: CapRange,
        srv_caps: CapRange,
        obtain: bool,
    ) -> Result<()> {
        if srv_caps.count != caps.count {
            return Err(Code::InvArgs);
        }
        self.alive(client)?;
        let server = self.services.get(service).ok_or(Code::RecvGone)?.vpe;
        if obtain {
            self.copy_caps(server, srv_caps, client, caps)
        } else {
            self.copy_caps(client, caps, server, srv_caps)
        }
    }

    // ---- syscall replies ----

    /// Answers a syscall; the values of `res` follow the code
    pub(crate) fn reply(&mut self, caller: Caller, res: Result<OStream>) {
        let code = Code::to_raw(&res);
        self.audit.record(AuditEvent::Syscall {
            vpe: caller.vpe,
            op: caller.op,
            code,
        });
        if let Some(rec) = self.vpes.get_mut(&caller.vpe) {
            if rec.pending == Some(caller) {
                rec.pending = None;
            }
        }
        let os = match res {
            Ok(values) => reply_stream::<()>(&Ok(())).append(values),
            Err(err) => reply_stream::<()>(&Err(err)),
        };
        log::trace!(target: "sysc", "{} <- {:?}: {}", caller.vpe, caller.op, code);
        self.reply_raw(caller.slot, os);
    }

    fn reply_raw(&self, slot: usize, os: OStream) {
        let res = os
            .into_bytes()
            .and_then(|bytes| self.dtu.reply(KSYSC_REP, slot, &bytes));
        if let Err(code) = res {
            // replying acks the slot; encoding failures have to
            self.dtu.ack(KSYSC_REP, slot);
            log::debug!(target: "sysc", "reply in slot {} not delivered: {}", slot, code);
        }
    }

    fn handle_syscall(&mut self, msg: Fetched) {
        let vpe = u32::try_from(msg.header.label).map(VpeId::new);
        let Some(vpe) = vpe.ok().filter(|v| self.alive(*v).is_ok()) else {
            log::debug!(target: "sysc", "syscall from unknown label {:#x}", msg.header.label);
            self.dtu.ack(KSYSC_REP, msg.slot);
            return;
        };
        let req = match SyscallRequest::decode(&msg.payload) {
            Ok(req) => req,
            Err(code) => {
                log::debug!(target: "sysc", "{}: undecodable syscall", vpe);
                self.reply_raw(msg.slot, reply_stream::<()>(&Err(code)));
                return;
            }
        };
        let caller = Caller {
            vpe,
            slot: msg.slot,
            op: req.opcode(),
        };
        log::trace!(target: "sysc", "{} -> {:?}", vpe, caller.op);
        // a deferred answer may already go out while the handler runs
        if let Some(rec) = self.vpes.get_mut(&vpe) {
            rec.pending = Some(caller);
        }
        match self.dispatch(caller, req) {
            Ok(Outcome::Done(values)) => self.reply(caller, Ok(values)),
            Ok(Outcome::Deferred) | Ok(Outcome::Silent) => {}
            Err(code) => self.reply(caller, Err(code)),
        }
    }

    /// Handles one message; returns false if there was none
    pub(crate) fn tick(&mut self) -> bool {
        if let Some(msg) = self.dtu.fetch_msg(KSRV_REP) {
            self.handle_service_reply(msg);
            return true;
        }
        if let Some(msg) = self.dtu.fetch_msg(KSYSC_REP) {
            self.handle_syscall(msg);
            return true;
        }
        false
    }
}

pub(crate) fn lock(kernel: &Mutex<Kernel>) -> MutexGuard<'_, Kernel> {
    kernel.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The kernel thread: handles messages until `stop` is set
pub(crate) fn run(kernel: Arc<Mutex<Kernel>>, dtu: Dtu, stop: Arc<AtomicBool>) {
    dtu.bind_current_thread();
    while !stop.load(Ordering::Acquire) {
        let progress = lock(&kernel).tick();
        if !progress {
            dtu.wait();
        }
    }
    lock(&kernel).power_down();
    log::debug!(target: "sysc", "kernel stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLoader;

    impl Loader for NoLoader {
        fn start(&self, _vpe: VpeId, _first_sel: CapSel, _program: gates::Program) -> Result<()> {
            Err(Code::NotSup)
        }
    }

    fn kernel() -> Kernel {
        let config = crate::test_utils::small_config();
        let fabric = Fabric::new(config.dtu.clone());
        let dtu = fabric.create_pe().unwrap();
        Kernel::setup_eps(&fabric, &dtu, &config).unwrap();
        Kernel::new(config, fabric, dtu, Arc::new(NoLoader))
    }

    #[test]
    fn test_create_vpe_sets_up_caps_and_eps() {
        let mut k = kernel();
        let a = k.create_vpe("a", None).unwrap();
        assert_eq!(a, VpeId::new(1));
        assert!(matches!(
            k.caps.obj(CapRef::new(a, SEL_VPE)),
            Ok(KObject::Vpe(v)) if v == a
        ));
        assert!(matches!(
            k.caps.obj(CapRef::new(a, SEL_MEM)),
            Ok(KObject::Mem(MemObject { root: true, .. }))
        ));
        let pe = k.pe_of(a).unwrap();
        assert!(matches!(
            k.fabric.ep_config(pe, SYSC_SEP),
            Ok(EpConfig::Send(SendConfig { label: 1, credits: 1, .. }))
        ));
        assert!(matches!(
            k.fabric.ep_config(pe, DEF_REP),
            Ok(EpConfig::Receive(_))
        ));
    }

    #[test]
    fn test_child_cap_derives_from_parent() {
        let mut k = kernel();
        let parent = k.create_vpe("parent", None).unwrap();
        let child = k.create_vpe("child", Some(CapRef::new(parent, 5))).unwrap();
        assert_eq!(
            k.caps.get(CapRef::new(child, SEL_VPE)).unwrap().parent(),
            Some(CapRef::new(parent, 5))
        );
        assert_eq!(
            k.create_vpe("again", Some(CapRef::new(parent, 5))),
            Err(Code::InvArgs)
        );

        k.revoke_tree(CapRef::new(parent, 5), true, Closer::Forced);
        assert_eq!(k.exit_code(child), Some(-1));
        assert!(k.pe_of(child).is_none());
        assert_eq!(k.vpe_count(), 1);
    }

    #[test]
    fn test_terminate_frees_memory() {
        let mut k = kernel();
        let before = k.mem.free_bytes();
        let a = k.create_vpe("a", None).unwrap();
        assert!(k.mem.free_bytes() < before);
        k.terminate(a, 3);
        assert_eq!(k.mem.free_bytes(), before);
        assert_eq!(k.exit_code(a), Some(3));
        assert!(k.audit.has_event(|e| matches!(e, AuditEvent::Exited { code: 3, .. })));
        assert!(!k.caps.has_table(a));
    }

    #[test]
    fn test_copy_caps_checks_everything_first() {
        let mut k = kernel();
        let a = k.create_vpe("a", None).unwrap();
        let b = k.create_vpe("b", None).unwrap();
        // sel 3 of a does not exist, so nothing is copied
        assert_eq!(
            k.copy_caps(a, CapRange::new(1, 3), b, CapRange::new(4, 3)),
            Err(Code::InvArgs)
        );
        assert_eq!(k.caps.len(b), 2);
        assert_eq!(
            k.copy_caps(a, CapRange::single(1), b, CapRange::new(4, 2)),
            Err(Code::InvArgs)
        );
        k.copy_caps(a, CapRange::single(SEL_MEM), b, CapRange::single(4))
            .unwrap();
        assert!(matches!(
            k.caps.obj(CapRef::new(b, 4)),
            Ok(KObject::Mem(MemObject { root: false, .. }))
        ));
    }

    #[test]
    fn test_no_free_core() {
        let mut k = kernel();
        let max = k.fabric.config().max_pes;
        for i in 1..max {
            k.create_vpe(&format!("v{i}"), None).unwrap();
        }
        assert_eq!(k.create_vpe("one too many", None), Err(Code::NoFreeCore));
    }

    #[test]
    fn test_load_once() {
        let mut k = kernel();
        let a = k.create_vpe("a", None).unwrap();
        k.load(a, 2, Box::new(|_| 0)).unwrap();
        assert_eq!(k.load(a, 2, Box::new(|_| 0)), Err(Code::Exists));
        assert_eq!(k.load(VpeId::new(99), 2, Box::new(|_| 0)), Err(Code::InvArgs));
    }
}

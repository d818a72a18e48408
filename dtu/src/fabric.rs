//! The interconnect
//!
//! Routes messages between PEs and gives the kernel its privileged view of
//! every endpoint. The routing table is the one structure shared by all
//! engines; lookups take a read lock, only PE creation, removal and
//! migration take the write lock.

use crate::dtu::Dtu;
use crate::endpoint::{EpConfig, Endpoint};
use crate::engine::{self, CmdRegister};
use crate::memory::MainMemory;
use crate::EP_COUNT;
use core_types::{Code, EpId, PeId, Result};
use ipc::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::Thread;
use std::time::Duration;

/// Configuration of the emulated hardware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtuConfig {
    /// Processing elements available, the kernel's included
    pub max_pes: usize,
    /// Size of global memory in bytes
    pub mem_size: usize,
    /// How long a waiting application sleeps before polling again
    pub wait_timeout_us: u64,
    /// How long an idle engine sleeps before polling again
    pub engine_idle_us: u64,
}

impl Default for DtuConfig {
    fn default() -> Self {
        Self {
            max_pes: 32,
            mem_size: 16 * 1024 * 1024,
            wait_timeout_us: 200,
            engine_idle_us: 200,
        }
    }
}

/// Register file and engine state of one PE
pub(crate) struct PeState {
    pe: AtomicU32,
    eps: Box<[Endpoint]>,
    pub(crate) cmd: CmdRegister,
    alive: AtomicBool,
    app: OnceLock<Thread>,
    engine: OnceLock<Thread>,
}

impl PeState {
    fn new(pe: PeId) -> Self {
        Self {
            pe: AtomicU32::new(pe.raw()),
            eps: (0..EP_COUNT).map(|_| Endpoint::new()).collect(),
            cmd: CmdRegister::new(),
            alive: AtomicBool::new(true),
            app: OnceLock::new(),
            engine: OnceLock::new(),
        }
    }

    pub(crate) fn pe(&self) -> PeId {
        PeId::new(self.pe.load(Ordering::Acquire))
    }

    pub(crate) fn ep(&self, ep: EpId) -> Result<&Endpoint> {
        self.eps.get(ep).ok_or(Code::InvArgs)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn bind_app(&self, thread: Thread) {
        let _ = self.app.set(thread);
    }

    pub(crate) fn wake_app(&self) {
        if let Some(t) = self.app.get() {
            t.unpark();
        }
    }

    pub(crate) fn wake_engine(&self) {
        if let Some(t) = self.engine.get() {
            t.unpark();
        }
    }

    fn shut_down(&self) {
        self.alive.store(false, Ordering::Release);
        self.wake_engine();
        self.wake_app();
    }
}

/// The interconnect between all processing elements
pub struct Fabric {
    pes: RwLock<HashMap<PeId, Arc<PeState>>>,
    next_pe: AtomicU32,
    memory: MainMemory,
    config: DtuConfig,
}

impl Fabric {
    /// Creates an interconnect without any PEs
    pub fn new(config: DtuConfig) -> Arc<Self> {
        Arc::new(Self {
            pes: RwLock::new(HashMap::new()),
            next_pe: AtomicU32::new(PeId::KERNEL.raw()),
            memory: MainMemory::new(config.mem_size),
            config,
        })
    }

    /// Hardware configuration
    pub fn config(&self) -> &DtuConfig {
        &self.config
    }

    /// Global memory
    pub fn memory(&self) -> &MainMemory {
        &self.memory
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PeId, Arc<PeState>>> {
        self.pes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PeId, Arc<PeState>>> {
        self.pes.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lookup(&self, pe: PeId) -> Option<Arc<PeState>> {
        self.read().get(&pe).filter(|s| s.is_alive()).cloned()
    }

    /// Powers up a new PE and starts its engine
    ///
    /// The first PE created is [`PeId::KERNEL`].
    pub fn create_pe(self: &Arc<Self>) -> Result<Dtu> {
        let state = {
            let mut pes = self.write();
            if pes.len() >= self.config.max_pes {
                return Err(Code::NoFreeCore);
            }
            let pe = PeId::new(self.next_pe.fetch_add(1, Ordering::Relaxed));
            let state = Arc::new(PeState::new(pe));
            pes.insert(pe, state.clone());
            state
        };
        let idle = Duration::from_micros(self.config.engine_idle_us);
        match engine::spawn(state.clone(), Arc::downgrade(self), idle) {
            Ok(thread) => {
                let _ = state.engine.set(thread);
            }
            Err(err) => {
                log::warn!(target: "dtu", "cannot start engine of {}: {}", state.pe(), err);
                self.remove_pe(state.pe());
                return Err(Code::NoFreeCore);
            }
        }
        log::debug!(target: "dtu", "created {}", state.pe());
        Ok(Dtu::new(state, self.clone()))
    }

    /// Handle for an existing PE
    pub fn attach(self: &Arc<Self>, pe: PeId) -> Result<Dtu> {
        let state = self.lookup(pe).ok_or(Code::VpeGone)?;
        Ok(Dtu::new(state, self.clone()))
    }

    /// Powers a PE down; its engine stops and pending commands fail
    pub fn remove_pe(&self, pe: PeId) -> bool {
        match self.write().remove(&pe) {
            Some(state) => {
                state.shut_down();
                log::debug!(target: "dtu", "removed {}", pe);
                true
            }
            None => false,
        }
    }

    /// Moves the context of a PE to a fresh PE id
    ///
    /// Endpoints targeting the old id now fail with `VpeGone` until they
    /// are reconfigured.
    pub fn migrate(&self, pe: PeId) -> Result<PeId> {
        let mut pes = self.write();
        let state = pes.remove(&pe).ok_or(Code::VpeGone)?;
        let new_pe = PeId::new(self.next_pe.fetch_add(1, Ordering::Relaxed));
        state.pe.store(new_pe.raw(), Ordering::Release);
        pes.insert(new_pe, state);
        log::debug!(target: "dtu", "migrated {} to {}", pe, new_pe);
        Ok(new_pe)
    }

    /// Writes an endpoint's configuration; kernel only
    pub fn configure(&self, pe: PeId, ep: EpId, cfg: EpConfig) -> Result<()> {
        if let EpConfig::Receive(r) = &cfg {
            r.validate()?;
        }
        let state = self.lookup(pe).ok_or(Code::VpeGone)?;
        state.ep(ep)?.configure(&cfg);
        log::trace!(target: "dtu", "{}:{} := {:?}", pe, ep, cfg);
        Ok(())
    }

    /// Reads an endpoint's configuration
    pub fn ep_config(&self, pe: PeId, ep: EpId) -> Result<EpConfig> {
        let state = self.lookup(pe).ok_or(Code::VpeGone)?;
        Ok(state.ep(ep)?.snapshot())
    }

    /// Returns true if the receive endpoint has unread messages
    pub fn has_msgs(&self, pe: PeId, ep: EpId) -> bool {
        self.lookup(pe)
            .and_then(|s| s.ep(ep).ok().map(|e| e.ring().has_msgs()))
            .unwrap_or(false)
    }

    /// Number of powered PEs
    pub fn pe_count(&self) -> usize {
        self.read().len()
    }

    pub(crate) fn deliver(&self, pe: PeId, ep: EpId, msg: Message) -> Result<()> {
        let state = self.lookup(pe).ok_or(Code::VpeGone)?;
        let rep = state.ep(ep).map_err(|_| Code::RecvGone)?;
        let EpConfig::Receive(cfg) = rep.snapshot() else {
            return Err(Code::RecvGone);
        };
        if !Message::fits(msg.payload.len(), cfg.msg_order) {
            return Err(Code::InvArgs);
        }
        rep.ring().push(msg)?;
        state.wake_app();
        Ok(())
    }

    pub(crate) fn return_credit(&self, pe: PeId, ep: EpId) {
        if let Some(state) = self.lookup(pe) {
            if let Ok(sep) = state.ep(ep) {
                sep.return_credit();
            }
        }
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        for state in self.write().values() {
            state.shut_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{RecvConfig, SendConfig};

    fn small() -> DtuConfig {
        DtuConfig {
            max_pes: 3,
            mem_size: 4096,
            ..DtuConfig::default()
        }
    }

    #[test]
    fn test_first_pe_is_kernel() {
        let fabric = Fabric::new(small());
        let k = fabric.create_pe().unwrap();
        assert_eq!(k.pe(), PeId::KERNEL);
        assert_eq!(fabric.pe_count(), 1);
    }

    #[test]
    fn test_pe_limit() {
        let fabric = Fabric::new(small());
        for _ in 0..3 {
            fabric.create_pe().unwrap();
        }
        assert_eq!(fabric.create_pe().err(), Some(Code::NoFreeCore));
    }

    #[test]
    fn test_configure_validates() {
        let fabric = Fabric::new(small());
        let d = fabric.create_pe().unwrap();
        let bad = EpConfig::Receive(RecvConfig {
            order: 4,
            msg_order: 8,
        });
        assert_eq!(fabric.configure(d.pe(), 3, bad), Err(Code::InvArgs));
        assert_eq!(
            fabric.configure(d.pe(), EP_COUNT, EpConfig::Invalid),
            Err(Code::InvArgs)
        );
        assert_eq!(
            fabric.configure(PeId::new(99), 0, EpConfig::Invalid),
            Err(Code::VpeGone)
        );
    }

    #[test]
    fn test_migrate_keeps_registers() {
        let fabric = Fabric::new(small());
        let d = fabric.create_pe().unwrap();
        let old = d.pe();
        let cfg = EpConfig::Send(SendConfig {
            target_pe: old,
            target_ep: 1,
            label: 5,
            msg_order: 8,
            credits: 1,
        });
        fabric.configure(old, 4, cfg).unwrap();
        let new = fabric.migrate(old).unwrap();
        assert_ne!(old, new);
        assert_eq!(d.pe(), new);
        assert_eq!(fabric.ep_config(new, 4).unwrap(), cfg);
        assert_eq!(fabric.ep_config(old, 4), Err(Code::VpeGone));
    }

    #[test]
    fn test_remove_pe() {
        let fabric = Fabric::new(small());
        let d = fabric.create_pe().unwrap();
        assert!(fabric.remove_pe(d.pe()));
        assert!(!d.is_alive());
        assert!(!fabric.remove_pe(d.pe()));
        assert!(fabric.attach(d.pe()).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let cfg: DtuConfig = serde_json::from_str(r#"{"max_pes": 4}"#).unwrap();
        assert_eq!(cfg.max_pes, 4);
        assert_eq!(cfg.mem_size, DtuConfig::default().mem_size);
    }
}

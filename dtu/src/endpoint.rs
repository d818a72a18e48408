//! Endpoint registers
//!
//! The kernel is the only writer of an endpoint's configuration. Readers
//! (the owning application, its engine, delivering engines) take snapshots
//! guarded by a sequence counter: odd while a write is in progress, and a
//! snapshot is only accepted if the counter did not move while it was
//! read. The live credit counter sits outside that protocol and is updated
//! with read-modify-write atomics.

use crate::ringbuf::RingBuffer;
use crate::{MAX_MSG_SLOTS, UNLIMITED_CREDITS};
use core_types::{Code, EpId, Label, MemoryPerms, PeId, Result};
use std::hint;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Configuration of a send endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendConfig {
    pub target_pe: PeId,
    pub target_ep: EpId,
    pub label: Label,
    /// Largest message (header included) as a power of two
    pub msg_order: u8,
    /// Credit limit in messages, or [`UNLIMITED_CREDITS`]
    pub credits: u32,
}

/// Configuration of a receive endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvConfig {
    /// Buffer size as a power of two
    pub order: u8,
    /// Slot size as a power of two
    pub msg_order: u8,
}

impl RecvConfig {
    /// Number of slots the buffer is split into
    pub fn slots(&self) -> usize {
        self.order
            .checked_sub(self.msg_order)
            .and_then(|d| 1usize.checked_shl(u32::from(d)))
            .unwrap_or(0)
    }

    /// Checks the layout against the slot limit
    pub fn validate(&self) -> Result<()> {
        if self.order < self.msg_order || self.order >= 32 {
            return Err(Code::InvArgs);
        }
        let slots = self.slots();
        if slots == 0 || slots > MAX_MSG_SLOTS {
            return Err(Code::InvArgs);
        }
        Ok(())
    }
}

/// Configuration of a memory endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemConfig {
    pub addr: u64,
    pub size: u64,
    pub perms: MemoryPerms,
}

/// Everything the kernel can write into an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpConfig {
    Invalid,
    Send(SendConfig),
    Receive(RecvConfig),
    Memory(MemConfig),
}

impl EpConfig {
    /// Returns true unless the endpoint is invalid
    pub fn is_valid(&self) -> bool {
        !matches!(self, EpConfig::Invalid)
    }
}

const KIND_INVALID: u8 = 0;
const KIND_SEND: u8 = 1;
const KIND_RECV: u8 = 2;
const KIND_MEM: u8 = 3;

/// One endpoint register set
pub struct Endpoint {
    seq: AtomicU64,
    kind: AtomicU8,
    target_pe: AtomicU32,
    target_ep: AtomicUsize,
    label: AtomicU64,
    order: AtomicU8,
    msg_order: AtomicU8,
    credit_limit: AtomicU32,
    credits: AtomicU32,
    addr: AtomicU64,
    size: AtomicU64,
    perms: AtomicU8,
    ring: RingBuffer,
}

impl Endpoint {
    pub(crate) fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            kind: AtomicU8::new(KIND_INVALID),
            target_pe: AtomicU32::new(0),
            target_ep: AtomicUsize::new(0),
            label: AtomicU64::new(0),
            order: AtomicU8::new(0),
            msg_order: AtomicU8::new(0),
            credit_limit: AtomicU32::new(0),
            credits: AtomicU32::new(0),
            addr: AtomicU64::new(0),
            size: AtomicU64::new(0),
            perms: AtomicU8::new(0),
            ring: RingBuffer::new(),
        }
    }

    /// Writes a new configuration; kernel only
    pub(crate) fn configure(&self, cfg: &EpConfig) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        let kind = match cfg {
            EpConfig::Invalid => {
                self.ring.reset(0);
                KIND_INVALID
            }
            EpConfig::Send(s) => {
                self.target_pe.store(s.target_pe.raw(), Ordering::Relaxed);
                self.target_ep.store(s.target_ep, Ordering::Relaxed);
                self.label.store(s.label, Ordering::Relaxed);
                self.msg_order.store(s.msg_order, Ordering::Relaxed);
                self.credit_limit.store(s.credits, Ordering::Relaxed);
                self.credits.store(s.credits, Ordering::Relaxed);
                KIND_SEND
            }
            EpConfig::Receive(r) => {
                self.order.store(r.order, Ordering::Relaxed);
                self.msg_order.store(r.msg_order, Ordering::Relaxed);
                self.ring.reset(r.slots());
                KIND_RECV
            }
            EpConfig::Memory(m) => {
                self.addr.store(m.addr, Ordering::Relaxed);
                self.size.store(m.size, Ordering::Relaxed);
                self.perms.store(m.perms.bits(), Ordering::Relaxed);
                KIND_MEM
            }
        };
        self.kind.store(kind, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Reads a consistent copy of the configuration
    pub fn snapshot(&self) -> EpConfig {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                hint::spin_loop();
                continue;
            }
            let cfg = self.read_fields();
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return cfg;
            }
        }
    }

    fn read_fields(&self) -> EpConfig {
        match self.kind.load(Ordering::Relaxed) {
            KIND_SEND => EpConfig::Send(SendConfig {
                target_pe: PeId::new(self.target_pe.load(Ordering::Relaxed)),
                target_ep: self.target_ep.load(Ordering::Relaxed),
                label: self.label.load(Ordering::Relaxed),
                msg_order: self.msg_order.load(Ordering::Relaxed),
                credits: self.credit_limit.load(Ordering::Relaxed),
            }),
            KIND_RECV => EpConfig::Receive(RecvConfig {
                order: self.order.load(Ordering::Relaxed),
                msg_order: self.msg_order.load(Ordering::Relaxed),
            }),
            KIND_MEM => EpConfig::Memory(MemConfig {
                addr: self.addr.load(Ordering::Relaxed),
                size: self.size.load(Ordering::Relaxed),
                perms: MemoryPerms::from_bits(self.perms.load(Ordering::Relaxed)),
            }),
            _ => EpConfig::Invalid,
        }
    }

    /// Live credit counter; `None` for unlimited or non-send endpoints
    pub fn credits(&self) -> Option<u32> {
        match self.snapshot() {
            EpConfig::Send(s) if s.credits != UNLIMITED_CREDITS => {
                Some(self.credits.load(Ordering::Acquire))
            }
            _ => None,
        }
    }

    pub(crate) fn take_credit(&self, limit: u32) -> Result<()> {
        if limit == UNLIMITED_CREDITS {
            return Ok(());
        }
        self.credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map(|_| ())
            .map_err(|_| Code::MissCredits)
    }

    /// Gives one credit back, never above the limit
    pub(crate) fn return_credit(&self) {
        let limit = self.credit_limit.load(Ordering::Acquire);
        if limit == UNLIMITED_CREDITS {
            return;
        }
        let _ = self
            .credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < limit).then_some(c + 1)
            });
    }

    /// The receive slots of this endpoint
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

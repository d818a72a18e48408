//! Work the kernel owes somebody
//!
//! The kernel never blocks. A syscall that needs a server's answer, or a
//! VPE's exit, keeps its message slot and is answered later through one of
//! these records.

use core_types::{CapRange, CapSel, ServiceId, VpeId};
use kernel_api::{ServiceRequest, Syscall};
use std::collections::VecDeque;
use thiserror::Error;

/// A syscall message the kernel still has to reply to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub vpe: VpeId,
    /// Slot of the request in the kernel's syscall buffer
    pub slot: usize,
    pub op: Syscall,
}

/// What to do once a service answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Waiter {
    /// Create the session capability at `sess_sel` and answer `caller`
    Open { caller: Caller, sess_sel: CapSel },
    /// Copy the server's capabilities into `caps` of the caller
    Obtain { caller: Caller, caps: CapRange },
    /// Copy `caps` of the caller to where the server wants them
    Delegate { caller: Caller, caps: CapRange },
    /// Count down a revoke that waits for its sessions to close
    Close { group: Option<u64> },
    /// Nobody waits
    Shutdown,
}

impl Waiter {
    /// The syscall blocked on this call, if any
    pub fn caller(&self) -> Option<Caller> {
        match self {
            Waiter::Open { caller, .. }
            | Waiter::Obtain { caller, .. }
            | Waiter::Delegate { caller, .. } => Some(*caller),
            Waiter::Close { .. } | Waiter::Shutdown => None,
        }
    }
}

/// A control request waiting for its turn at a service
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub service: ServiceId,
    pub req: ServiceRequest,
    pub waiter: Waiter,
}

/// A revoke answered once all its sessions are closed
#[derive(Debug, Clone, Copy)]
pub struct RevokeGroup {
    pub caller: Caller,
    pub outstanding: usize,
    /// All closes of the revoke were queued
    pub sealed: bool,
}

impl RevokeGroup {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            outstanding: 0,
            sealed: false,
        }
    }

    /// Returns true once the revoke can be answered
    pub fn is_done(&self) -> bool {
        self.sealed && self.outstanding == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("call queue is full")]
    Full,
}

/// Bounded FIFO of calls to one service
#[derive(Debug)]
pub struct CallQueue {
    capacity: usize,
    calls: VecDeque<ServiceCall>,
}

impl CallQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            calls: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.calls.len())
    }

    pub fn push(&mut self, call: ServiceCall) -> Result<(), QueueError> {
        if self.calls.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        self.calls.push_back(call);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<ServiceCall> {
        self.calls.pop_front()
    }

    /// Takes every queued call, oldest first
    pub fn drain(&mut self) -> Vec<ServiceCall> {
        self.calls.drain(..).collect()
    }
}

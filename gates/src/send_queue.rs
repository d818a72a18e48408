//! Sends that wait for credits
//!
//! Messages that cannot go out for lack of credits are parked in a bounded
//! FIFO queue and retried by the work loop in the order they were queued.

use crate::env::Env;
use crate::send_gate::SendGate;
use crate::workloop::{ItemId, WorkItem};
use core_types::{Code, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct Pending {
    gate: Rc<SendGate>,
    data: Vec<u8>,
}

/// Bounded queue of sends waiting for credits
pub struct SendQueue {
    capacity: usize,
    pending: RefCell<VecDeque<Pending>>,
}

impl SendQueue {
    /// Creates a queue and registers it with the work loop
    ///
    /// The queue is a permanent item: it never keeps the loop alive.
    pub fn with_capacity(env: &Env, capacity: usize) -> (Rc<Self>, ItemId) {
        let queue = Rc::new(Self {
            capacity,
            pending: RefCell::new(VecDeque::new()),
        });
        let id = env.workloop().add(queue.clone(), true);
        (queue, id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Sends `data` now, or queues it if `gate` is out of credits
    ///
    /// Once something is queued, later sends queue behind it so that the
    /// order is kept. Returns `NoSpace` if the queue is full; other send
    /// errors are returned as they are.
    pub fn send(&self, gate: &Rc<SendGate>, data: Vec<u8>) -> Result<()> {
        if self.is_empty() {
            match gate.send(&data) {
                Err(Code::MissCredits) => {}
                res => return res,
            }
        }
        let mut pending = self.pending.borrow_mut();
        if pending.len() >= self.capacity {
            return Err(Code::NoSpace);
        }
        pending.push_back(Pending {
            gate: gate.clone(),
            data,
        });
        log::trace!(target: "ipc", "send queued, {} pending", pending.len());
        Ok(())
    }
}

impl WorkItem for SendQueue {
    fn work(&self, _env: &Env) -> Result<bool> {
        let mut progress = false;
        loop {
            let Some((gate, data)) = self
                .pending
                .borrow()
                .front()
                .map(|p| (p.gate.clone(), p.data.clone()))
            else {
                break;
            };
            match gate.send(&data) {
                Err(Code::MissCredits) => break,
                Ok(()) => {}
                Err(code) => {
                    log::warn!(target: "ipc", "queued send to {} dropped: {}", gate.sel(), code);
                }
            }
            self.pending.borrow_mut().pop_front();
            progress = true;
        }
        Ok(progress)
    }
}

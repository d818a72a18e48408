//! Cooperative work loop
//!
//! Each VPE runs one loop on its own thread. Items are polled in
//! registration order; an item must never block. The loop keeps going as
//! long as at least one non-permanent item is registered, so a server's
//! loop ends by itself once its buffers are disabled.
//!
//! Received messages are dispatched by one item per receive buffer, which
//! takes at most one message per round and hands it to the handlers
//! subscribed to the message's label.

use crate::env::Env;
use crate::recv_gate::GateIStream;
use core_types::{Code, EpId, Label, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Something the loop polls
pub trait WorkItem {
    /// Does one bounded piece of work; returns true if anything happened
    fn work(&self, env: &Env) -> Result<bool>;
}

/// Identifies a registered item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(u64);

/// Identifies a handler subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(u64);

pub(crate) type Handler = Rc<RefCell<dyn FnMut(&mut GateIStream) -> Result<()>>>;

struct Entry {
    id: ItemId,
    permanent: bool,
    item: Rc<dyn WorkItem>,
}

struct Subscriber {
    id: SubId,
    label: Label,
    handler: Handler,
}

/// Routes the messages of one receive buffer to subscribers by label
struct Dispatcher {
    ep: EpId,
    active: Cell<bool>,
    subs: RefCell<Vec<Subscriber>>,
}

impl WorkItem for Dispatcher {
    fn work(&self, env: &Env) -> Result<bool> {
        if !self.active.get() {
            return Ok(false);
        }
        let Some(fetched) = env.dtu().fetch_msg(self.ep) else {
            return Ok(false);
        };
        let mut msg = GateIStream::new(env, self.ep, fetched);
        let handlers: Vec<Handler> = self
            .subs
            .borrow()
            .iter()
            .filter(|s| s.label == msg.label())
            .map(|s| s.handler.clone())
            .collect();

        if handlers.is_empty() {
            log::warn!(target: "ipc", "ep {}: no handler for label {:#x}", self.ep, msg.label());
            if msg.header().reply_ep.is_some() {
                if let Err(code) = msg.reply_error(Code::InvArgs) {
                    log::debug!(target: "ipc", "ep {}: error reply failed: {}", self.ep, code);
                }
            }
            return Ok(true);
        }

        for handler in handlers {
            msg.rewind();
            let Ok(mut handler) = handler.try_borrow_mut() else {
                log::warn!(target: "ipc", "ep {}: handler re-entered, message skipped", self.ep);
                continue;
            };
            (&mut *handler)(&mut msg)?;
        }
        Ok(true)
    }
}

/// The per-VPE loop
pub struct WorkLoop {
    items: RefCell<Vec<Entry>>,
    dispatchers: RefCell<HashMap<EpId, (ItemId, Rc<Dispatcher>)>>,
    next_id: Cell<u64>,
}

impl WorkLoop {
    pub fn new() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
            dispatchers: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Registers an item; permanent items do not keep the loop alive
    pub fn add(&self, item: Rc<dyn WorkItem>, permanent: bool) -> ItemId {
        let id = ItemId(self.next_id());
        self.items.borrow_mut().push(Entry {
            id,
            permanent,
            item,
        });
        id
    }

    /// Unregisters an item; returns false if it was not registered
    pub fn remove(&self, id: ItemId) -> bool {
        let removed = {
            let mut items = self.items.borrow_mut();
            items
                .iter()
                .position(|e| e.id == id)
                .map(|pos| items.remove(pos))
        };
        removed.is_some()
    }

    /// Returns true while a non-permanent item is registered
    pub fn has_items(&self) -> bool {
        self.items.borrow().iter().any(|e| !e.permanent)
    }

    /// Number of registered items
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Makes every item permanent, so the loop ends after this round
    pub fn stop(&self) {
        for entry in self.items.borrow_mut().iter_mut() {
            entry.permanent = true;
        }
    }

    /// Polls every item once
    ///
    /// Items registered while the round runs are polled from the next
    /// round on.
    pub fn tick(&self, env: &Env) -> Result<bool> {
        let snapshot: Vec<Rc<dyn WorkItem>> =
            self.items.borrow().iter().map(|e| e.item.clone()).collect();
        let mut progress = false;
        for item in snapshot {
            progress |= item.work(env)?;
        }
        Ok(progress)
    }

    /// Runs until no non-permanent item is left or an item fails
    pub fn run(&self, env: &Env) -> Result<()> {
        while self.has_items() {
            if !self.tick(env)? {
                if !env.dtu().is_alive() {
                    return Err(Code::VpeGone);
                }
                env.dtu().wait();
            }
        }
        Ok(())
    }

    pub(crate) fn subscribe(&self, ep: EpId, label: Label, handler: Handler) -> SubId {
        let id = SubId(self.next_id());
        let dispatcher = self.dispatchers.borrow().get(&ep).map(|(_, d)| d.clone());
        let dispatcher = match dispatcher {
            Some(d) => d,
            None => {
                let d = Rc::new(Dispatcher {
                    ep,
                    active: Cell::new(true),
                    subs: RefCell::new(Vec::new()),
                });
                let item = self.add(d.clone(), false);
                self.dispatchers.borrow_mut().insert(ep, (item, d.clone()));
                d
            }
        };
        dispatcher.subs.borrow_mut().push(Subscriber { id, label, handler });
        id
    }

    pub(crate) fn unsubscribe(&self, ep: EpId, id: SubId) {
        let Some(dispatcher) = self.dispatchers.borrow().get(&ep).map(|(_, d)| d.clone()) else {
            return;
        };
        let removed = {
            let mut subs = dispatcher.subs.borrow_mut();
            subs.iter()
                .position(|s| s.id == id)
                .map(|pos| subs.remove(pos))
        };
        drop(removed);
        if dispatcher.subs.borrow().is_empty() {
            self.drop_buffer(ep);
        }
    }

    /// Stops dispatching the messages of `ep`
    pub(crate) fn drop_buffer(&self, ep: EpId) {
        let removed = self.dispatchers.borrow_mut().remove(&ep);
        if let Some((item, dispatcher)) = removed {
            dispatcher.active.set(false);
            self.remove(item);
            let subs = std::mem::take(&mut *dispatcher.subs.borrow_mut());
            drop(subs);
        }
    }

    /// Drops every item and subscription
    pub(crate) fn clear(&self) {
        let dispatchers = std::mem::take(&mut *self.dispatchers.borrow_mut());
        let items = std::mem::take(&mut *self.items.borrow_mut());
        for (_, (_, dispatcher)) in dispatchers {
            dispatcher.active.set(false);
            let subs = std::mem::take(&mut *dispatcher.subs.borrow_mut());
            drop(subs);
        }
        drop(items);
    }
}

impl Default for WorkLoop {
    fn default() -> Self {
        Self::new()
    }
}

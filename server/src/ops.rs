//! Operation tables
//!
//! A request's first value is its operation tag. The tag indexes a table
//! whose size is fixed when the service is built; a tag outside the table
//! or without an entry is rejected with `InvArgs` instead of being trusted.

use core_types::{Code, Result};
use gates::GateIStream;
use std::fmt;

/// Handles one request; replies through the message
///
/// An error is sent back to the client as the reply code.
pub type Operation<S> = fn(&mut S, &mut GateIStream) -> Result<()>;

/// Bounds-checked map from operation tag to handler
pub struct OperationTable<S> {
    ops: Vec<Option<Operation<S>>>,
}

impl<S> OperationTable<S> {
    /// Creates a table for tags `0..size`
    pub fn new(size: usize) -> Self {
        Self {
            ops: vec![None; size],
        }
    }

    /// Installs `f` for tag `op`
    ///
    /// Fails with `InvArgs` if the tag is outside the table and with
    /// `Exists` if it already has a handler.
    pub fn register(&mut self, op: u64, f: Operation<S>) -> Result<()> {
        let slot = usize::try_from(op)
            .ok()
            .and_then(|i| self.ops.get_mut(i))
            .ok_or(Code::InvArgs)?;
        if slot.is_some() {
            return Err(Code::Exists);
        }
        *slot = Some(f);
        Ok(())
    }

    /// Builder form of [`OperationTable::register`]
    pub fn with(mut self, op: u64, f: Operation<S>) -> Result<Self> {
        self.register(op, f)?;
        Ok(self)
    }

    pub fn get(&self, op: u64) -> Option<Operation<S>> {
        usize::try_from(op)
            .ok()
            .and_then(|i| self.ops.get(i))
            .copied()
            .flatten()
    }

    /// Size of the table
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of tags with a handler
    pub fn registered(&self) -> usize {
        self.ops.iter().filter(|o| o.is_some()).count()
    }

    /// Pops the tag off `msg` and runs its handler
    pub fn dispatch(&self, sess: &mut S, msg: &mut GateIStream) -> Result<()> {
        let op: u64 = msg.pop()?;
        let Some(f) = self.get(op) else {
            log::debug!(target: "serv", "operation {} not in table of {}", op, self.ops.len());
            return Err(Code::InvArgs);
        };
        f(sess, msg)
    }
}

impl<S> fmt::Debug for OperationTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTable")
            .field("size", &self.ops.len())
            .field("registered", &self.registered())
            .finish()
    }
}

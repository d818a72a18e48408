//! Kernel-side VPE records

use crate::pending::Caller;
use core_types::{CapSel, PeId, VpeId};
use dtu::EP_COUNT;
use gates::Program;
use std::fmt;

/// Lifecycle of a VPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpeState {
    /// Created, nothing to run yet
    Created,
    /// A program is waiting for `VpeCtrl(Start)`
    Loaded,
    Running,
    Dead,
}

/// What the kernel knows about one VPE
pub struct VpeRecord {
    pub id: VpeId,
    pub name: String,
    pub pe: PeId,
    pub parent: Option<VpeId>,
    pub state: VpeState,
    pub exit_code: Option<i32>,
    /// Program handed over by the loader and its first free selector
    pub program: Option<(CapSel, Program)>,
    /// Callers blocked in `VpeCtrl(Wait)` on this VPE
    pub waiters: Vec<Caller>,
    /// Selector bound to each endpoint
    pub bindings: [Option<CapSel>; EP_COUNT],
    /// Syscall of this VPE the kernel has not answered yet
    pub pending: Option<Caller>,
}

impl VpeRecord {
    pub fn new(id: VpeId, name: &str, pe: PeId, parent: Option<VpeId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            pe,
            parent,
            state: VpeState::Created,
            exit_code: None,
            program: None,
            waiters: Vec::new(),
            bindings: [None; EP_COUNT],
            pending: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state != VpeState::Dead
    }

    /// Endpoints `sel` is bound to
    pub fn eps_of(&self, sel: CapSel) -> Vec<usize> {
        self.bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == Some(sel))
            .map(|(ep, _)| ep)
            .collect()
    }
}

impl fmt::Debug for VpeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpeRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pe", &self.pe)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .field("loaded", &self.program.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings() {
        let mut rec = VpeRecord::new(VpeId::new(1), "a", PeId::new(1), None);
        assert!(rec.is_alive());
        rec.bindings[4] = Some(7);
        rec.bindings[9] = Some(7);
        rec.bindings[5] = Some(8);
        assert_eq!(rec.eps_of(7), vec![4, 9]);
        assert!(rec.eps_of(2).is_empty());
        rec.state = VpeState::Dead;
        assert!(!rec.is_alive());
    }
}

//! Capability handles
//!
//! A capability is a process-local selector naming a kernel object. The
//! kernel owns the object; the process only decides, through [`Ownership`],
//! what happens to the selector and the object when its handle is released.

use crate::ids::{CapSel, EpId, ServiceId, VpeId};
use crate::memory::MemoryPerms;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of kernel object a capability refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapKind {
    /// A registered service
    Service,
    /// A session with a service
    Session,
    /// Permission to send to a receive endpoint
    Send,
    /// A region of global memory
    Mem,
    /// A VPE
    Vpe,
}

impl fmt::Display for CapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapKind::Service => write!(f, "Service"),
            CapKind::Session => write!(f, "Session"),
            CapKind::Send => write!(f, "Send"),
            CapKind::Mem => write!(f, "Mem"),
            CapKind::Vpe => write!(f, "VPE"),
        }
    }
}

/// What releasing a capability handle does
///
/// A selector is only handed back once the kernel object behind it is
/// gone, so a freed selector can be reused right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ownership {
    /// Revoke the capability and free the selector
    Owned,
    /// Revoke the capability; the selector belongs to the caller
    CapOnly,
    /// Neither; somebody else manages the capability
    Borrowed,
    /// Lives as long as the process and is never released
    Static,
}

impl Ownership {
    /// Returns true if release revokes the kernel object
    pub fn revokes(&self) -> bool {
        matches!(self, Ownership::Owned | Ownership::CapOnly)
    }

    /// Returns true if release hands the selector back to the allocator
    pub fn frees_sel(&self) -> bool {
        matches!(self, Ownership::Owned)
    }
}

/// Contiguous range of capability selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapRange {
    pub start: CapSel,
    pub count: u32,
}

impl CapRange {
    /// Creates a range of `count` selectors starting at `start`
    pub fn new(start: CapSel, count: u32) -> Self {
        Self { start, count }
    }

    /// Creates a range holding exactly one selector
    pub fn single(sel: CapSel) -> Self {
        Self::new(sel, 1)
    }

    /// Returns the first selector past the range
    pub fn end(&self) -> CapSel {
        self.start.saturating_add(self.count)
    }

    /// Iterates over all selectors in the range
    pub fn iter(&self) -> impl Iterator<Item = CapSel> {
        self.start..self.end()
    }

    /// Returns true if `sel` lies in the range
    pub fn contains(&self, sel: CapSel) -> bool {
        sel >= self.start && sel < self.end()
    }
}

impl fmt::Display for CapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CRD[{}:{}]", self.start, self.count)
    }
}

/// Capability lifecycle events recorded by the kernel audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityEvent {
    /// A root capability was created
    Created {
        vpe: VpeId,
        sel: CapSel,
        kind: CapKind,
    },
    /// A capability was derived from a parent in the same table
    Derived {
        vpe: VpeId,
        parent: CapSel,
        child: CapSel,
        perms: MemoryPerms,
    },
    /// A capability was copied into another VPE's table
    Exchanged {
        from: VpeId,
        from_sel: CapSel,
        to: VpeId,
        to_sel: CapSel,
    },
    /// A capability was bound to an endpoint
    Activated { vpe: VpeId, sel: CapSel, ep: EpId },
    /// An endpoint was invalidated because its capability went away
    Deactivated { vpe: VpeId, ep: EpId },
    /// A capability was removed from its table
    Revoked { vpe: VpeId, sel: CapSel },
    /// A service name was registered
    ServiceRegistered { service: ServiceId, name: String },
    /// A service name was dropped
    ServiceRemoved { service: ServiceId },
}

impl CapabilityEvent {
    /// Returns the VPE whose table the event touched, if any
    pub fn vpe(&self) -> Option<VpeId> {
        match self {
            CapabilityEvent::Created { vpe, .. }
            | CapabilityEvent::Derived { vpe, .. }
            | CapabilityEvent::Activated { vpe, .. }
            | CapabilityEvent::Deactivated { vpe, .. }
            | CapabilityEvent::Revoked { vpe, .. } => Some(*vpe),
            CapabilityEvent::Exchanged { to, .. } => Some(*to),
            CapabilityEvent::ServiceRegistered { .. } | CapabilityEvent::ServiceRemoved { .. } => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_release_behaviour() {
        assert!(Ownership::Owned.revokes() && Ownership::Owned.frees_sel());
        assert!(Ownership::CapOnly.revokes() && !Ownership::CapOnly.frees_sel());
        assert!(!Ownership::Borrowed.revokes() && !Ownership::Borrowed.frees_sel());
        assert!(!Ownership::Static.revokes() && !Ownership::Static.frees_sel());
    }

    #[test]
    fn test_cap_range() {
        let crd = CapRange::new(4, 3);
        assert_eq!(crd.iter().collect::<Vec<_>>(), vec![4, 5, 6]);
        assert!(crd.contains(6));
        assert!(!crd.contains(7));
        assert_eq!(crd.to_string(), "CRD[4:3]");
        assert_eq!(CapRange::single(9).end(), 10);
    }

    #[test]
    fn test_cap_range_serializes_as_record() {
        let json = serde_json::to_string(&CapRange::new(2, 1)).unwrap();
        assert_eq!(json, r#"{"start":2,"count":1}"#);
    }

    #[test]
    fn test_event_vpe() {
        let vpe = VpeId::new(2);
        let ev = CapabilityEvent::Revoked { vpe, sel: 5 };
        assert_eq!(ev.vpe(), Some(vpe));
        let ev = CapabilityEvent::ServiceRemoved {
            service: ServiceId::new(),
        };
        assert_eq!(ev.vpe(), None);
    }
}

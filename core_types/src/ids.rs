//! Unique identifiers for system entities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Process-local capability selector
pub type CapSel = u32;

/// Selector value that names no capability
pub const INVALID_SEL: CapSel = CapSel::MAX;

/// Index of an endpoint register set on a transfer engine
pub type EpId = usize;

/// Opaque demultiplexing tag carried by every message
pub type Label = u64;

/// Identifier of a virtual processing element (VPE)
///
/// VPEs are the process-like execution contexts that own capabilities
/// and endpoints. Ids are handed out by the kernel and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VpeId(u32);

impl VpeId {
    /// Creates a VPE id from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VpeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VPE({})", self.0)
    }
}

/// Identifier of a processing element
///
/// PE 0 belongs to the kernel. A VPE runs on exactly one PE at a time but
/// may be moved to another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeId(u32);

impl PeId {
    /// The kernel's processing element
    pub const KERNEL: PeId = PeId(0);

    /// Creates a PE id from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PE({})", self.0)
    }
}

/// Unique identifier for a registered service
///
/// Assigned by the kernel when a server registers its name. Never leaves
/// the kernel; clients only ever see the service through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Creates a new random service ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a service ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_uniqueness() {
        let id1 = ServiceId::new();
        let id2 = ServiceId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_service_id_from_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(ServiceId::from_uuid(uuid).as_uuid(), uuid);
    }

    #[test]
    fn test_display() {
        assert_eq!(VpeId::new(3).to_string(), "VPE(3)");
        assert_eq!(PeId::KERNEL.to_string(), "PE(0)");
    }

    #[test]
    fn test_vpe_id_ordering() {
        assert!(VpeId::new(1) < VpeId::new(2));
        assert_eq!(VpeId::new(7).raw(), 7);
    }
}

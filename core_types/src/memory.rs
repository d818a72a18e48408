//! Memory permissions
//!
//! Memory capabilities carry a permission mask. Derivation may only
//! downgrade it; [`MemoryPerms::is_subset_of`] is the check the kernel
//! applies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission flags for memory capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemoryPerms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryPerms {
    /// No permissions
    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
        }
    }

    /// Read-only permission
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    /// Write-only permission
    pub const fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            execute: false,
        }
    }

    /// Read and write permissions
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    /// All permissions
    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    /// Check if this has no permissions
    pub fn is_none(&self) -> bool {
        !self.read && !self.write && !self.execute
    }

    /// Returns true if every permission in `self` is also in `other`
    pub fn is_subset_of(&self, other: &MemoryPerms) -> bool {
        (!self.read || other.read) && (!self.write || other.write) && (!self.execute || other.execute)
    }

    /// Packs the mask into the endpoint register layout
    pub fn bits(&self) -> u8 {
        (self.read as u8) | ((self.write as u8) << 1) | ((self.execute as u8) << 2)
    }

    /// Unpacks the endpoint register layout
    pub fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & 1 != 0,
            write: bits & 2 != 0,
            execute: bits & 4 != 0,
        }
    }
}

impl fmt::Display for MemoryPerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "R" } else { "-" },
            if self.write { "W" } else { "-" },
            if self.execute { "X" } else { "-" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset() {
        let rw = MemoryPerms::read_write();
        let r = MemoryPerms::read_only();
        assert!(r.is_subset_of(&rw));
        assert!(rw.is_subset_of(&rw));
        assert!(!rw.is_subset_of(&r));
        assert!(MemoryPerms::none().is_subset_of(&r));
        assert!(!MemoryPerms::all().is_subset_of(&rw));
    }

    #[test]
    fn test_bits() {
        for perms in [
            MemoryPerms::none(),
            MemoryPerms::read_only(),
            MemoryPerms::write_only(),
            MemoryPerms::read_write(),
            MemoryPerms::all(),
        ] {
            assert_eq!(MemoryPerms::from_bits(perms.bits()), perms);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(MemoryPerms::read_write().to_string(), "RW-");
        assert_eq!(MemoryPerms::none().to_string(), "---");
    }
}

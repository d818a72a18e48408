//! Capability Audit Trail
//!
//! The kernel records every capability transition, every syscall it
//! answered and every VPE exit. Tests assert on the trail to check the
//! security properties instead of poking at kernel internals.
//!
//! ## Philosophy
//!
//! - Deterministic: events are numbered in the order the kernel saw them
//! - Queryable: predicates over events, no string matching
//!
//! ## Example
//!
//! ```
//! use sim_kernel::capability_audit::{AuditEvent, CapabilityAuditLog};
//! use core_types::{CapabilityEvent, VpeId};
//!
//! let mut log = CapabilityAuditLog::new();
//! log.record(AuditEvent::Capability(CapabilityEvent::Revoked {
//!     vpe: VpeId::new(1),
//!     sel: 4,
//! }));
//! assert_eq!(log.len(), 1);
//! ```

use core_types::{CapSel, CapabilityEvent, ServiceId, VpeId};
use kernel_api::{ServiceCmd, Syscall};

/// Something the kernel did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// A capability changed
    Capability(CapabilityEvent),
    /// A syscall was answered with `code`
    Syscall { vpe: VpeId, op: Syscall, code: u64 },
    /// A service answered a control request with `code`
    ServiceCall {
        service: ServiceId,
        cmd: ServiceCmd,
        code: u64,
    },
    /// A VPE exited
    Exited { vpe: VpeId, code: i32 },
}

/// An event with its position in the trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub seq: u64,
    pub event: AuditEvent,
}

/// Audit log of the kernel
#[derive(Debug, Default)]
pub struct CapabilityAuditLog {
    events: Vec<AuditRecord>,
    next_seq: u64,
}

impl CapabilityAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event
    pub fn record(&mut self, event: AuditEvent) {
        self.events.push(AuditRecord {
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    pub fn get_events(&self) -> &[AuditRecord] {
        &self.events
    }

    /// Capability events that touched `vpe`'s table
    pub fn capability_events(&self, vpe: VpeId) -> Vec<&CapabilityEvent> {
        self.events
            .iter()
            .filter_map(|r| match &r.event {
                AuditEvent::Capability(ev) if ev.vpe() == Some(vpe) => Some(ev),
                _ => None,
            })
            .collect()
    }

    /// Returns true if `sel` of `vpe` was revoked at some point
    pub fn was_revoked(&self, vpe: VpeId, sel: CapSel) -> bool {
        self.has_event(|ev| {
            *ev == AuditEvent::Capability(CapabilityEvent::Revoked { vpe, sel })
        })
    }

    /// Number of `op` syscalls `vpe` got an answer to
    pub fn count_syscalls(&self, vpe: VpeId, op: Syscall) -> usize {
        self.count_events(|ev| {
            matches!(ev, AuditEvent::Syscall { vpe: v, op: o, .. } if *v == vpe && *o == op)
        })
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&AuditEvent) -> bool,
    {
        self.events.iter().filter(|r| predicate(&r.event)).count()
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&AuditEvent) -> bool,
    {
        self.events.iter().any(|r| predicate(&r.event))
    }

    /// Clears all events; numbering continues
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::CapKind;

    fn created(vpe: u32, sel: CapSel) -> AuditEvent {
        AuditEvent::Capability(CapabilityEvent::Created {
            vpe: VpeId::new(vpe),
            sel,
            kind: CapKind::Send,
        })
    }

    #[test]
    fn test_audit_log_creation() {
        let log = CapabilityAuditLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_records_are_numbered() {
        let mut log = CapabilityAuditLog::new();
        log.record(created(1, 2));
        log.record(created(1, 3));
        let seqs: Vec<u64> = log.get_events().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);

        log.clear();
        log.record(created(1, 4));
        assert_eq!(log.get_events()[0].seq, 2);
    }

    #[test]
    fn test_capability_events_per_vpe() {
        let mut log = CapabilityAuditLog::new();
        log.record(created(1, 2));
        log.record(created(2, 2));
        log.record(AuditEvent::Capability(CapabilityEvent::Revoked {
            vpe: VpeId::new(1),
            sel: 2,
        }));
        assert_eq!(log.capability_events(VpeId::new(1)).len(), 2);
        assert!(log.was_revoked(VpeId::new(1), 2));
        assert!(!log.was_revoked(VpeId::new(2), 2));
    }

    #[test]
    fn test_count_syscalls() {
        let mut log = CapabilityAuditLog::new();
        let vpe = VpeId::new(3);
        for code in [0, 3] {
            log.record(AuditEvent::Syscall {
                vpe,
                op: Syscall::Activate,
                code,
            });
        }
        log.record(AuditEvent::Syscall {
            vpe,
            op: Syscall::Noop,
            code: 0,
        });
        assert_eq!(log.count_syscalls(vpe, Syscall::Activate), 2);
        assert_eq!(log.count_syscalls(VpeId::new(4), Syscall::Activate), 0);
        assert!(log.has_event(|ev| matches!(ev, AuditEvent::Syscall { code: 3, .. })));
    }
}

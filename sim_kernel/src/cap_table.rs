//! Capability tables and the derivation tree
//!
//! Every VPE has a table from selector to capability. A capability made
//! from another one (a copy handed to another VPE, a derived memory range,
//! a session of a service) is its child, so that revoking a capability
//! takes everything made from it along, across all tables.

use core_types::{
    CapKind, CapSel, Code, EpId, Label, MemoryPerms, Result, ServiceId, VpeId, INVALID_SEL,
};
use std::collections::BTreeMap;
use std::fmt;

/// Names one capability across all tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapRef {
    pub vpe: VpeId,
    pub sel: CapSel,
}

impl CapRef {
    pub fn new(vpe: VpeId, sel: CapSel) -> Self {
        Self { vpe, sel }
    }
}

impl fmt::Display for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vpe, self.sel)
    }
}

/// Permission to send to receive endpoint `ep` of `vpe`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendObject {
    pub vpe: VpeId,
    pub ep: EpId,
    pub label: Label,
    pub credits: u32,
}

/// A range of global memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemObject {
    pub addr: u64,
    pub size: u64,
    pub perms: MemoryPerms,
    /// The range was allocated for this capability and goes with it
    pub root: bool,
}

/// A session of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionObject {
    pub service: ServiceId,
    pub ident: u64,
    /// Created by the service; its removal closes the session
    pub origin: bool,
}

/// The kernel object behind a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KObject {
    Vpe(VpeId),
    Send(SendObject),
    Mem(MemObject),
    Service(ServiceId),
    Session(SessionObject),
}

impl KObject {
    pub fn kind(&self) -> CapKind {
        match self {
            KObject::Vpe(_) => CapKind::Vpe,
            KObject::Send(_) => CapKind::Send,
            KObject::Mem(_) => CapKind::Mem,
            KObject::Service(_) => CapKind::Service,
            KObject::Session(_) => CapKind::Session,
        }
    }

    /// The same object as seen by a copy
    ///
    /// Copies never own allocated memory or open sessions.
    pub fn copied(&self) -> KObject {
        match *self {
            KObject::Mem(m) => KObject::Mem(MemObject { root: false, ..m }),
            KObject::Session(s) => KObject::Session(SessionObject { origin: false, ..s }),
            obj => obj,
        }
    }
}

/// One table entry
#[derive(Debug, Clone)]
pub struct Capability {
    pub obj: KObject,
    parent: Option<CapRef>,
    children: Vec<CapRef>,
}

impl Capability {
    pub fn parent(&self) -> Option<CapRef> {
        self.parent
    }

    pub fn children(&self) -> &[CapRef] {
        &self.children
    }
}

/// All capability tables
#[derive(Debug, Default)]
pub struct CapSpace {
    tables: BTreeMap<VpeId, BTreeMap<CapSel, Capability>>,
}

impl CapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, vpe: VpeId) {
        self.tables.entry(vpe).or_default();
    }

    /// Drops `vpe`'s table; its capabilities must have been revoked
    pub fn remove_table(&mut self, vpe: VpeId) {
        self.tables.remove(&vpe);
    }

    pub fn has_table(&self, vpe: VpeId) -> bool {
        self.tables.contains_key(&vpe)
    }

    pub fn get(&self, r: CapRef) -> Result<&Capability> {
        self.tables
            .get(&r.vpe)
            .and_then(|t| t.get(&r.sel))
            .ok_or(Code::InvArgs)
    }

    pub fn obj(&self, r: CapRef) -> Result<KObject> {
        self.get(r).map(|c| c.obj)
    }

    pub fn contains(&self, r: CapRef) -> bool {
        self.get(r).is_ok()
    }

    /// Selectors in use in `vpe`'s table
    pub fn sels(&self, vpe: VpeId) -> Vec<CapSel> {
        self.tables
            .get(&vpe)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, vpe: VpeId) -> usize {
        self.tables.get(&vpe).map_or(0, |t| t.len())
    }

    /// Checks that `r` can take a new capability
    pub fn check_free(&self, r: CapRef) -> Result<()> {
        let table = self.tables.get(&r.vpe).ok_or(Code::VpeGone)?;
        if r.sel == INVALID_SEL || table.contains_key(&r.sel) {
            return Err(Code::InvArgs);
        }
        Ok(())
    }

    /// Puts `obj` at `r`, as a child of `parent` if given
    pub fn insert(&mut self, r: CapRef, obj: KObject, parent: Option<CapRef>) -> Result<()> {
        self.check_free(r)?;
        if let Some(p) = parent {
            self.tables
                .get_mut(&p.vpe)
                .and_then(|t| t.get_mut(&p.sel))
                .ok_or(Code::InvArgs)?
                .children
                .push(r);
        }
        if let Some(table) = self.tables.get_mut(&r.vpe) {
            table.insert(
                r.sel,
                Capability {
                    obj,
                    parent,
                    children: Vec::new(),
                },
            );
        }
        Ok(())
    }

    /// Removes everything derived from `r`, and `r` itself if `own` is set
    ///
    /// Returns the removed capabilities, the deepest ones first.
    pub fn revoke(&mut self, r: CapRef, own: bool) -> Vec<(CapRef, Capability)> {
        let Ok(cap) = self.get(r) else {
            return Vec::new();
        };
        let mut order = Vec::new();
        let mut stack: Vec<CapRef> = if own {
            vec![r]
        } else {
            cap.children.clone()
        };
        while let Some(next) = stack.pop() {
            if let Ok(c) = self.get(next) {
                stack.extend(c.children.iter().copied());
                order.push(next);
            }
        }

        let mut removed = Vec::with_capacity(order.len());
        for victim in order.into_iter().rev() {
            let Some(cap) = self
                .tables
                .get_mut(&victim.vpe)
                .and_then(|t| t.remove(&victim.sel))
            else {
                continue;
            };
            if let Some(p) = cap.parent {
                if let Some(parent) = self.tables.get_mut(&p.vpe).and_then(|t| t.get_mut(&p.sel)) {
                    parent.children.retain(|c| *c != victim);
                }
            }
            removed.push((victim, cap));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: VpeId = VpeId::new(1);
    const B: VpeId = VpeId::new(2);

    fn mem(size: u64, perms: MemoryPerms) -> KObject {
        KObject::Mem(MemObject {
            addr: 0,
            size,
            perms,
            root: true,
        })
    }

    fn space() -> CapSpace {
        let mut caps = CapSpace::new();
        caps.add_table(A);
        caps.add_table(B);
        caps
    }

    #[test]
    fn test_insert_checks_selector() {
        let mut caps = space();
        let r = CapRef::new(A, 2);
        caps.insert(r, KObject::Vpe(A), None).unwrap();
        assert_eq!(caps.insert(r, KObject::Vpe(A), None), Err(Code::InvArgs));
        assert_eq!(
            caps.insert(CapRef::new(A, INVALID_SEL), KObject::Vpe(A), None),
            Err(Code::InvArgs)
        );
        assert_eq!(
            caps.insert(CapRef::new(VpeId::new(9), 2), KObject::Vpe(A), None),
            Err(Code::VpeGone)
        );
        assert_eq!(
            caps.insert(CapRef::new(A, 3), KObject::Vpe(A), Some(CapRef::new(A, 7))),
            Err(Code::InvArgs)
        );
        assert_eq!(caps.obj(r).unwrap().kind(), CapKind::Vpe);
    }

    #[test]
    fn test_revoke_is_transitive_across_tables() {
        let mut caps = space();
        let root = CapRef::new(A, 2);
        let child = CapRef::new(B, 5);
        let grandchild = CapRef::new(A, 3);
        caps.insert(root, mem(64, MemoryPerms::read_write()), None).unwrap();
        caps.insert(child, mem(32, MemoryPerms::read_only()), Some(root)).unwrap();
        caps.insert(grandchild, mem(16, MemoryPerms::read_only()), Some(child)).unwrap();

        let removed: Vec<CapRef> = caps.revoke(root, true).into_iter().map(|(r, _)| r).collect();
        assert_eq!(removed, vec![grandchild, child, root]);
        assert!(!caps.contains(root));
        assert!(!caps.contains(child));
        assert!(!caps.contains(grandchild));
    }

    #[test]
    fn test_revoke_children_only() {
        let mut caps = space();
        let root = CapRef::new(A, 2);
        caps.insert(root, mem(64, MemoryPerms::read_write()), None).unwrap();
        caps.insert(CapRef::new(B, 2), mem(64, MemoryPerms::read_write()), Some(root)).unwrap();
        caps.insert(CapRef::new(B, 3), mem(64, MemoryPerms::read_write()), Some(root)).unwrap();

        assert_eq!(caps.revoke(root, false).len(), 2);
        assert!(caps.contains(root));
        assert!(caps.get(root).unwrap().children().is_empty());
        assert_eq!(caps.len(B), 0);
    }

    #[test]
    fn test_revoke_leaf_detaches_from_parent() {
        let mut caps = space();
        let root = CapRef::new(A, 2);
        let leaf = CapRef::new(B, 2);
        caps.insert(root, KObject::Vpe(B), None).unwrap();
        caps.insert(leaf, KObject::Vpe(B), Some(root)).unwrap();
        assert_eq!(caps.get(leaf).unwrap().parent(), Some(root));

        caps.revoke(leaf, true);
        assert!(caps.get(root).unwrap().children().is_empty());
        assert!(caps.revoke(leaf, true).is_empty());
    }

    #[test]
    fn test_copies_do_not_own() {
        let obj = mem(64, MemoryPerms::read_write());
        assert!(matches!(obj.copied(), KObject::Mem(MemObject { root: false, .. })));
        let sess = KObject::Session(SessionObject {
            service: ServiceId::new(),
            ident: 1,
            origin: true,
        });
        assert!(matches!(
            sess.copied(),
            KObject::Session(SessionObject { origin: false, .. })
        ));
    }
}

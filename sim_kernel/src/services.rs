//! Registered services
//!
//! A service is known by name. The kernel reaches it through the receive
//! endpoint its control gate points to, and talks to it one request at a
//! time; further requests wait in the service's [`CallQueue`].

use crate::pending::CallQueue;
use core_types::{CapSel, Code, EpId, Label, Result, ServiceId, VpeId};
use std::collections::HashMap;

/// One registered service
#[derive(Debug)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    /// The server VPE
    pub vpe: VpeId,
    /// Selector of the service capability in the server's table
    pub srv_sel: CapSel,
    /// Control receive endpoint at the server
    pub ep: EpId,
    /// Label control requests carry
    pub label: Label,
    pub queue: CallQueue,
    /// Reply label of the request the service is working on
    pub in_flight: Option<Label>,
    /// Shutdown was already requested
    pub shutdown_sent: bool,
}

impl Service {
    /// Returns true while requests are queued or unanswered
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.queue.is_empty()
    }
}

/// All registered services
#[derive(Debug, Default)]
pub struct ServiceList {
    services: HashMap<ServiceId, Service>,
}

impl ServiceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `service`; names are unique
    pub fn register(&mut self, service: Service) -> Result<ServiceId> {
        if service.name.is_empty() {
            return Err(Code::InvArgs);
        }
        if self.find(&service.name).is_some() {
            return Err(Code::Exists);
        }
        let id = service.id;
        self.services.insert(id, service);
        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<&Service> {
        self.services.values().find(|s| s.name == name)
    }

    pub fn get(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut Service> {
        self.services.get_mut(&id)
    }

    pub fn remove(&mut self, id: ServiceId) -> Option<Service> {
        self.services.remove(&id)
    }

    /// Services run by `vpe`
    pub fn owned_by(&self, vpe: VpeId) -> Vec<ServiceId> {
        self.services
            .values()
            .filter(|s| s.vpe == vpe)
            .map(|s| s.id)
            .collect()
    }

    /// Service listening on control endpoint `ep` of `vpe`
    pub fn by_endpoint(&self, vpe: VpeId, ep: EpId) -> Vec<ServiceId> {
        self.services
            .values()
            .filter(|s| s.vpe == vpe && s.ep == ep)
            .map(|s| s.id)
            .collect()
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.keys().copied().collect()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, vpe: u32) -> Service {
        Service {
            id: ServiceId::new(),
            name: name.to_string(),
            vpe: VpeId::new(vpe),
            srv_sel: 2,
            ep: 3,
            label: 0,
            queue: CallQueue::with_capacity(4),
            in_flight: None,
            shutdown_sent: false,
        }
    }

    #[test]
    fn test_names_are_unique() {
        let mut list = ServiceList::new();
        let id = list.register(service("echo", 1)).unwrap();
        assert_eq!(list.register(service("echo", 2)), Err(Code::Exists));
        assert_eq!(list.register(service("", 2)), Err(Code::InvArgs));
        assert_eq!(list.find("echo").map(|s| s.id), Some(id));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_lookup_by_owner_and_endpoint() {
        let mut list = ServiceList::new();
        let a = list.register(service("a", 1)).unwrap();
        let b = list.register(service("b", 1)).unwrap();
        list.register(service("c", 2)).unwrap();

        let mut owned = list.owned_by(VpeId::new(1));
        owned.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(owned, expected);
        assert_eq!(list.by_endpoint(VpeId::new(2), 3).len(), 1);
        assert_eq!(list.names(), vec!["a", "b", "c"]);

        list.remove(a);
        assert!(list.find("a").is_none());
        assert!(list.get(b).is_some());
    }

    #[test]
    fn test_busy_while_calls_pending() {
        let mut srv = service("x", 1);
        assert!(!srv.is_busy());
        srv.in_flight = Some(7);
        assert!(srv.is_busy());
    }
}

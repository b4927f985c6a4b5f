use std::collections::HashMap;

use indexmap::IndexSet;

use crate::protocol::{ActorId, ClientId};

/// Who simulates each rigid body. Every registered rigid body is owned by
/// exactly one client or sits in the orphan set until an authority exists.
#[derive(Debug, Default)]
pub struct AuthorityLedger {
    authoritative: Option<ClientId>,
    owners: HashMap<ActorId, ClientId>,
    orphans: IndexSet<ActorId>,
}

impl AuthorityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authoritative(&self) -> Option<ClientId> {
        self.authoritative
    }

    pub fn is_authoritative(&self, client_id: ClientId) -> bool {
        self.authoritative == Some(client_id)
    }

    pub fn owner(&self, actor_id: ActorId) -> Option<ClientId> {
        self.owners.get(&actor_id).copied()
    }

    pub fn is_orphan(&self, actor_id: ActorId) -> bool {
        self.orphans.contains(&actor_id)
    }

    pub fn is_registered(&self, actor_id: ActorId) -> bool {
        self.owners.contains_key(&actor_id) || self.orphans.contains(&actor_id)
    }

    pub fn orphans(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.orphans.iter().copied()
    }

    /// Starts tracking a rigid body, owned by the authority if there is one.
    pub fn register(&mut self, actor_id: ActorId) {
        if self.is_registered(actor_id) {
            return;
        }
        match self.authoritative {
            Some(authority) => {
                self.owners.insert(actor_id, authority);
            }
            None => {
                self.orphans.insert(actor_id);
            }
        }
    }

    /// Hands simulation of a tracked rigid body to `client_id`.
    pub fn transfer(&mut self, actor_id: ActorId, client_id: ClientId) -> bool {
        if !self.is_registered(actor_id) {
            return false;
        }
        self.orphans.shift_remove(&actor_id);
        self.owners.insert(actor_id, client_id);
        true
    }

    /// Returns a rigid body to the authority, or to the orphan set.
    pub fn release(&mut self, actor_id: ActorId) {
        if !self.is_registered(actor_id) {
            return;
        }
        self.owners.remove(&actor_id);
        self.orphans.shift_remove(&actor_id);
        self.register(actor_id);
    }

    pub fn forget(&mut self, actor_id: ActorId) {
        self.owners.remove(&actor_id);
        self.orphans.shift_remove(&actor_id);
    }

    /// Makes `client_id` the authority and gives it every orphan. Returns the
    /// previous authority.
    pub fn elect(&mut self, client_id: ClientId) -> Option<ClientId> {
        let previous = self.authoritative.replace(client_id);
        for actor_id in self.orphans.drain(..) {
            self.owners.insert(actor_id, client_id);
        }
        previous
    }

    /// Releases everything `client_id` owned. Bodies it held go back to the
    /// authority, or become orphans if it was the authority itself.
    pub fn client_departed(&mut self, client_id: ClientId) {
        if self.authoritative == Some(client_id) {
            self.authoritative = None;
        }
        let released: Vec<ActorId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == client_id)
            .map(|(actor_id, _)| *actor_id)
            .collect();
        for actor_id in released {
            self.owners.remove(&actor_id);
            self.register(actor_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test_timeout::timeout]
    fn bodies_follow_the_authority_and_survive_its_departure() {
        let mut ledger = AuthorityLedger::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let body = Uuid::new_v4();

        ledger.elect(first);
        ledger.register(body);
        assert_eq!(ledger.owner(body), Some(first));

        ledger.client_departed(first);
        assert_eq!(ledger.authoritative(), None);
        assert!(ledger.is_orphan(body));
        assert_eq!(ledger.owner(body), None);

        assert_eq!(ledger.elect(second), None);
        assert_eq!(ledger.owner(body), Some(second));
        assert!(!ledger.is_orphan(body));
    }

    #[test_timeout::timeout]
    fn grabbed_body_reverts_to_authority_on_release_or_departure() {
        let mut ledger = AuthorityLedger::new();
        let authority = Uuid::new_v4();
        let grabber = Uuid::new_v4();
        let body = Uuid::new_v4();
        ledger.elect(authority);
        ledger.register(body);

        assert!(ledger.transfer(body, grabber));
        assert_eq!(ledger.owner(body), Some(grabber));
        ledger.release(body);
        assert_eq!(ledger.owner(body), Some(authority));

        ledger.transfer(body, grabber);
        ledger.client_departed(grabber);
        assert_eq!(ledger.owner(body), Some(authority));
        assert!(!ledger.transfer(Uuid::new_v4(), grabber));
    }

    #[test_timeout::timeout]
    fn without_authority_released_bodies_are_orphaned() {
        let mut ledger = AuthorityLedger::new();
        let grabber = Uuid::new_v4();
        let body = Uuid::new_v4();
        ledger.register(body);
        assert!(ledger.is_orphan(body));
        ledger.transfer(body, grabber);
        assert_eq!(ledger.owner(body), Some(grabber));
        ledger.release(body);
        assert!(ledger.is_orphan(body));
        ledger.forget(body);
        assert!(!ledger.is_registered(body));
    }
}

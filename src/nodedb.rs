//! Node database interface
//!
//! Hop candidates come from here as fully-formed, verified router
//! contacts. The database itself (persistence, gossip, bootstrap) is an
//! external collaborator; the core only reads it, plus one write path:
//! a transit hop stores the next-hop contact carried inside a commit
//! record so it can forward without prior knowledge of that router.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::rngs::OsRng;

use crate::contact::{RouterContact, RouterId};

/// Supplier of router contacts
pub trait NodeDb: Send + Sync {
    /// Look up a contact by identity
    fn get(&self, id: &RouterId) -> Option<RouterContact>;

    /// Pick a uniformly random contact whose identity is not in `exclude`
    fn select_random_excluding(&self, exclude: &HashSet<RouterId>) -> Option<RouterContact>;

    /// Store a contact learned from the network (e.g. out of a commit
    /// record). Implementations decide whether to keep or refresh it.
    fn store(&self, rc: RouterContact);

    /// Whether this identity is a known relay. Sources that are not are
    /// treated as clients for admission limiting.
    fn is_relay(&self, id: &RouterId) -> bool {
        self.get(id).is_some()
    }
}

/// In-memory node database, for tests and embedders that manage their own
/// persistence
#[derive(Default)]
pub struct MemNodeDb {
    contacts: RwLock<HashMap<RouterId, RouterContact>>,
}

impl MemNodeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }
}

impl NodeDb for MemNodeDb {
    fn get(&self, id: &RouterId) -> Option<RouterContact> {
        self.contacts.read().get(id).cloned()
    }

    fn select_random_excluding(&self, exclude: &HashSet<RouterId>) -> Option<RouterContact> {
        let contacts = self.contacts.read();
        let candidates: Vec<&RouterContact> = contacts
            .values()
            .filter(|rc| !exclude.contains(&rc.router_id))
            .collect();
        candidates.choose(&mut OsRng).map(|rc| (*rc).clone())
    }

    fn store(&self, rc: RouterContact) {
        self.contacts.write().insert(rc.router_id, rc);
    }
}

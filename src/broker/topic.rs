//! Topic subscriber sets
//!
//! A `Topic` holds the ids of the connections subscribed to one topic name.
//! Topics are exact-match only and are never deleted once created; an empty
//! subscriber set is a normal steady state.
//!
//! Callers synchronize access through the registry lock.

use std::collections::HashSet;

use crate::transport::ConnectionId;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<ConnectionId>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Adds a subscriber. Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, id: ConnectionId) -> bool {
        self.subscribers.insert(id)
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, id: &ConnectionId) -> bool {
        self.subscribers.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

//! Topic registry
//!
//! Two indexes kept consistent with each other:
//! - forward: topic name -> [`Topic`] (subscriber ids), used for fan-out
//! - reverse: connection id -> handle plus the topics it subscribed to, used to
//!   clean up a connection in O(its subscriptions)
//!
//! A connection id is in `topics[t]` exactly when `t` is in that connection's
//! reverse entry. Both indexes only change through the methods below, and the
//! broker only calls them while holding the single [`SharedRegistry`] lock, which
//! also covers the fan-out sends in [`Registry::publish`]. A subscribe that
//! returned before a publish took the lock is therefore always part of that
//! publish's fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::broker::topic::Topic;
use crate::transport::{ConnectionHandle, ConnectionId};

#[derive(Debug)]
struct Subscriber {
    handle: ConnectionHandle,
    topics: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    topics: HashMap<String, Topic>,
    clients: HashMap<ConnectionId, Subscriber>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handle` to `topic`, creating the topic on first use.
    ///
    /// Returns `false` (and changes nothing) for an empty topic name. Repeating
    /// a subscription is a successful no-op.
    pub fn subscribe(&mut self, handle: &ConnectionHandle, topic: &str) -> bool {
        if topic.is_empty() {
            warn!(peer = %handle.peer(), conn = %handle.id(), "rejecting subscription without a topic");
            return false;
        }

        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        let added = entry.subscribe(handle.id());
        let subscriber_count = entry.subscribers.len();

        self.clients
            .entry(handle.id())
            .or_insert_with(|| Subscriber {
                handle: handle.clone(),
                topics: HashSet::new(),
            })
            .topics
            .insert(topic.to_string());

        if added {
            info!(peer = %handle.peer(), topic, subscribers = subscriber_count, "subscribed");
        } else {
            debug!(peer = %handle.peer(), topic, "already subscribed");
        }
        true
    }

    /// Forwards `frame` unchanged to every current subscriber of `topic`.
    ///
    /// A subscriber whose send fails is removed after the loop; delivery to
    /// the others is not interrupted. Returns the number of successful sends.
    pub fn publish(&mut self, topic: &str, frame: &Bytes) -> usize {
        let Some(entry) = self.topics.get(topic) else {
            debug!(topic, "publish to a topic nobody subscribed to");
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in &entry.subscribers {
            let Some(subscriber) = self.clients.get(id) else {
                error!(conn = %id, topic, "subscriber missing from reverse index");
                continue;
            };
            match subscriber.handle.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(peer = %subscriber.handle.peer(), topic, %error, "dropping unreachable subscriber");
                    dead.push(subscriber.handle.clone());
                }
            }
        }

        for handle in &dead {
            self.remove_connection(handle);
        }

        debug!(topic, delivered, dropped = dead.len(), "fan-out complete");
        delivered
    }

    /// Removes `handle` from every topic it subscribed to and closes it.
    ///
    /// Returns `false` if the registry held no subscriptions for it. Calling it
    /// again for the same handle is a no-op.
    pub fn remove_connection(&mut self, handle: &ConnectionHandle) -> bool {
        let removed = match self.clients.remove(&handle.id()) {
            Some(subscriber) => {
                for name in &subscriber.topics {
                    if let Some(topic) = self.topics.get_mut(name) {
                        topic.unsubscribe(&handle.id());
                    }
                }
                debug!(peer = %handle.peer(), topics = subscriber.topics.len(), "connection unregistered");
                true
            }
            None => false,
        };
        handle.close();
        removed
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, id: &ConnectionId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .clients
            .get(id)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Checks that the forward and reverse indexes agree.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.topics.iter().all(|(name, topic)| {
            topic.subscribers.iter().all(|id| {
                self.clients
                    .get(id)
                    .is_some_and(|s| s.topics.contains(name))
            })
        });
        let reverse_ok = self.clients.iter().all(|(id, subscriber)| {
            subscriber.handle.id() == *id
                && subscriber.topics.iter().all(|name| {
                    self.topics
                        .get(name)
                        .is_some_and(|t| t.subscribers.contains(id))
                })
        });
        forward_ok && reverse_ok
    }
}

/// The registry behind its single lock, shared by every connection task.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry(Arc<Mutex<Registry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the registry. Every registry method leaves both indexes
    /// consistent, so a poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

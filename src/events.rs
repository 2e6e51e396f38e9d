//! Discovery event fan-out.
//!
//! The only event the service publishes is [`PeerBondedEvent`], emitted the
//! first time a peer transitions to bonded within a session. Subscribers are
//! plain callbacks; each delivery runs on the blocking pool so a slow
//! subscriber never stalls the controller loop. Delivery order across
//! subscribers is unspecified.

use std::collections::HashMap;
use std::sync::Arc;

use crate::peer::DiscoveryPeer;

/// A peer completed the bonding handshake.
#[derive(Clone, Debug)]
pub struct PeerBondedEvent {
    pub peer: DiscoveryPeer,
    /// Milliseconds since Unix epoch at which the bond was established.
    pub timestamp: u64,
}

pub type PeerBondedCallback = Arc<dyn Fn(PeerBondedEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    entries: HashMap<u64, PeerBondedCallback>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: PeerBondedCallback) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, callback);
        SubscriptionId(id)
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    /// Deliver `event` to every subscriber, each on its own blocking-pool
    /// task. Callbacks may block without affecting the caller.
    pub fn notify(&self, event: PeerBondedEvent) {
        for callback in self.entries.values() {
            let callback = callback.clone();
            let event = event.clone();
            tokio::task::spawn_blocking(move || callback(event));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

use std::collections::HashMap;
use std::hash::Hash;

use dashmap::DashMap;
use tokio::sync::mpsc;

use beacon_core::ids::ConnectionId;

/// Subscriber sets and publisher slots for one channel topology.
///
/// `C` is the channel key viewers join on (a location id, or a fleet id);
/// `P` is the publisher key: the location id again, or a vehicle id (a
/// fleet channel has one publisher slot per vehicle, all fanning into the
/// same viewer set).
///
/// The registry holds connection handles only, never record content; the
/// entity store stays the single source of truth.
pub struct ChannelRegistry<C, P = C>
where
    C: Eq + Hash + Clone,
    P: Eq + Hash + Clone,
{
    subscribers: DashMap<C, HashMap<ConnectionId, mpsc::Sender<String>>>,
    publishers: DashMap<P, ConnectionId>,
}

impl<C, P> ChannelRegistry<C, P>
where
    C: Eq + Hash + Clone,
    P: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            publishers: DashMap::new(),
        }
    }

    /// Add a viewer connection to a channel.
    pub fn subscribe(&self, channel: &C, conn_id: ConnectionId, tx: mpsc::Sender<String>) {
        self.subscribers
            .entry(channel.clone())
            .or_default()
            .insert(conn_id, tx);
    }

    /// Remove a viewer; prunes the channel entry once the set is empty.
    /// Pruning has no durable effect; the store still holds the record.
    pub fn unsubscribe(&self, channel: &C, conn_id: &ConnectionId) {
        if let Some(mut entry) = self.subscribers.get_mut(channel) {
            entry.remove(conn_id);
            if entry.is_empty() {
                drop(entry);
                self.subscribers
                    .remove_if(channel, |_, subs| subs.is_empty());
            }
        }
    }

    /// Claim the publisher slot for a key. Last registration wins; the
    /// superseded connection id is returned so callers can log it. The old
    /// transport is not closed here; its updates simply stop being
    /// authoritative.
    pub fn register_publisher(&self, key: &P, conn_id: ConnectionId) -> Option<ConnectionId> {
        self.publishers
            .insert(key.clone(), conn_id.clone())
            .filter(|prev| *prev != conn_id)
    }

    /// True if this connection currently holds the publisher slot.
    pub fn is_publisher(&self, key: &P, conn_id: &ConnectionId) -> bool {
        self.publishers
            .get(key)
            .map(|current| *current == *conn_id)
            .unwrap_or(false)
    }

    /// Release the slot, but only if the caller still holds it. A
    /// superseded publisher disconnecting must not evict its successor.
    pub fn unregister_publisher(&self, key: &P, conn_id: &ConnectionId) -> bool {
        self.publishers
            .remove_if(key, |_, current| *current == *conn_id)
            .is_some()
    }

    /// Fan a frame out to every subscriber on the channel. Slow or closed
    /// subscribers are skipped via `try_send`; one stalled viewer must not
    /// delay the rest. Returns the number of queues the frame reached.
    pub fn broadcast(&self, channel: &C, message: &str) -> usize {
        let Some(subs) = self.subscribers.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for tx in subs.values() {
            match tx.try_send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Subscriber queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, channel: &C) -> usize {
        self.subscribers
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl<C, P> Default for ChannelRegistry<C, P>
where
    C: Eq + Hash + Clone,
    P: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

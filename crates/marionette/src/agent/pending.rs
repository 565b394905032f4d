//! Pending-operation table.
//!
//! Owned by the agent and touched only from `tick`. An entry exists exactly
//! while its request is unanswered: the agent removes it in the same step that
//! sends the response, and every deferred trigger looks its key up first.

use std::collections::HashMap;
use std::time::Instant;

use super::ops::Operation;
use crate::bridge::protocol::RequestId;
use crate::host::SubscriptionId;
use crate::transport::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub connection: ConnectionId,
    pub request: RequestId,
}

impl PendingKey {
    pub fn new(connection: ConnectionId, request: RequestId) -> Self {
        Self {
            connection,
            request,
        }
    }
}

#[derive(Debug)]
pub struct PendingOperation {
    pub method: &'static str,
    pub operation: Operation,
    pub started_at: Instant,
    /// Next time `resume` should run.
    pub wake_at: Instant,
    /// Registration order; breaks ties between equal wake times.
    seq: u64,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<PendingKey, PendingOperation>,
    by_subscription: HashMap<SubscriptionId, PendingKey>,
    next_seq: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        key: PendingKey,
        method: &'static str,
        operation: Operation,
        started_at: Instant,
        wake_at: Instant,
    ) {
        if let Some(subscription) = operation.subscription() {
            self.by_subscription.insert(subscription, key.clone());
        }
        self.next_seq += 1;
        self.entries.insert(
            key,
            PendingOperation {
                method,
                operation,
                started_at,
                wake_at,
                seq: self.next_seq,
            },
        );
    }

    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &PendingKey) -> Option<&mut PendingOperation> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &PendingKey) -> Option<PendingOperation> {
        let entry = self.entries.remove(key)?;
        if let Some(subscription) = entry.operation.subscription() {
            self.by_subscription.remove(&subscription);
        }
        Some(entry)
    }

    pub fn key_for_subscription(&self, subscription: SubscriptionId) -> Option<&PendingKey> {
        self.by_subscription.get(&subscription)
    }

    /// Keys whose wake time has arrived, earliest first.
    pub fn due(&self, now: Instant) -> Vec<PendingKey> {
        let mut due: Vec<(&PendingKey, &PendingOperation)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.wake_at <= now)
            .collect();
        due.sort_by_key(|(_, entry)| (entry.wake_at, entry.seq));
        due.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Remove every entry owned by `connection`, in registration order.
    pub fn drain_connection(&mut self, connection: ConnectionId) -> Vec<(PendingKey, PendingOperation)> {
        let keys: Vec<PendingKey> = self
            .entries
            .keys()
            .filter(|key| key.connection == connection)
            .cloned()
            .collect();
        let mut drained: Vec<(PendingKey, PendingOperation)> = keys
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|entry| (key, entry)))
            .collect();
        drained.sort_by_key(|(_, entry)| entry.seq);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! # Message Broker
//!
//! Defines the broker port used by the delivery core and its in-memory
//! implementation.

use crate::commit_cache::TimeBoundedCommitCache;
use crate::error::BusError;
use crate::fault::{BrokerOperation, FailureMode, FaultInjector};
use crate::message::{
    ClientIdentity, ConnectionId, Delivery, DeliveryTag, Message, SubscriptionKey,
    TransactionBatch,
};
use crate::subscriber::{DurableSubscription, Recovered};
use crate::{
    DEFAULT_COMMIT_DEDUP_WINDOW_SECS, DEFAULT_DEAD_LETTER_SUFFIX, DEFAULT_MAX_REDELIVERIES,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broker-side policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_redeliveries: u32,
    /// Suffix forming the dead-letter destination of a topic.
    pub dead_letter_suffix: String,
    /// How long applied transaction ids are remembered.
    pub commit_dedup_window_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            dead_letter_suffix: DEFAULT_DEAD_LETTER_SUFFIX.to_string(),
            commit_dedup_window_secs: DEFAULT_COMMIT_DEDUP_WINDOW_SECS,
        }
    }
}

/// What a rollback did with the deliveries it returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverReport {
    pub redelivered: usize,
    pub dead_lettered: usize,
}

/// Broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub published: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub dead_lettered: u64,
}

/// Port to a message broker.
///
/// Every call except `disconnect` and `is_connected` is a broker round-trip
/// and may fail with `BusError::Unavailable`, after which the connection is
/// no longer usable.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Open a connection bound to `client_id`.
    ///
    /// Fails with `BusError::ClientIdInUse` if another live connection holds the identity.
    async fn connect(&self, client_id: &ClientIdentity) -> Result<ConnectionId, BusError>;

    /// Close a connection. Closing an unknown connection is a no-op.
    fn disconnect(&self, connection: ConnectionId);

    fn is_connected(&self, connection: ConnectionId) -> bool;

    /// Create the durable subscription `name` on `topic` for the connection's
    /// client identity, or return the existing one.
    async fn subscribe_durable(
        &self,
        connection: ConnectionId,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionKey, BusError>;

    /// Remove a durable subscription and discard its queued messages.
    async fn unsubscribe(&self, connection: ConnectionId, name: &str) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next message on a subscription.
    async fn receive(
        &self,
        connection: ConnectionId,
        subscription: &SubscriptionKey,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BusError>;

    /// Atomically publish the batch's sends and acknowledge its deliveries.
    async fn commit(
        &self,
        connection: ConnectionId,
        batch: &TransactionBatch,
    ) -> Result<(), BusError>;

    /// Return the batch's deliveries to their subscriptions.
    async fn rollback(
        &self,
        connection: ConnectionId,
        batch: &TransactionBatch,
    ) -> Result<RecoverReport, BusError>;

    /// Whether the transaction `transaction` was applied by an earlier commit.
    ///
    /// Answers from the broker's de-duplication window, so it resolves a
    /// commit whose reply was lost as long as it is asked within that window.
    async fn transaction_applied(
        &self,
        connection: ConnectionId,
        transaction: Uuid,
    ) -> Result<bool, BusError>;
}

struct BrokerState {
    connections: HashMap<ConnectionId, ClientIdentity>,
    subscriptions: HashMap<SubscriptionKey, DurableSubscription>,
    dead_letters: BTreeMap<String, Vec<Message>>,
    applied: TimeBoundedCommitCache,
    next_connection: u64,
    next_tag: u64,
    stats: BrokerStats,
}

impl BrokerState {
    fn client_of(&self, connection: ConnectionId) -> Result<ClientIdentity, BusError> {
        self.connections
            .get(&connection)
            .cloned()
            .ok_or(BusError::ConnectionClosed(connection))
    }

    fn publish(&mut self, topic: &str, message: &Message) {
        self.stats.published += 1;
        let mut receivers = 0usize;
        for subscription in self
            .subscriptions
            .values_mut()
            .filter(|s| s.key().topic == topic)
        {
            subscription.enqueue(message.clone());
            receivers += 1;
        }
        if receivers == 0 {
            debug!(topic = topic, message_id = %message.id(), "Message dropped (no durable subscriptions)");
        } else {
            debug!(topic = topic, message_id = %message.id(), receivers, "Message published");
        }
    }
}

/// In-memory broker.
///
/// Suitable for a single process; a networked broker would implement
/// [`MessageBroker`] over its own client library.
pub struct InMemoryBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    faults: FaultInjector,
}

impl InMemoryBroker {
    /// Create a broker with default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        let applied = TimeBoundedCommitCache::with_config(
            config.commit_dedup_window_secs,
            TimeBoundedCommitCache::DEFAULT_GC_INTERVAL,
        );
        Self {
            config,
            state: Mutex::new(BrokerState {
                connections: HashMap::new(),
                subscriptions: HashMap::new(),
                dead_letters: BTreeMap::new(),
                applied,
                next_connection: 0,
                next_tag: 0,
                stats: BrokerStats::default(),
            }),
            faults: FaultInjector::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Scripted transport failures.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Dead-letter destination for a topic.
    #[must_use]
    pub fn dead_letter_destination(&self, topic: &str) -> String {
        format!("{}{}", topic, self.config.dead_letter_suffix)
    }

    /// Messages dead-lettered from `topic`.
    #[must_use]
    pub fn dead_letters(&self, topic: &str) -> Vec<Message> {
        let destination = self.dead_letter_destination(topic);
        self.state
            .lock()
            .dead_letters
            .get(&destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages waiting on a subscription, if it exists.
    #[must_use]
    pub fn pending(&self, subscription: &SubscriptionKey) -> Option<usize> {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map(DurableSubscription::pending)
    }

    /// Unacknowledged deliveries on a subscription, if it exists.
    #[must_use]
    pub fn in_flight(&self, subscription: &SubscriptionKey) -> Option<usize> {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map(DurableSubscription::in_flight)
    }

    /// Whether a live connection holds `client_id`.
    #[must_use]
    pub fn is_bound(&self, client_id: &ClientIdentity) -> bool {
        self.state
            .lock()
            .connections
            .values()
            .any(|bound| bound == client_id)
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            connections: state.connections.len(),
            subscriptions: state.subscriptions.len(),
            ..state.stats
        }
    }

    /// Drop a connection as a transport failure would.
    fn sever(&self, connection: ConnectionId, operation: BrokerOperation) -> BusError {
        let client = self.state.lock().connections.remove(&connection);
        warn!(
            connection = %connection,
            client_id = client.as_ref().map(ClientIdentity::as_str),
            operation = ?operation,
            "Connection severed"
        );
        BusError::Unavailable(format!("{connection} lost during {operation:?}"))
    }

    fn apply_commit(
        &self,
        connection: ConnectionId,
        batch: &TransactionBatch,
    ) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.client_of(connection)?;

        if state.applied.contains(&batch.id) {
            debug!(transaction = %batch.id, "Transaction already applied, commit acknowledged");
            return Ok(());
        }

        // Validate every acknowledgement before applying any part of the batch.
        for (key, tag) in &batch.acks {
            let subscription = state.subscriptions.get(key).ok_or_else(|| {
                BusError::UnknownSubscription {
                    name: key.name.clone(),
                    client_id: key.client_id.to_string(),
                }
            })?;
            if !subscription.is_in_flight(*tag) {
                return Err(BusError::UnknownDelivery(*tag));
            }
        }

        for (key, tag) in &batch.acks {
            if let Some(subscription) = state.subscriptions.get_mut(key) {
                subscription.acknowledge(*tag)?;
            }
        }
        for (topic, message) in &batch.sends {
            state.publish(topic, message);
        }
        state.applied.insert(batch.id);
        state.stats.commits += 1;

        debug!(
            transaction = %batch.id,
            sends = batch.sends.len(),
            acks = batch.acks.len(),
            "Transaction committed"
        );
        Ok(())
    }

    fn apply_rollback(
        &self,
        connection: ConnectionId,
        batch: &TransactionBatch,
    ) -> Result<RecoverReport, BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.client_of(connection)?;

        let mut by_subscription: HashMap<&SubscriptionKey, Vec<DeliveryTag>> = HashMap::new();
        for (key, tag) in &batch.acks {
            by_subscription.entry(key).or_default().push(*tag);
        }

        let mut report = RecoverReport::default();
        for (key, tags) in by_subscription {
            let Some(subscription) = state.subscriptions.get_mut(key) else {
                continue;
            };
            for outcome in subscription.recover(&tags, self.config.max_redeliveries) {
                match outcome {
                    Recovered::Requeued { redelivery_count } => {
                        debug!(subscription = %key, redelivery_count, "Delivery returned for redelivery");
                        report.redelivered += 1;
                    }
                    Recovered::DeadLettered(message) => {
                        let destination =
                            format!("{}{}", key.topic, self.config.dead_letter_suffix);
                        warn!(
                            subscription = %key,
                            message_id = %message.id(),
                            destination = %destination,
                            "Redelivery limit reached, message dead-lettered"
                        );
                        state.dead_letters.entry(destination).or_default().push(message);
                        state.stats.dead_lettered += 1;
                        report.dead_lettered += 1;
                    }
                }
            }
        }
        state.stats.rollbacks += 1;
        Ok(report)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn connect(&self, client_id: &ClientIdentity) -> Result<ConnectionId, BusError> {
        if self.faults.take(BrokerOperation::Connect).is_some() {
            return Err(BusError::Unavailable(format!(
                "connect refused for {client_id}"
            )));
        }

        let mut state = self.state.lock();
        if state.connections.values().any(|bound| bound == client_id) {
            return Err(BusError::ClientIdInUse(client_id.to_string()));
        }
        state.next_connection += 1;
        let connection = ConnectionId(state.next_connection);
        state.connections.insert(connection, client_id.clone());

        debug!(connection = %connection, client_id = %client_id, "Connection opened");
        Ok(connection)
    }

    fn disconnect(&self, connection: ConnectionId) {
        if let Some(client_id) = self.state.lock().connections.remove(&connection) {
            debug!(connection = %connection, client_id = %client_id, "Connection closed");
        }
    }

    fn is_connected(&self, connection: ConnectionId) -> bool {
        self.state.lock().connections.contains_key(&connection)
    }

    async fn subscribe_durable(
        &self,
        connection: ConnectionId,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionKey, BusError> {
        let mut state = self.state.lock();
        let client_id = state.client_of(connection)?;

        if let Some(existing) = state
            .subscriptions
            .keys()
            .find(|k| k.name == name && k.client_id == client_id)
        {
            if existing.topic != topic {
                return Err(BusError::SubscriptionTopicMismatch {
                    name: name.to_string(),
                    existing: existing.topic.clone(),
                    requested: topic.to_string(),
                });
            }
            debug!(subscription = %existing, "Durable subscription already exists");
            return Ok(existing.clone());
        }

        let key = SubscriptionKey {
            topic: topic.to_string(),
            name: name.to_string(),
            client_id,
        };
        state
            .subscriptions
            .insert(key.clone(), DurableSubscription::new(key.clone()));

        info!(subscription = %key, "Durable subscription created");
        Ok(key)
    }

    async fn unsubscribe(&self, connection: ConnectionId, name: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        let client_id = state.client_of(connection)?;

        let key = state
            .subscriptions
            .keys()
            .find(|k| k.name == name && k.client_id == client_id)
            .cloned()
            .ok_or_else(|| BusError::UnknownSubscription {
                name: name.to_string(),
                client_id: client_id.to_string(),
            })?;

        let in_flight = state
            .subscriptions
            .get(&key)
            .map_or(0, DurableSubscription::in_flight);
        if in_flight > 0 {
            return Err(BusError::SubscriptionInUse {
                name: name.to_string(),
                in_flight,
            });
        }

        if let Some(removed) = state.subscriptions.remove(&key) {
            info!(subscription = %key, discarded = removed.pending(), "Durable subscription removed");
        }
        Ok(())
    }

    async fn receive(
        &self,
        connection: ConnectionId,
        subscription: &SubscriptionKey,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BusError> {
        if self.faults.take(BrokerOperation::Receive).is_some() {
            return Err(self.sever(connection, BrokerOperation::Receive));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let client_id = state.client_of(connection)?;
                if client_id != subscription.client_id {
                    return Err(BusError::UnknownSubscription {
                        name: subscription.name.clone(),
                        client_id: client_id.to_string(),
                    });
                }
                let queue = state.subscriptions.get_mut(subscription).ok_or_else(|| {
                    BusError::UnknownSubscription {
                        name: subscription.name.clone(),
                        client_id: client_id.to_string(),
                    }
                })?;

                let tag = DeliveryTag(state.next_tag + 1);
                if let Some(delivery) = queue.next_delivery(tag) {
                    state.next_tag += 1;
                    return Ok(Some(delivery));
                }
                queue.notifier()
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(
        &self,
        connection: ConnectionId,
        batch: &TransactionBatch,
    ) -> Result<(), BusError> {
        let fault = self.faults.take(BrokerOperation::Commit);
        if fault == Some(FailureMode::BeforeApply) {
            return Err(self.sever(connection, BrokerOperation::Commit));
        }

        self.apply_commit(connection, batch)?;

        if fault == Some(FailureMode::AfterApply) {
            return Err(self.sever(connection, BrokerOperation::Commit));
        }
        Ok(())
    }

    async fn rollback(
        &self,
        connection: ConnectionId,
        batch: &TransactionBatch,
    ) -> Result<RecoverReport, BusError> {
        let fault = self.faults.take(BrokerOperation::Rollback);
        if fault == Some(FailureMode::BeforeApply) {
            return Err(self.sever(connection, BrokerOperation::Rollback));
        }

        let report = self.apply_rollback(connection, batch)?;

        if fault == Some(FailureMode::AfterApply) {
            return Err(self.sever(connection, BrokerOperation::Rollback));
        }
        Ok(report)
    }

    async fn transaction_applied(
        &self,
        connection: ConnectionId,
        transaction: Uuid,
    ) -> Result<bool, BusError> {
        if self.faults.take(BrokerOperation::Status).is_some() {
            return Err(self.sever(connection, BrokerOperation::Status));
        }

        let state = self.state.lock();
        state.client_of(connection)?;
        let applied = state.applied.contains(&transaction);
        debug!(transaction = %transaction, applied, "Transaction outcome queried");
        Ok(applied)
    }
}

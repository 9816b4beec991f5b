//! # Transacted Session
//!
//! Groups sends and acknowledgements into one unit of work.
//!
//! ```text
//! [Active] ──commit ok──────────────────→ [Committed]
//!    │  ├──reply lost, broker has it──→ [Committed]
//!    │  └──commit failed──────────────→ [RolledBack]   (deliveries returned best-effort)
//!    └────rollback────────────────────→ [RolledBack]
//! ```
//!
//! Nothing staged in a session is visible at the broker until `commit`
//! succeeds, and `commit` applies all of it or none of it. The batch id is
//! the session id, so a commit retried after an ambiguous transport failure
//! is applied once. When every attempt fails in transport the broker is asked
//! whether the batch id was applied before the session is declared rolled
//! back; if it cannot answer, `commit` fails with `CommitOutcomeUnknown`.

use crate::domain::{DeliveryError, TransactionState};
use crate::service::pool::{ConnectionResource, PooledConnection};
use futures::future::BoxFuture;
use shared_bus::{
    BusError, ClientIdentity, ConnectionId, Delivery, DeliveryTag, Message, MessageBroker,
    RecoverReport, SubscriptionKey, TransactionBatch,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work staged in a session, in the order it was staged.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOperation {
    Send { topic: String, message: Message },
    Acknowledge {
        subscription: SubscriptionKey,
        tag: DeliveryTag,
    },
}

/// A unit of work on one pooled connection.
pub struct Session {
    id: Uuid,
    resource: ConnectionResource,
    connection: Option<PooledConnection>,
    /// Named identity to reconnect with after a transport failure.
    identity: Option<ClientIdentity>,
    state: TransactionState,
    pending: Vec<PendingOperation>,
}

impl Session {
    pub(crate) fn new(resource: ConnectionResource, connection: PooledConnection) -> Self {
        let identity = connection
            .is_named()
            .then(|| connection.client_identity().clone());
        let id = Uuid::new_v4();
        debug!(session = %id, connection = %connection.id(), "Session started");
        Self {
            id,
            resource,
            connection: Some(connection),
            identity,
            state: TransactionState::Active,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Connection currently held, if any. Released once the session ends.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(PooledConnection::id)
    }

    #[must_use]
    pub fn pending(&self) -> &[PendingOperation] {
        &self.pending
    }

    /// Stage `message` for publication on `topic`.
    pub fn send(
        &mut self,
        topic: impl Into<String>,
        message: Message,
    ) -> Result<(), DeliveryError> {
        self.ensure_active()?;
        let topic = topic.into();
        debug!(session = %self.id, topic = %topic, message_id = %message.id(), "Send staged");
        self.pending.push(PendingOperation::Send { topic, message });
        Ok(())
    }

    /// Take the next message from `subscription`, waiting up to `timeout`.
    ///
    /// The delivery stays in flight until the session commits (acknowledged)
    /// or rolls back (redelivered).
    pub async fn receive(
        &mut self,
        subscription: &SubscriptionKey,
        timeout: Duration,
    ) -> Result<Option<Delivery>, DeliveryError> {
        self.ensure_active()?;
        let key = subscription.clone();
        let delivery = self
            .call_with_retry("receive", move |broker, connection| {
                let key = key.clone();
                Box::pin(async move { broker.receive(connection, &key, timeout).await })
            })
            .await?;

        if let Some(delivery) = &delivery {
            debug!(
                session = %self.id,
                subscription = %delivery.subscription,
                tag = %delivery.tag,
                redelivery_count = delivery.redelivery_count,
                "Message received"
            );
            self.pending.push(PendingOperation::Acknowledge {
                subscription: delivery.subscription.clone(),
                tag: delivery.tag,
            });
        }
        Ok(delivery)
    }

    /// Create or reattach the durable subscription `name` on `topic` for
    /// this session's client identity. Not part of the unit of work.
    pub async fn subscribe_durable(
        &mut self,
        topic: &str,
        name: &str,
    ) -> Result<SubscriptionKey, DeliveryError> {
        self.ensure_active()?;
        let (topic, name) = (topic.to_string(), name.to_string());
        self.call_with_retry("subscribe", move |broker, connection| {
            let (topic, name) = (topic.clone(), name.clone());
            Box::pin(async move { broker.subscribe_durable(connection, &topic, &name).await })
        })
        .await
    }

    /// Remove the durable subscription `name`. Not part of the unit of work.
    pub async fn unsubscribe(&mut self, name: &str) -> Result<(), DeliveryError> {
        self.ensure_active()?;
        let name = name.to_string();
        self.call_with_retry("unsubscribe", move |broker, connection| {
            let name = name.clone();
            Box::pin(async move { broker.unsubscribe(connection, &name).await })
        })
        .await
    }

    /// Make every staged send visible and every staged receive acknowledged.
    ///
    /// On failure the session ends rolled back and its deliveries are
    /// returned for redelivery. A commit the broker applied but whose reply
    /// never arrived still ends `Committed` and returns `Ok`.
    pub async fn commit(&mut self) -> Result<(), DeliveryError> {
        self.ensure_active()?;

        if self.pending.is_empty() {
            self.finish(TransactionState::Committed);
            return Ok(());
        }

        let batch = self.take_batch();
        let shared = batch.clone();
        let result = self
            .call_with_retry("commit", move |broker, connection| {
                let batch = shared.clone();
                Box::pin(async move { broker.commit(connection, &batch).await })
            })
            .await;

        match result {
            Ok(()) => {
                info!(
                    session = %self.id,
                    sends = batch.sends.len(),
                    acks = batch.acks.len(),
                    "Session committed"
                );
                self.finish(TransactionState::Committed);
                Ok(())
            }
            Err(err @ DeliveryError::BrokerUnavailable { .. }) => {
                self.resolve_lost_commit(batch, err).await
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "Commit failed, rolling back");
                self.return_deliveries(batch).await;
                self.finish(TransactionState::RolledBack);
                Err(err)
            }
        }
    }

    /// Settle a commit whose every attempt failed in transport. Any of them
    /// may have been applied before its reply was lost.
    async fn resolve_lost_commit(
        &mut self,
        batch: TransactionBatch,
        err: DeliveryError,
    ) -> Result<(), DeliveryError> {
        let transaction = batch.id;
        let applied = self
            .call_with_retry("status", move |broker, connection| {
                Box::pin(async move { broker.transaction_applied(connection, transaction).await })
            })
            .await;

        match applied {
            Ok(true) => {
                info!(
                    session = %self.id,
                    sends = batch.sends.len(),
                    acks = batch.acks.len(),
                    "Session committed, confirmed after lost reply"
                );
                self.finish(TransactionState::Committed);
                Ok(())
            }
            Ok(false) => {
                warn!(session = %self.id, error = %err, "Commit failed, rolling back");
                self.return_deliveries(batch).await;
                self.finish(TransactionState::RolledBack);
                Err(err)
            }
            Err(status_err) => {
                warn!(
                    session = %self.id,
                    error = %err,
                    status_error = %status_err,
                    "Commit outcome unknown"
                );
                // Recovery skips deliveries an applied commit already acknowledged.
                self.return_deliveries(batch).await;
                self.finish(TransactionState::RolledBack);
                Err(DeliveryError::CommitOutcomeUnknown {
                    session: self.id,
                    reason: status_err.to_string(),
                })
            }
        }
    }

    async fn return_deliveries(&mut self, batch: TransactionBatch) {
        if batch.acks.is_empty() {
            return;
        }
        if let Err(err) = self.recover(batch).await {
            warn!(session = %self.id, error = %err, "Recovery after failed commit failed");
        }
    }

    /// Discard staged sends and return received messages for redelivery.
    pub async fn rollback(&mut self) -> Result<RecoverReport, DeliveryError> {
        self.ensure_active()?;

        let batch = self.take_batch();
        let result = if batch.acks.is_empty() {
            Ok(RecoverReport::default())
        } else {
            self.recover(batch).await
        };
        self.finish(TransactionState::RolledBack);

        let report = result?;
        info!(
            session = %self.id,
            redelivered = report.redelivered,
            dead_lettered = report.dead_lettered,
            "Session rolled back"
        );
        Ok(report)
    }

    async fn recover(&mut self, batch: TransactionBatch) -> Result<RecoverReport, DeliveryError> {
        self.call_with_retry("rollback", move |broker, connection| {
            let batch = batch.clone();
            Box::pin(async move { broker.rollback(connection, &batch).await })
        })
        .await
    }

    fn ensure_active(&self) -> Result<(), DeliveryError> {
        if self.state.is_terminal() {
            return Err(DeliveryError::SessionClosed { state: self.state });
        }
        Ok(())
    }

    fn take_batch(&mut self) -> TransactionBatch {
        let mut batch = TransactionBatch::new(self.id);
        for operation in self.pending.drain(..) {
            match operation {
                PendingOperation::Send { topic, message } => batch.sends.push((topic, message)),
                PendingOperation::Acknowledge { subscription, tag } => {
                    batch.acks.push((subscription, tag));
                }
            }
        }
        batch
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.pending.clear();
        self.connection = None;
    }

    /// The held connection, reacquiring one if a transport failure dropped it.
    async fn connection(&mut self) -> Result<&PooledConnection, DeliveryError> {
        if self.connection.is_none() {
            let connection = match &self.identity {
                Some(identity) => self.resource.acquire_with_identity(identity.clone()).await?,
                None => self.resource.acquire().await?,
            };
            debug!(session = %self.id, connection = %connection.id(), "Session reconnected");
            self.connection = Some(connection);
        }
        self.connection
            .as_ref()
            .ok_or(DeliveryError::PoolClosed)
    }

    /// Run a broker call, replacing the connection and retrying on transport
    /// failure up to the pool's retry policy.
    async fn call_with_retry<T, F>(
        &mut self,
        operation: &'static str,
        call: F,
    ) -> Result<T, DeliveryError>
    where
        F: Fn(Arc<dyn MessageBroker>, ConnectionId) -> BoxFuture<'static, Result<T, BusError>>,
    {
        let retry = self.resource.retry_policy().clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (broker, connection) = {
                let held = self.connection().await?;
                (held.broker(), held.id())
            };

            match call(broker, connection).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if let Some(mut broken) = self.connection.take() {
                        broken.mark_broken();
                    }
                    if attempt >= retry.max_attempts {
                        warn!(
                            session = %self.id,
                            operation,
                            attempts = attempt,
                            error = %err,
                            "Broker unavailable, giving up"
                        );
                        return Err(DeliveryError::BrokerUnavailable {
                            attempts: attempt,
                            reason: err.to_string(),
                        });
                    }
                    let delay = retry.backoff_for(attempt);
                    warn!(
                        session = %self.id,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker call failed, retrying on a new connection"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("connection", &self.connection_id())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.is_terminal() || self.pending.is_empty() {
            return;
        }

        let batch = self.take_batch();
        if batch.acks.is_empty() {
            debug!(session = %self.id, discarded = batch.sends.len(), "Uncommitted session dropped");
            return;
        }

        // Received messages must go back to their subscriptions.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                session = %self.id,
                acks = batch.acks.len(),
                "Session dropped outside a runtime, deliveries stay in flight"
            );
            return;
        };
        let resource = self.resource.clone();
        let mut held = self.connection.take();
        if let Some(connection) = held.as_mut() {
            // A checkout of the same identity waits for this connection
            // instead of failing as a duplicate.
            connection.mark_returning();
        }
        let session = self.id;
        runtime.spawn(async move {
            // Rollback is not tied to the subscriber's identity, so a lost
            // connection is replaced by an anonymous one.
            let connection = match held {
                Some(connection) => Ok(connection),
                None => resource.acquire().await,
            };
            let result = match connection {
                Ok(connection) => connection
                    .broker()
                    .rollback(connection.id(), &batch)
                    .await
                    .map_err(DeliveryError::from),
                Err(err) => Err(err),
            };
            match result {
                Ok(report) => debug!(
                    session = %session,
                    redelivered = report.redelivered,
                    "Dropped session rolled back"
                ),
                Err(err) => {
                    warn!(session = %session, error = %err, "Rollback of dropped session failed");
                }
            }
        });
    }
}

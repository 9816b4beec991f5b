//! # Transacted Consumer
//!
//! Drains a durable subscription one message per session:
//!
//! ```text
//! receive ──→ handler ──→ decide ──┬── Commit   ──→ commit ──→ sink.deliver
//!                                  └── Rollback ──→ rollback (message redelivered)
//! ```
//!
//! The sink sees a message only after its session committed, so a rolled
//! back message never reaches it.

use crate::domain::{
    decide, Decision, DeliveryConfig, DeliveryError, DeliveryOutcome, DeliveryReport, RetryPolicy,
};
use crate::ports::{DownstreamSink, MessageHandler};
use crate::service::pool::ConnectionResource;
use shared_bus::{ClientIdentity, SubscriptionKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consumer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub dead_lettered: u64,
    /// Polls that ended in an error.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    dead_lettered: AtomicU64,
    errors: AtomicU64,
}

impl ConsumerCounters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Consumer on a durable subscription.
pub struct TransactedConsumer {
    resource: ConnectionResource,
    identity: ClientIdentity,
    subscription: SubscriptionKey,
    receive_timeout: Duration,
    retry: RetryPolicy,
    handler: Arc<dyn MessageHandler>,
    sink: Arc<dyn DownstreamSink>,
    counters: Arc<ConsumerCounters>,
}

impl TransactedConsumer {
    /// Attach to (or create) the configured durable subscription.
    ///
    /// Fails with `DuplicateClientIdentity` if the configured identity is
    /// already connected.
    pub async fn subscribe(
        resource: ConnectionResource,
        config: &DeliveryConfig,
        handler: Arc<dyn MessageHandler>,
        sink: Arc<dyn DownstreamSink>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        let identity = ClientIdentity::new(config.client_identity.as_str());

        let mut session = resource.create_session_with_identity(identity.clone()).await?;
        let subscription = session
            .subscribe_durable(&config.topic, &config.subscription_name)
            .await?;
        session.commit().await?;

        info!(subscription = %subscription, "Consumer subscribed");
        Ok(Self {
            resource,
            identity,
            subscription,
            receive_timeout: config.receive_timeout(),
            retry: config.retry.clone(),
            handler,
            sink,
            counters: Arc::new(ConsumerCounters::default()),
        })
    }

    #[must_use]
    pub fn subscription(&self) -> &SubscriptionKey {
        &self.subscription
    }

    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Process at most one message. `None` when nothing arrived within the
    /// receive timeout.
    pub async fn poll_once(&self) -> Result<Option<DeliveryReport>, DeliveryError> {
        let result = self.process_next().await;
        if result.is_err() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn process_next(&self) -> Result<Option<DeliveryReport>, DeliveryError> {
        let mut session = self
            .resource
            .create_session_with_identity(self.identity.clone())
            .await?;

        let Some(delivery) = session
            .receive(&self.subscription, self.receive_timeout)
            .await?
        else {
            session.commit().await?;
            return Ok(None);
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let message_id = delivery.message.id();
        let redelivery_count = delivery.redelivery_count;

        match decide(Some(self.handler.process(&delivery.message))) {
            Decision::Commit => {
                session.commit().await?;
                self.sink.deliver(&delivery.message);
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %message_id, redelivery_count, "Message committed");
                Ok(Some(DeliveryReport {
                    message_id,
                    outcome: DeliveryOutcome::Committed,
                    redelivery_count,
                    dead_lettered: false,
                }))
            }
            Decision::Rollback => {
                let report = session.rollback().await?;
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                let dead_lettered = report.dead_lettered > 0;
                if dead_lettered {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
                info!(message_id = %message_id, redelivery_count, dead_lettered, "Message rolled back on handler fault");
                Ok(Some(DeliveryReport {
                    message_id,
                    outcome: DeliveryOutcome::RolledBack,
                    redelivery_count,
                    dead_lettered,
                }))
            }
        }
    }

    /// Run the consumer on a background task until shut down.
    ///
    /// Recoverable errors are retried with backoff; any other error stops
    /// the task and is returned from [`ConsumerHandle::shutdown`].
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let counters = Arc::clone(&self.counters);
        let subscription = self.subscription.clone();

        let task = tokio::spawn(async move {
            info!(subscription = %self.subscription, "Consumer started");
            let mut failures = 0u32;
            loop {
                // Any change, or a dropped handle, means stop.
                if !matches!(shutdown_rx.has_changed(), Ok(false)) {
                    break;
                }
                match self.poll_once().await {
                    Ok(_) => failures = 0,
                    Err(err) if err.is_recoverable() => {
                        failures = failures.saturating_add(1);
                        let delay = self.retry.backoff_for(failures);
                        warn!(
                            subscription = %self.subscription,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "Poll failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    Err(err) => {
                        error!(subscription = %self.subscription, error = %err, "Consumer stopped on error");
                        return Err(err);
                    }
                }
            }
            info!(subscription = %self.subscription, "Consumer stopped");
            Ok(self)
        });

        ConsumerHandle {
            subscription,
            shutdown: shutdown_tx,
            counters,
            task,
        }
    }

    /// Remove the durable subscription. Messages still queued on it are discarded.
    pub async fn unsubscribe(self) -> Result<(), DeliveryError> {
        let mut session = self
            .resource
            .create_session_with_identity(self.identity.clone())
            .await?;
        session.unsubscribe(&self.subscription.name).await?;
        session.commit().await?;
        info!(subscription = %self.subscription, "Consumer unsubscribed");
        Ok(())
    }
}

impl std::fmt::Debug for TransactedConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactedConsumer")
            .field("subscription", &self.subscription)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle to a consumer running on a background task.
pub struct ConsumerHandle {
    subscription: SubscriptionKey,
    shutdown: watch::Sender<bool>,
    counters: Arc<ConsumerCounters>,
    task: JoinHandle<Result<TransactedConsumer, DeliveryError>>,
}

impl ConsumerHandle {
    #[must_use]
    pub fn subscription(&self) -> &SubscriptionKey {
        &self.subscription
    }

    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Whether the task already stopped on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop after the in-progress message and hand the consumer back.
    pub async fn shutdown(self) -> Result<TransactedConsumer, DeliveryError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| DeliveryError::WorkerStopped(e.to_string()))?
    }
}

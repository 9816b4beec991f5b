//! Delivery error types.
//!
//! | Variant | Class | Caller action |
//! |---------|-------|---------------|
//! | `ResourceExhausted` | recoverable | retry with backoff |
//! | `DuplicateClientIdentity` | configuration | fix config, never retry |
//! | `SessionClosed` | programming error | none, the call is rejected |
//! | `BrokerUnavailable` | transport | already retried per `RetryPolicy` |
//! | `CommitOutcomeUnknown` | transport | reconcile, the commit may have applied |
//!
//! A handler fault is not an error: it becomes `DeliveryOutcome::RolledBack`.

use super::config::ConfigError;
use super::entities::TransactionState;
use shared_bus::BusError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Delivery error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No connection became free within the acquire timeout.
    #[error("Connection pool exhausted: {max_connections} connections in use after waiting {waited:?}")]
    ResourceExhausted {
        max_connections: usize,
        waited: Duration,
    },

    /// The client identity is already bound to a live connection.
    #[error("Client identity {0} is already in use by another connection")]
    DuplicateClientIdentity(String),

    /// Operation on a session that already committed or rolled back.
    #[error("Session is closed ({state})")]
    SessionClosed { state: TransactionState },

    /// Transport failure that outlasted the retry policy.
    #[error("Broker unavailable after {attempts} attempt(s): {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    /// A commit lost its reply and the broker could not be asked whether it
    /// was applied. Its sends may be visible and its receives acknowledged.
    #[error("Outcome of commit {session} is unknown: {reason}")]
    CommitOutcomeUnknown { session: Uuid, reason: String },

    /// The pool was shut down.
    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Non-transport broker rejection.
    #[error("Broker rejected operation: {0}")]
    Broker(BusError),

    /// The background consumer task ended abnormally.
    #[error("Consumer worker stopped: {0}")]
    WorkerStopped(String),
}

impl DeliveryError {
    /// Whether retrying later can succeed without changing anything.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::BrokerUnavailable { .. }
        )
    }
}

impl From<BusError> for DeliveryError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Unavailable(reason) => Self::BrokerUnavailable {
                attempts: 1,
                reason,
            },
            BusError::ConnectionClosed(connection) => Self::BrokerUnavailable {
                attempts: 1,
                reason: format!("{connection} is closed"),
            },
            BusError::ClientIdInUse(id) => Self::DuplicateClientIdentity(id),
            other => Self::Broker(other),
        }
    }
}

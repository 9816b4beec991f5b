//! # Delivery Configuration
//!
//! Immutable configuration handed to the pool, producer and consumer at
//! construction. There are no setters; build a new value to change anything.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_connections must be at least 1")]
    ZeroConnections,

    #[error("transacted must be true; non-transacted delivery is not supported")]
    NotTransacted,

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("retry.max_attempts must be at least 1")]
    ZeroRetryAttempts,
}

/// Retry policy for transport failures (`BrokerUnavailable`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on a single delay.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

/// Complete delivery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Pool capacity.
    pub max_connections: usize,
    /// Identity owning the durable subscription. Unique per owner.
    pub client_identity: String,
    /// Stable key of the durable subscription.
    pub subscription_name: String,
    /// Topic produced to and consumed from.
    pub topic: String,
    /// Must be true.
    pub transacted: bool,
    /// Longest wait for a free connection before `ResourceExhausted`.
    pub acquire_timeout_ms: u64,
    /// Longest wait for a message per consumer poll.
    pub receive_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            client_identity: "tx-delivery-client".to_string(),
            subscription_name: "tx-delivery".to_string(),
            topic: "tx.delivery".to_string(),
            transacted: true,
            acquire_timeout_ms: 5_000,
            receive_timeout_ms: 250,
            retry: RetryPolicy::default(),
        }
    }
}

impl DeliveryConfig {
    /// Check every field. Called by every constructor that takes a config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if !self.transacted {
            return Err(ConfigError::NotTransacted);
        }
        if self.client_identity.trim().is_empty() {
            return Err(ConfigError::EmptyField("client_identity"));
        }
        if self.subscription_name.trim().is_empty() {
            return Err(ConfigError::EmptyField("subscription_name"));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyField("topic"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        Ok(())
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

//! # Shared Bus - In-Memory Transacted Topic Broker
//!
//! The broker side of transacted delivery: topics, durable subscriptions,
//! atomic transaction commit, redelivery and dead-lettering.
//!
//! ## Delivery Model
//!
//! ```text
//! ┌──────────────┐   commit(sends)   ┌──────────────┐   receive()   ┌──────────────┐
//! │   Producer   │ ────────────────→ │    Topic     │ ────────────→ │   Durable    │
//! │   Session    │                   │              │               │ Subscription │
//! └──────────────┘                   └──────────────┘               └──────────────┘
//!                                                                     │        ↑
//!                                                      commit(acks)   │        │ rollback(acks)
//!                                                                     ↓        │
//!                                                                 [removed] [redelivered]
//!                                                                              │
//!                                                          redelivery > max ──→ {topic}.dlq
//! ```
//!
//! ## Guarantees
//!
//! - **Atomic commit:** all sends and acknowledgements of a transaction apply
//!   together or not at all.
//! - **At-most-once apply:** a transaction id is applied once; retried commits
//!   of an already-applied transaction are acknowledged without side effects.
//! - **Exclusive client identity:** a client identity can be bound to one live
//!   connection at a time.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod commit_cache;
pub mod error;
pub mod fault;
pub mod message;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use commit_cache::TimeBoundedCommitCache;
pub use error::BusError;
pub use fault::{BrokerOperation, FailureMode, FaultInjector};
pub use message::{
    ClientIdentity, ConnectionId, Delivery, DeliveryTag, HeaderValue, Message, MessageId,
    SubscriptionKey, TransactionBatch,
};
pub use publisher::{BrokerConfig, BrokerStats, InMemoryBroker, MessageBroker, RecoverReport};
pub use subscriber::DurableSubscription;

/// Redelivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 6;

/// Suffix appended to a topic name to form its dead-letter destination.
pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Seconds a committed transaction id is remembered for de-duplication.
pub const DEFAULT_COMMIT_DEDUP_WINDOW_SECS: u64 = 120;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_redeliveries() {
        assert_eq!(DEFAULT_MAX_REDELIVERIES, 6);
    }

    #[test]
    fn test_dead_letter_suffix() {
        assert_eq!(DEFAULT_DEAD_LETTER_SUFFIX, ".dlq");
    }
}

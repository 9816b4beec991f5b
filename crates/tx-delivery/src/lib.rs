//! # Transacted Delivery
//!
//! Exactly-once hand-off of messages from a topic to a downstream sink,
//! with local rollback when processing fails.
//!
//! ## Purpose
//!
//! A producer publishes to a topic inside a transacted session; a consumer
//! on a durable subscription receives each message inside its own session,
//! runs a handler, and commits or rolls back on the handler's verdict. Only
//! committed messages reach the sink.
//!
//! ## Invariants
//!
//! | Invariant | Enforcement Location |
//! |-----------|---------------------|
//! | Open connections never exceed `max_connections` | `service/pool.rs` - semaphore + idle eviction |
//! | One live connection per named client identity | `service/pool.rs` - `bound` set, broker `ClientIdInUse` |
//! | Commit is all-or-nothing | `shared-bus` - validate-then-apply in `commit` |
//! | A committed session cannot be committed or rolled back again | `service/session.rs` - `ensure_active()` |
//! | A rolled back message never reaches the sink | `service/consumer.rs` - sink called after commit only |
//! | A retried commit is applied once | `shared-bus` - commit cache keyed by session id |
//! | A commit the broker applied is never reported rolled back | `service/session.rs` - `transaction_applied` query after exhausted retries |
//!
//! ## Session State Machine
//!
//! ```text
//! [Active] ──commit (or lost reply the broker confirms)──→ [Committed]
//!    │
//!    └──── rollback / failed commit ──→ [RolledBack]
//! ```
//!
//! ## Error Handling
//!
//! | Condition | Result |
//! |-----------|--------|
//! | Pool empty past `acquire_timeout_ms` | `DeliveryError::ResourceExhausted` |
//! | Client identity already connected | `DeliveryError::DuplicateClientIdentity` |
//! | Operation on a finished session | `DeliveryError::SessionClosed` |
//! | Handler raised a fault | `DeliveryOutcome::RolledBack` (not an error) |
//! | Transport failure outlasting `RetryPolicy` | `DeliveryError::BrokerUnavailable` |
//! | Commit reply lost and the broker cannot confirm it | `DeliveryError::CommitOutcomeUnknown` |
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  adapters/ - HeaderFaultHandler, RecordingSink                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ implements ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ports/outbound.rs - MessageBroker, MessageHandler, DownstreamSink │
//! └─────────────────────────────────────────────────────────────────┘
//!                          ↑ uses ↑
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  service/ - ConnectionResource, Session, TransactedProducer,    │
//! │             TransactedConsumer                                  │
//! │  domain/  - DeliveryConfig, decide(), TransactionState, errors  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
//! let resource = ConnectionResource::new(broker, &config)?;
//! let sink = Arc::new(RecordingSink::new());
//! let consumer =
//!     TransactedConsumer::subscribe(resource.clone(), &config, handler, sink.clone()).await?;
//! let handle = consumer.spawn();
//!
//! TransactedProducer::new(resource, &config).send(Message::new("Hello")).await?;
//! ```

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::*;
pub use domain::*;
pub use ports::*;
pub use service::*;

//! Service layer.
//!
//! The pool, sessions and the producer/consumer built on them.

pub mod consumer;
pub mod pool;
pub mod producer;
pub mod session;

pub use consumer::{ConsumerHandle, ConsumerStats, TransactedConsumer};
pub use pool::{ConnectionResource, PoolStats, PooledConnection};
pub use producer::TransactedProducer;
pub use session::{PendingOperation, Session};

//! Outbound (Driven) ports for transacted delivery.
//!
//! The core calls into these; the surrounding pipeline implements them.

use crate::domain::FaultIndicator;
use shared_bus::Message;

pub use shared_bus::MessageBroker;

/// Processing step run on each message inside its session.
///
/// Called synchronously between receive and commit/rollback. It must return
/// promptly and must be idempotent or compensating for any side effect it
/// performs outside the session: a rolled-back message will be processed again.
pub trait MessageHandler: Send + Sync {
    fn process(&self, message: &Message) -> FaultIndicator;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> FaultIndicator + Send + Sync,
{
    fn process(&self, message: &Message) -> FaultIndicator {
        self(message)
    }
}

/// Final consumer of committed messages.
///
/// Receives a message only after its session committed, in commit order,
/// once per commit.
pub trait DownstreamSink: Send + Sync {
    fn deliver(&self, message: &Message);
}

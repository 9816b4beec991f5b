//! Session state and per-message outcomes.

use shared_bus::MessageId;
use std::fmt;

/// Transaction state of a session.
///
/// ```text
/// [Active] ──commit──→ [Committed]
///    │
///    └──── rollback ──→ [RolledBack]
/// ```
///
/// Both terminal states reject every further operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committed => f.write_str("committed"),
            Self::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Terminal result of one received or produced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Session committed; the message is visible downstream.
    Committed,
    /// Session rolled back; the message is not visible downstream.
    RolledBack,
}

/// What the consumer did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    pub outcome: DeliveryOutcome,
    /// Redeliveries that preceded this attempt.
    pub redelivery_count: u32,
    /// The rollback pushed the message past the broker's redelivery limit.
    pub dead_lettered: bool,
}

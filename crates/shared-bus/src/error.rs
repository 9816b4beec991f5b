//! Broker error types.

use crate::message::{ConnectionId, DeliveryTag};
use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Transport-level failure. The connection used for the call is gone and
    /// the operation may or may not have been applied.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The client identity is already bound to another live connection.
    #[error("Client identity {0} is already in use")]
    ClientIdInUse(String),

    /// The connection was closed or never existed.
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// No durable subscription with this name exists for the client.
    #[error("Unknown subscription {name} for client {client_id}")]
    UnknownSubscription { name: String, client_id: String },

    /// The subscription name is already bound to a different topic.
    #[error("Subscription {name} is bound to topic {existing}, not {requested}")]
    SubscriptionTopicMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    /// The subscription still has unacknowledged deliveries.
    #[error("Subscription {name} has {in_flight} unacknowledged deliveries")]
    SubscriptionInUse { name: String, in_flight: usize },

    /// A delivery tag was acknowledged or recovered twice, or never issued.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),
}

impl BusError {
    /// Whether the failure is a transport failure worth retrying on a fresh connection.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ConnectionClosed(_))
    }
}

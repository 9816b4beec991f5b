//! # Message Envelope
//!
//! Defines the message envelope and the identifiers that flow through the broker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique message identifier, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Immutable message envelope.
///
/// Built once by the sender with [`Message::new`] and the `with_*` builders;
/// nothing downstream of the producer can change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    body: String,
    headers: BTreeMap<String, HeaderValue>,
    /// Creation time in milliseconds since UNIX epoch.
    timestamp: u64,
}

impl Message {
    /// Create a message with a text body and no headers.
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            body: body.into(),
            headers: BTreeMap::new(),
            timestamp: now_millis(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Boolean header lookup. Missing or non-boolean headers read as `None`.
    #[must_use]
    pub fn header_bool(&self, name: &str) -> Option<bool> {
        match self.headers.get(name) {
            Some(HeaderValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, HeaderValue> {
        &self.headers
    }
}

/// Broker-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Client identity a connection is bound to.
///
/// Durable subscriptions are owned by a client identity; the broker allows
/// only one live connection per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    const ANONYMOUS_PREFIX: &'static str = "anonymous-";

    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a throwaway identity for connections that own no durable state.
    #[must_use]
    pub fn anonymous() -> Self {
        Self(format!("{}{}", Self::ANONYMOUS_PREFIX, Uuid::new_v4()))
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(Self::ANONYMOUS_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a durable subscription: `(topic, name, client identity)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub topic: String,
    pub name: String,
    pub client_id: ClientIdentity,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.client_id, self.name, self.topic)
    }
}

/// Broker-assigned tag identifying one delivery of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag-{}", self.0)
    }
}

/// A message handed to a subscriber, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub subscription: SubscriptionKey,
    pub message: Message,
    /// How many times this message was returned to the broker before this delivery.
    pub redelivery_count: u32,
}

impl Delivery {
    #[must_use]
    pub fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }
}

/// Work of one transaction, applied atomically by `commit` or undone by `rollback`.
#[derive(Debug, Clone, Default)]
pub struct TransactionBatch {
    /// Stable across retries of the same commit.
    pub id: Uuid,
    /// Messages to publish, in send order.
    pub sends: Vec<(String, Message)>,
    /// Deliveries to acknowledge on commit or recover on rollback.
    pub acks: Vec<(SubscriptionKey, DeliveryTag)>,
}

impl TransactionBatch {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            sends: Vec::new(),
            acks: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.acks.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

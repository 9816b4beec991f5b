//! # Transacted Producer
//!
//! Publishes to one topic, each send in its own session unless the caller
//! groups several with [`TransactedProducer::begin`].

use crate::domain::{decide, Decision, DeliveryConfig, DeliveryError, DeliveryOutcome};
use crate::ports::MessageHandler;
use crate::service::pool::ConnectionResource;
use crate::service::session::Session;
use shared_bus::{Message, MessageId};
use tracing::{debug, info};

/// Producer bound to a topic.
#[derive(Clone)]
pub struct TransactedProducer {
    resource: ConnectionResource,
    topic: String,
}

impl TransactedProducer {
    /// Producer for the configured topic.
    pub fn new(resource: ConnectionResource, config: &DeliveryConfig) -> Self {
        Self::for_topic(resource, config.topic.clone())
    }

    pub fn for_topic(resource: ConnectionResource, topic: impl Into<String>) -> Self {
        Self {
            resource,
            topic: topic.into(),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Open a session to stage several sends as one unit of work.
    pub async fn begin(&self) -> Result<Session, DeliveryError> {
        self.resource.create_session().await
    }

    /// Publish one message in its own committed session.
    pub async fn send(&self, message: Message) -> Result<MessageId, DeliveryError> {
        let id = message.id();
        let mut session = self.begin().await?;
        session.send(self.topic.as_str(), message)?;
        session.commit().await?;
        debug!(topic = %self.topic, message_id = %id, "Message sent");
        Ok(id)
    }

    /// Stage `message`, run `handler` on it, then commit or roll back on the
    /// handler's verdict. A raised fault is not an error: the message is
    /// simply never published.
    pub async fn send_and_process(
        &self,
        message: Message,
        handler: &dyn MessageHandler,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let mut session = self.begin().await?;
        let id = message.id();
        session.send(self.topic.as_str(), message.clone())?;

        match decide(Some(handler.process(&message))) {
            Decision::Commit => {
                session.commit().await?;
                debug!(topic = %self.topic, message_id = %id, "Message sent");
                Ok(DeliveryOutcome::Committed)
            }
            Decision::Rollback => {
                session.rollback().await?;
                info!(topic = %self.topic, message_id = %id, "Send rolled back on handler fault");
                Ok(DeliveryOutcome::RolledBack)
            }
        }
    }
}

impl std::fmt::Debug for TransactedProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactedProducer")
            .field("topic", &self.topic)
            .finish()
    }
}

//! Handler adapters.

use crate::domain::FaultIndicator;
use crate::ports::MessageHandler;
use shared_bus::Message;
use tracing::{debug, info};

/// Raises a fault when a boolean header on the message is `true`.
///
/// Missing or non-boolean headers count as success.
#[derive(Debug, Clone)]
pub struct HeaderFaultHandler {
    header: String,
}

impl HeaderFaultHandler {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }
}

impl MessageHandler for HeaderFaultHandler {
    fn process(&self, message: &Message) -> FaultIndicator {
        if message.header_bool(&self.header).unwrap_or(false) {
            info!(message_id = %message.id(), header = %self.header, "Processing failed, should roll back");
            FaultIndicator::RAISED
        } else {
            debug!(message_id = %message.id(), "Processing passed, should commit");
            FaultIndicator::CLEAR
        }
    }
}

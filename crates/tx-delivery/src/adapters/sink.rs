//! Sink adapters.

use crate::ports::DownstreamSink;
use parking_lot::Mutex;
use shared_bus::Message;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Unmet expectation on a [`RecordingSink`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpectationError {
    #[error("No expectation set")]
    NoExpectation,

    #[error("Expected bodies {expected:?}, received {received:?}")]
    Mismatch {
        expected: Vec<String>,
        received: Vec<String>,
    },
}

/// Sink that records every delivered message, with expectations for tests
/// and verification endpoints.
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Message>>,
    expected: Mutex<Option<Vec<String>>>,
    notify: Notify,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect exactly these bodies, in this order.
    pub fn expect_bodies<I, S>(&self, bodies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.expected.lock() = Some(bodies.into_iter().map(Into::into).collect());
    }

    #[must_use]
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    #[must_use]
    pub fn received_bodies(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|m| m.body().to_string())
            .collect()
    }

    #[must_use]
    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Wait until at least `count` messages arrived. Returns whether they did.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.received_count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.received_count() >= count;
            }
        }
    }

    /// Wait for the expected number of messages, then hold for `settle` so
    /// late extras are caught, then compare bodies.
    pub async fn assert_satisfied(
        &self,
        timeout: Duration,
        settle: Duration,
    ) -> Result<(), ExpectationError> {
        let expected = self
            .expected
            .lock()
            .clone()
            .ok_or(ExpectationError::NoExpectation)?;

        self.wait_for_count(expected.len(), timeout).await;
        tokio::time::sleep(settle).await;

        let received = self.received_bodies();
        if received == expected {
            Ok(())
        } else {
            Err(ExpectationError::Mismatch { expected, received })
        }
    }

    pub fn reset(&self) {
        self.received.lock().clear();
        *self.expected.lock() = None;
    }
}

impl DownstreamSink for RecordingSink {
    fn deliver(&self, message: &Message) {
        debug!(message_id = %message.id(), body = message.body(), "Sink received message");
        self.received.lock().push(message.clone());
        self.notify.notify_waiters();
    }
}

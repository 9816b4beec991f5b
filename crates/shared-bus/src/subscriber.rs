//! # Durable Subscription
//!
//! Per-subscription queue state held by the broker: messages waiting for
//! delivery, and deliveries handed out but not yet acknowledged.

use crate::error::BusError;
use crate::message::{Delivery, DeliveryTag, Message, SubscriptionKey};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// A queued message and the number of times it was returned to the broker.
#[derive(Debug, Clone)]
struct Queued {
    message: Message,
    redelivery_count: u32,
}

/// Result of returning one delivery to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovered {
    /// Put back at the head of the queue for another attempt.
    Requeued { redelivery_count: u32 },
    /// Exceeded the redelivery limit; the caller moves it to the dead-letter destination.
    DeadLettered(Message),
}

/// Queue state of one durable subscription.
///
/// Survives consumer disconnects: messages keep accumulating until the
/// subscription is removed.
#[derive(Debug)]
pub struct DurableSubscription {
    key: SubscriptionKey,

    /// Messages awaiting delivery, in publish order.
    queue: VecDeque<Queued>,

    /// Delivered but unacknowledged.
    in_flight: HashMap<DeliveryTag, Queued>,

    /// Wakes a waiting receiver when a message is enqueued.
    notify: Arc<Notify>,

    /// Total acknowledged deliveries.
    acknowledged: u64,
}

impl DurableSubscription {
    pub(crate) fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            notify: Arc::new(Notify::new()),
            acknowledged: 0,
        }
    }

    #[must_use]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub(crate) fn enqueue(&mut self, message: Message) {
        self.queue.push_back(Queued {
            message,
            redelivery_count: 0,
        });
        self.notify.notify_one();
    }

    /// Hand out the head of the queue under `tag`.
    pub(crate) fn next_delivery(&mut self, tag: DeliveryTag) -> Option<Delivery> {
        let queued = self.queue.pop_front()?;
        let delivery = Delivery {
            tag,
            subscription: self.key.clone(),
            message: queued.message.clone(),
            redelivery_count: queued.redelivery_count,
        };
        self.in_flight.insert(tag, queued);
        Some(delivery)
    }

    pub(crate) fn is_in_flight(&self, tag: DeliveryTag) -> bool {
        self.in_flight.contains_key(&tag)
    }

    pub(crate) fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), BusError> {
        self.in_flight
            .remove(&tag)
            .ok_or(BusError::UnknownDelivery(tag))?;
        self.acknowledged += 1;
        Ok(())
    }

    /// Return deliveries to the queue head, preserving their relative order.
    ///
    /// Tags that are not in flight are skipped.
    pub(crate) fn recover(
        &mut self,
        tags: &[DeliveryTag],
        max_redeliveries: u32,
    ) -> Vec<Recovered> {
        let mut outcomes = Vec::with_capacity(tags.len());
        let mut requeue = Vec::new();

        for tag in tags {
            let Some(mut queued) = self.in_flight.remove(tag) else {
                debug!(subscription = %self.key, tag = %tag, "Recover skipped unknown delivery");
                continue;
            };
            queued.redelivery_count += 1;
            if queued.redelivery_count > max_redeliveries {
                outcomes.push(Recovered::DeadLettered(queued.message));
            } else {
                outcomes.push(Recovered::Requeued {
                    redelivery_count: queued.redelivery_count,
                });
                requeue.push(queued);
            }
        }

        let requeued_any = !requeue.is_empty();
        for queued in requeue.into_iter().rev() {
            self.queue.push_front(queued);
        }
        if requeued_any {
            self.notify.notify_one();
        }
        outcomes
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Deliveries awaiting acknowledgement.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }
}

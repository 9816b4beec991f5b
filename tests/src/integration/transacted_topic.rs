//! # Transacted Topic Flows
//!
//! Producer sessions publish to a topic; a durable transacted consumer
//! hands committed messages to the sink.
//!
//! ## Flows Tested:
//!
//! 1. **Producer-side fault**: a send whose handler faults is rolled back and
//!    never published; the clean send reaches the sink exactly once
//! 2. **Consumer-side fault**: a poison message is redelivered, then
//!    dead-lettered, and never reaches the sink
//! 3. **Durability**: messages published while the consumer is away are
//!    delivered when it comes back under the same identity

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use shared_bus::{BrokerConfig, ClientIdentity, Message};
    use std::sync::Arc;
    use tx_delivery::{
        DeliveryOutcome, HeaderFaultHandler, RecordingSink, TransactedConsumer, TransactionState,
    };

    // =========================================================================
    // PRODUCER-SIDE FAULT (reference route)
    // =========================================================================

    /// Hello World 1 faults inside the producer session, Hello World 2 does not.
    #[tokio::test]
    async fn test_faulted_send_rolled_back_clean_send_delivered() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.sink.expect_bodies(["Hello World 2"]);
        let handle = p.consumer.spawn();
        let handler = HeaderFaultHandler::new(FAULT_HEADER);

        let first = p
            .producer
            .send_and_process(
                Message::new("Hello World 1").with_header(FAULT_HEADER, true),
                &handler,
            )
            .await
            .unwrap();
        let second = p
            .producer
            .send_and_process(
                Message::new("Hello World 2").with_header(FAULT_HEADER, false),
                &handler,
            )
            .await
            .unwrap();

        assert_eq!(first, DeliveryOutcome::RolledBack);
        assert_eq!(second, DeliveryOutcome::Committed);
        p.sink.assert_satisfied(WAIT, SETTLE).await.unwrap();

        let consumer = handle.shutdown().await.unwrap();
        assert_eq!(consumer.stats().committed, 1);
        assert_eq!(consumer.stats().rolled_back, 0);
        assert!(p.resource.stats().peak_open <= 1);
    }

    /// The sink sees the fault header value of the committed message only.
    #[tokio::test]
    async fn test_sink_receives_committed_message_unchanged() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        let handle = p.consumer.spawn();

        let message = Message::new("Hello World 2")
            .with_header(FAULT_HEADER, false)
            .with_header("trace", "abc");
        let id = message.id();
        p.producer.send(message).await.unwrap();

        assert!(p.sink.wait_for_count(1, WAIT).await);
        let received = p.sink.received();
        assert_eq!(received[0].id(), id);
        assert_eq!(received[0].header_bool(FAULT_HEADER), Some(false));

        handle.shutdown().await.unwrap();
    }

    // =========================================================================
    // CONSUMER-SIDE FAULT
    // =========================================================================

    #[tokio::test]
    async fn test_poison_message_never_reaches_sink() {
        let p = pipeline(
            reference_config(),
            BrokerConfig {
                max_redeliveries: 2,
                ..BrokerConfig::default()
            },
        )
        .await;
        p.sink.expect_bodies(["after poison"]);
        let handle = p.consumer.spawn();

        p.producer
            .send(Message::new("poison").with_header(FAULT_HEADER, true))
            .await
            .unwrap();
        p.producer.send(Message::new("after poison")).await.unwrap();

        p.sink.assert_satisfied(WAIT, SETTLE).await.unwrap();

        let consumer = handle.shutdown().await.unwrap();
        let stats = consumer.stats();
        assert_eq!(stats.rolled_back, 3);
        assert_eq!(stats.dead_lettered, 1);
        let dead = p.broker.dead_letters("foo");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body(), "poison");
    }

    // =========================================================================
    // DURABILITY
    // =========================================================================

    #[tokio::test]
    async fn test_durable_subscription_survives_consumer_absence() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        let subscription = p.consumer.subscription().clone();
        drop(p.consumer);

        p.producer.send(Message::new("while away")).await.unwrap();
        assert_eq!(p.broker.pending(&subscription), Some(1));

        let sink = Arc::new(RecordingSink::new());
        let consumer = TransactedConsumer::subscribe(
            p.resource.clone(),
            &p.config,
            Arc::new(HeaderFaultHandler::new(FAULT_HEADER)),
            sink.clone(),
        )
        .await
        .unwrap();
        assert_eq!(consumer.subscription(), &subscription);

        let report = consumer.poll_once().await.unwrap().unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Committed);
        assert_eq!(sink.received_bodies(), vec!["while away"]);
    }

    #[tokio::test]
    async fn test_subscription_owned_by_client_identity() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.producer.send(Message::new("hello")).await.unwrap();

        let mut stranger = p
            .resource
            .create_session_with_identity(ClientIdentity::new("someone-else"))
            .await
            .unwrap();
        let result = stranger
            .receive(p.consumer.subscription(), std::time::Duration::from_millis(10))
            .await;
        assert!(result.is_err());
        assert_eq!(stranger.state(), TransactionState::Active);
        stranger.rollback().await.unwrap();

        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(1));
    }
}

//! # Broker Failures
//!
//! Transport failures injected through the broker's `FaultInjector`.
//!
//! ## Properties Tested:
//!
//! 1. A commit whose outcome was lost is retried on a new connection and
//!    applied exactly once (no duplicate publish, no redelivery)
//! 2. A commit applied before its reply was lost, whose retries then all
//!    fail, is confirmed with the broker and still counts as committed
//! 3. Failures outlasting the retry policy surface as `BrokerUnavailable`
//!    and leave nothing half-applied
//! 4. A commit whose fate cannot be confirmed surfaces as `CommitOutcomeUnknown`
//! 5. Finished sessions reject further commits with `SessionClosed`
//! 6. A running consumer rides out a `BrokerUnavailable` poll

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use shared_bus::{BrokerConfig, BrokerOperation, FailureMode, Message};
    use tx_delivery::{DeliveryError, DeliveryOutcome, TransactionState};

    // =========================================================================
    // AMBIGUOUS COMMITS
    // =========================================================================

    #[tokio::test]
    async fn test_producer_commit_lost_reply_publishes_once() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.broker
            .faults()
            .fail_next(BrokerOperation::Commit, FailureMode::AfterApply, 1);

        p.producer.send(Message::new("once")).await.unwrap();

        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(1));
        assert!(p.consumer.poll_once().await.unwrap().is_some());
        assert_eq!(p.consumer.poll_once().await.unwrap(), None);
        assert_eq!(p.sink.received_bodies(), vec!["once"]);
    }

    #[tokio::test]
    async fn test_consumer_commit_lost_reply_delivers_once() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.producer.send(Message::new("Hello World 2")).await.unwrap();
        p.broker
            .faults()
            .fail_next(BrokerOperation::Commit, FailureMode::AfterApply, 1);

        let report = p.consumer.poll_once().await.unwrap().unwrap();

        assert_eq!(report.outcome, DeliveryOutcome::Committed);
        assert_eq!(p.consumer.poll_once().await.unwrap(), None);
        assert_eq!(p.sink.received_bodies(), vec!["Hello World 2"]);
        assert_eq!(p.broker.in_flight(p.consumer.subscription()), Some(0));
        assert_eq!(p.broker.stats().commits, 2);
        assert_eq!(p.resource.stats().discarded, 1);
    }

    fn lose_reply_then_fail_retries(p: &Pipeline) {
        let faults = p.broker.faults();
        faults.fail_next(BrokerOperation::Commit, FailureMode::AfterApply, 1);
        faults.fail_next(BrokerOperation::Commit, FailureMode::BeforeApply, 2);
    }

    #[tokio::test]
    async fn test_consumer_applied_commit_with_exhausted_retries_reaches_sink() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.producer.send(Message::new("Hello World 2")).await.unwrap();
        lose_reply_then_fail_retries(&p);

        let report = p.consumer.poll_once().await.unwrap().unwrap();

        assert_eq!(report.outcome, DeliveryOutcome::Committed);
        assert_eq!(p.consumer.poll_once().await.unwrap(), None);
        assert_eq!(p.sink.received_bodies(), vec!["Hello World 2"]);
        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(0));
        assert_eq!(p.broker.in_flight(p.consumer.subscription()), Some(0));
        assert_eq!(p.consumer.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_producer_applied_commit_with_exhausted_retries_succeeds() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        lose_reply_then_fail_retries(&p);

        p.producer.send(Message::new("published")).await.unwrap();

        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(1));
        assert!(p.consumer.poll_once().await.unwrap().is_some());
        assert_eq!(p.consumer.poll_once().await.unwrap(), None);
        assert_eq!(p.sink.received_bodies(), vec!["published"]);
    }

    #[tokio::test]
    async fn test_unconfirmable_commit_reports_unknown_outcome() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        lose_reply_then_fail_retries(&p);
        p.broker
            .faults()
            .fail_next(BrokerOperation::Status, FailureMode::BeforeApply, 3);

        let err = p.producer.send(Message::new("maybe")).await.unwrap_err();

        assert!(matches!(err, DeliveryError::CommitOutcomeUnknown { .. }));
        assert!(!err.is_recoverable());
        // The first attempt did apply.
        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(1));
    }

    // =========================================================================
    // RETRY EXHAUSTION
    // =========================================================================

    #[tokio::test]
    async fn test_retry_exhaustion_reports_broker_unavailable() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.broker
            .faults()
            .fail_next(BrokerOperation::Commit, FailureMode::BeforeApply, 3);

        let err = p.producer.send(Message::new("lost")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::BrokerUnavailable { attempts: 3, .. }));
        assert!(err.is_recoverable());
        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(0));

        p.producer.send(Message::new("recovered")).await.unwrap();
        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(1));
    }

    #[tokio::test]
    async fn test_failed_batch_commit_publishes_nothing() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.broker
            .faults()
            .fail_next(BrokerOperation::Commit, FailureMode::BeforeApply, 3);

        let mut batch = p.producer.begin().await.unwrap();
        for body in ["a", "b", "c"] {
            batch.send(p.producer.topic(), Message::new(body)).unwrap();
        }
        assert!(batch.commit().await.is_err());
        assert_eq!(batch.state(), TransactionState::RolledBack);
        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(0));

        assert_eq!(
            batch.commit().await.unwrap_err(),
            DeliveryError::SessionClosed {
                state: TransactionState::RolledBack
            }
        );
    }

    #[tokio::test]
    async fn test_double_commit_rejected() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        let mut session = p.producer.begin().await.unwrap();
        session.send(p.producer.topic(), Message::new("x")).unwrap();
        session.commit().await.unwrap();

        assert_eq!(
            session.commit().await.unwrap_err(),
            DeliveryError::SessionClosed {
                state: TransactionState::Committed
            }
        );
        assert_eq!(p.broker.pending(p.consumer.subscription()), Some(1));
    }

    // =========================================================================
    // CONSUMER RESILIENCE
    // =========================================================================

    #[tokio::test]
    async fn test_receive_failure_retried_transparently() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.producer.send(Message::new("hello")).await.unwrap();
        p.broker
            .faults()
            .fail_next(BrokerOperation::Receive, FailureMode::BeforeApply, 1);

        let report = p.consumer.poll_once().await.unwrap().unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Committed);
        assert_eq!(p.sink.received_bodies(), vec!["hello"]);
        assert_eq!(p.consumer.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_running_consumer_survives_broker_outage() {
        let p = pipeline(reference_config(), BrokerConfig::default()).await;
        p.sink.expect_bodies(["after outage"]);
        let handle = p.consumer.spawn();

        p.broker
            .faults()
            .fail_next(BrokerOperation::Receive, FailureMode::BeforeApply, 3);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(p.broker.faults().pending(), 0);

        p.producer.send(Message::new("after outage")).await.unwrap();
        p.sink.assert_satisfied(WAIT, SETTLE).await.unwrap();

        assert!(!handle.is_finished());
        let consumer = handle.shutdown().await.unwrap();
        assert_eq!(consumer.stats().errors, 1);
        assert_eq!(consumer.stats().committed, 1);
    }
}

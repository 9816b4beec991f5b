//! # Connection Pool Contention
//!
//! ## Properties Tested:
//!
//! 1. Open connections never exceed `max_connections`, however many
//!    producers and consumers compete
//! 2. A waiter past `acquire_timeout_ms` fails with `ResourceExhausted`
//! 3. A client identity is held by at most one live connection, across
//!    pools sharing a broker

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use futures::future::join_all;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use shared_bus::{BrokerConfig, ClientIdentity, InMemoryBroker, Message};
    use std::sync::Arc;
    use std::time::Duration;
    use tx_delivery::{
        ConnectionResource, DeliveryConfig, DeliveryError, DeliveryOutcome, HeaderFaultHandler,
        RecordingSink, TransactedConsumer, TransactedProducer,
    };

    const PRODUCERS: usize = 8;
    const MESSAGES_PER_PRODUCER: usize = 10;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_cap_holds_under_load() {
        let config = DeliveryConfig {
            max_connections: 3,
            acquire_timeout_ms: 5_000,
            ..reference_config()
        };
        let p = pipeline(config, BrokerConfig::default()).await;
        let handle = p.consumer.spawn();

        let mut rng = StdRng::seed_from_u64(7);
        let plan: Vec<Vec<bool>> = (0..PRODUCERS)
            .map(|_| (0..MESSAGES_PER_PRODUCER).map(|_| rng.gen_bool(0.3)).collect())
            .collect();
        let expected_commits = plan.iter().flatten().filter(|fault| !**fault).count();

        let tasks = plan.into_iter().enumerate().map(|(producer_id, faults)| {
            let producer = p.producer.clone();
            tokio::spawn(async move {
                let handler = HeaderFaultHandler::new(FAULT_HEADER);
                let mut committed = 0;
                for (seq, fault) in faults.into_iter().enumerate() {
                    let message = Message::new(format!("p{producer_id}-m{seq}"))
                        .with_header(FAULT_HEADER, fault);
                    let outcome = producer.send_and_process(message, &handler).await.unwrap();
                    if outcome == DeliveryOutcome::Committed {
                        committed += 1;
                    }
                }
                committed
            })
        });
        let committed: usize = join_all(tasks).await.into_iter().map(|r| r.unwrap()).sum();

        assert_eq!(committed, expected_commits);
        assert!(p.sink.wait_for_count(expected_commits, WAIT).await);
        handle.shutdown().await.unwrap();

        let stats = p.resource.stats();
        assert!(stats.peak_open <= 3, "peak {} exceeds cap", stats.peak_open);
        assert!(p.broker.stats().connections <= 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(p.sink.received_count(), expected_commits);
    }

    #[tokio::test]
    async fn test_waiter_times_out_with_resource_exhausted() {
        let broker = Arc::new(InMemoryBroker::new());
        let config = DeliveryConfig {
            max_connections: 1,
            acquire_timeout_ms: 30,
            ..reference_config()
        };
        let resource = ConnectionResource::new(broker, &config).unwrap();
        let producer = TransactedProducer::new(resource.clone(), &config);

        let held = resource.create_session().await.unwrap();
        let err = producer.send(Message::new("blocked")).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::ResourceExhausted {
                max_connections: 1,
                waited: Duration::from_millis(30),
            }
        );
        assert!(err.is_recoverable());

        drop(held);
        producer.send(Message::new("unblocked")).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_identity_across_pools() {
        let broker = Arc::new(InMemoryBroker::new());
        let first = pipeline_on(broker.clone(), reference_config()).await;
        assert!(broker.is_bound(&ClientIdentity::new("test-connection-1")));

        let second_pool = ConnectionResource::new(broker.clone(), &reference_config()).unwrap();
        let result = TransactedConsumer::subscribe(
            second_pool,
            &reference_config(),
            Arc::new(HeaderFaultHandler::new(FAULT_HEADER)),
            Arc::new(RecordingSink::new()),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::DuplicateClientIdentity("test-connection-1".into())
        );
        assert!(!err.is_recoverable());

        // Closing the first pool frees the identity.
        first.resource.close();
        let third_pool = ConnectionResource::new(broker, &reference_config()).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let consumer = TransactedConsumer::subscribe(
            third_pool,
            &reference_config(),
            Arc::new(HeaderFaultHandler::new(FAULT_HEADER)),
            sink,
        )
        .await
        .unwrap();
        assert_eq!(consumer.subscription(), first.consumer.subscription());
    }

    #[tokio::test]
    async fn test_duplicate_identity_within_pool() {
        let broker = Arc::new(InMemoryBroker::new());
        let config = DeliveryConfig {
            max_connections: 2,
            ..reference_config()
        };
        let resource = ConnectionResource::new(broker, &config).unwrap();
        let identity = ClientIdentity::new("test-connection-1");

        let _held = resource
            .create_session_with_identity(identity.clone())
            .await
            .unwrap();
        let err = resource
            .create_session_with_identity(identity)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::DuplicateClientIdentity(_)));
        assert_eq!(resource.stats().open, 1);
    }
}

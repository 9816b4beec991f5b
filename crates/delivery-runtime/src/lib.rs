//! # Delivery Runtime
//!
//! Wires an in-memory broker, a connection pool, a transacted producer and a
//! durable transacted consumer into one process.
//!
//! ```text
//! TransactedProducer ──send_and_process──→ topic ──durable sub──→ TransactedConsumer ──→ RecordingSink
//!          │                                                              │
//!          └──────────────── ConnectionResource (max_connections) ───────┘
//! ```
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (defaults, JSON file, `TD_*` overrides)
//! 2. Create the broker and the connection pool
//! 3. Subscribe the durable consumer and spawn it
//! 4. Run the reference scenario
//! 5. Optionally keep consuming until Ctrl+C
//! 6. Shut down: stop the consumer, close the pool

pub mod config;
pub mod scenario;

use anyhow::{Context, Result};
use shared_bus::InMemoryBroker;
use std::sync::Arc;
use tracing::{info, warn};
use tx_delivery::{
    ConnectionResource, ConsumerHandle, ConsumerStats, HeaderFaultHandler, PoolStats,
    RecordingSink, TransactedConsumer, TransactedProducer,
};

pub use config::{load_config, load_config_from, RuntimeConfig};
pub use scenario::{run_reference_scenario, ScenarioReport};

/// Final counters reported at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSummary {
    pub pool: PoolStats,
    pub consumer: ConsumerStats,
}

/// The running delivery pipeline.
pub struct DeliveryRuntime {
    config: RuntimeConfig,
    broker: Arc<InMemoryBroker>,
    resource: ConnectionResource,
    handler: Arc<HeaderFaultHandler>,
    sink: Arc<RecordingSink>,
    consumer: Option<ConsumerHandle>,
}

impl DeliveryRuntime {
    /// Create the broker and the pool. Nothing connects yet.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let broker = Arc::new(InMemoryBroker::with_config(config.broker.clone()));
        let resource = ConnectionResource::new(broker.clone(), &config.delivery)
            .context("Failed to create connection pool")?;
        let handler = Arc::new(HeaderFaultHandler::new(config.fault_header.as_str()));

        Ok(Self {
            config,
            broker,
            resource,
            handler,
            sink: Arc::new(RecordingSink::new()),
            consumer: None,
        })
    }

    /// Subscribe the durable consumer and start it in the background.
    pub async fn start(&mut self) -> Result<()> {
        if self.consumer.is_some() {
            warn!("Runtime already started");
            return Ok(());
        }

        let consumer = TransactedConsumer::subscribe(
            self.resource.clone(),
            &self.config.delivery,
            self.handler.clone(),
            self.sink.clone(),
        )
        .await
        .context("Failed to subscribe consumer")?;

        info!(
            topic = %self.config.delivery.topic,
            subscription = %consumer.subscription(),
            max_connections = self.config.delivery.max_connections,
            "Delivery runtime started"
        );
        self.consumer = Some(consumer.spawn());
        Ok(())
    }

    #[must_use]
    pub fn producer(&self) -> TransactedProducer {
        TransactedProducer::new(self.resource.clone(), &self.config.delivery)
    }

    #[must_use]
    pub fn sink(&self) -> Arc<RecordingSink> {
        Arc::clone(&self.sink)
    }

    #[must_use]
    pub fn broker(&self) -> Arc<InMemoryBroker> {
        Arc::clone(&self.broker)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run the two-message reference scenario against the running consumer.
    pub async fn run_scenario(&self) -> Result<ScenarioReport> {
        let report = run_reference_scenario(
            &self.producer(),
            self.handler.as_ref(),
            &self.config.fault_header,
            &self.sink,
            self.config.scenario_timeout(),
        )
        .await?;
        self.publish_metrics();
        Ok(report)
    }

    /// Push current pool and consumer counters to the metrics registry.
    pub fn publish_metrics(&self) {
        let pool = self.resource.stats();
        delivery_telemetry::record_pool(pool.open, pool.in_use, pool.peak_open, pool.discarded);
        if let Some(consumer) = &self.consumer {
            let subscription = consumer.subscription().to_string();
            delivery_telemetry::record_consumer(&subscription, totals(consumer.stats()));
        }
    }

    /// Stop the consumer after its in-progress message and close the pool.
    pub async fn shutdown(mut self) -> Result<RuntimeSummary> {
        info!("Initiating graceful shutdown...");
        self.publish_metrics();

        let consumer = match self.consumer.take() {
            Some(handle) => {
                let subscription = handle.subscription().to_string();
                let stats = handle
                    .shutdown()
                    .await
                    .context("Consumer stopped with an error")?
                    .stats();
                delivery_telemetry::record_consumer(&subscription, totals(stats));
                stats
            }
            None => ConsumerStats::default(),
        };

        self.resource.close();
        let summary = RuntimeSummary {
            pool: self.resource.stats(),
            consumer,
        };
        info!(
            committed = summary.consumer.committed,
            rolled_back = summary.consumer.rolled_back,
            peak_connections = summary.pool.peak_open,
            "Shutdown complete"
        );
        Ok(summary)
    }
}

fn totals(stats: ConsumerStats) -> delivery_telemetry::ConsumerTotals {
    delivery_telemetry::ConsumerTotals {
        received: stats.received,
        committed: stats.committed,
        rolled_back: stats.rolled_back,
        dead_lettered: stats.dead_lettered,
        errors: stats.errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tx_delivery::{DeliveryConfig, DeliveryOutcome};

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            delivery: DeliveryConfig {
                client_identity: "test-connection-1".into(),
                subscription_name: "bar".into(),
                topic: "foo".into(),
                receive_timeout_ms: 20,
                ..DeliveryConfig::default()
            },
            scenario_timeout_ms: 2_000,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reference_scenario() {
        let mut runtime = DeliveryRuntime::new(test_config()).unwrap();
        runtime.start().await.unwrap();

        let report = runtime.run_scenario().await.unwrap();
        assert_eq!(report.received, vec!["Hello World 2"]);
        assert_eq!(
            report.outcomes,
            vec![
                ("Hello World 1".to_string(), DeliveryOutcome::RolledBack),
                ("Hello World 2".to_string(), DeliveryOutcome::Committed),
            ]
        );

        let summary = runtime.shutdown().await.unwrap();
        assert_eq!(summary.consumer.committed, 1);
        assert_eq!(summary.consumer.rolled_back, 0);
        assert_eq!(summary.pool.peak_open, 1);
        assert_eq!(summary.pool.open, 0);
    }

    #[tokio::test]
    async fn test_scenario_without_consumer_fails() {
        let runtime = DeliveryRuntime::new(RuntimeConfig {
            scenario_timeout_ms: 50,
            ..test_config()
        })
        .unwrap();

        assert!(runtime.run_scenario().await.is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.delivery.transacted = false;
        assert!(DeliveryRuntime::new(config).is_err());
    }
}

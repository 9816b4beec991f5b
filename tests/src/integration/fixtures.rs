//! Shared wiring for the integration scenarios.

use shared_bus::{BrokerConfig, InMemoryBroker};
use std::sync::Arc;
use std::time::Duration;
use tx_delivery::{
    ConnectionResource, DeliveryConfig, HeaderFaultHandler, RecordingSink, TransactedConsumer,
    TransactedProducer,
};

pub const FAULT_HEADER: &str = "isfailed";
pub const WAIT: Duration = Duration::from_secs(3);
pub const SETTLE: Duration = Duration::from_millis(100);

/// The durable subscriber configuration of the reference route.
pub fn reference_config() -> DeliveryConfig {
    DeliveryConfig {
        max_connections: 1,
        client_identity: "test-connection-1".into(),
        subscription_name: "bar".into(),
        topic: "foo".into(),
        receive_timeout_ms: 20,
        acquire_timeout_ms: 2_000,
        ..DeliveryConfig::default()
    }
}

pub struct Pipeline {
    pub broker: Arc<InMemoryBroker>,
    pub resource: ConnectionResource,
    pub producer: TransactedProducer,
    pub consumer: TransactedConsumer,
    pub sink: Arc<RecordingSink>,
    pub config: DeliveryConfig,
}

pub async fn pipeline(config: DeliveryConfig, broker_config: BrokerConfig) -> Pipeline {
    let broker = Arc::new(InMemoryBroker::with_config(broker_config));
    pipeline_on(broker, config).await
}

pub async fn pipeline_on(broker: Arc<InMemoryBroker>, config: DeliveryConfig) -> Pipeline {
    let resource = ConnectionResource::new(broker.clone(), &config).expect("valid config");
    let sink = Arc::new(RecordingSink::new());
    let consumer = TransactedConsumer::subscribe(
        resource.clone(),
        &config,
        Arc::new(HeaderFaultHandler::new(FAULT_HEADER)),
        sink.clone(),
    )
    .await
    .expect("subscribe");
    let producer = TransactedProducer::new(resource.clone(), &config);

    Pipeline {
        broker,
        resource,
        producer,
        consumer,
        sink,
        config,
    }
}

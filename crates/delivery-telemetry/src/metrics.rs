//! Prometheus metrics for transacted delivery.
//!
//! All metrics follow the naming convention: `txd_<component>_<metric>_<unit>`
//!
//! Counters are fed from cumulative snapshots (`PoolStats`, `ConsumerStats`)
//! with [`advance`], so publishing the same snapshot twice is harmless.
//! Consumer counters carry a `subscription` label, one series per snapshot
//! source.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // CONNECTION POOL
    // =========================================================================

    /// Connections open at the broker (idle + in use)
    pub static ref POOL_CONNECTIONS_OPEN: IntGauge = IntGauge::new(
        "txd_pool_connections_open",
        "Connections currently open at the broker"
    ).expect("metric creation failed");

    /// Connections checked out by sessions
    pub static ref POOL_CONNECTIONS_IN_USE: IntGauge = IntGauge::new(
        "txd_pool_connections_in_use",
        "Connections currently checked out"
    ).expect("metric creation failed");

    /// High-water mark of open connections
    pub static ref POOL_CONNECTIONS_PEAK: IntGauge = IntGauge::new(
        "txd_pool_connections_peak",
        "Highest number of simultaneously open connections"
    ).expect("metric creation failed");

    /// Connections discarded as broken
    pub static ref POOL_CONNECTIONS_DISCARDED: IntCounter = IntCounter::new(
        "txd_pool_connections_discarded_total",
        "Connections thrown away after a transport failure"
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUMER
    // =========================================================================

    /// Messages received by consumers
    pub static ref MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("txd_consumer_messages_received_total", "Messages received inside a consumer session"),
        &["subscription"]
    ).expect("metric creation failed");

    /// Consumer sessions that committed
    pub static ref MESSAGES_COMMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("txd_consumer_messages_committed_total", "Messages committed and delivered to the sink"),
        &["subscription"]
    ).expect("metric creation failed");

    /// Consumer sessions rolled back on a handler fault
    pub static ref MESSAGES_ROLLED_BACK: IntCounterVec = IntCounterVec::new(
        Opts::new("txd_consumer_messages_rolled_back_total", "Messages rolled back for redelivery"),
        &["subscription"]
    ).expect("metric creation failed");

    /// Messages moved to a dead-letter destination
    pub static ref MESSAGES_DEAD_LETTERED: IntCounterVec = IntCounterVec::new(
        Opts::new("txd_consumer_messages_dead_lettered_total", "Messages dead-lettered after exhausting redeliveries"),
        &["subscription"]
    ).expect("metric creation failed");

    /// Consumer polls that failed
    pub static ref CONSUMER_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("txd_consumer_errors_total", "Consumer polls that ended in an error"),
        &["subscription"]
    ).expect("metric creation failed");

    // =========================================================================
    // PRODUCER
    // =========================================================================

    /// Producer sends by outcome
    pub static ref PRODUCER_SENDS: IntCounterVec = IntCounterVec::new(
        Opts::new("txd_producer_sends_total", "Producer sends by outcome"),
        &["topic", "outcome"]  // outcome: committed/rolled_back/failed
    ).expect("metric creation failed");
}

/// Keeps the registry alive for the lifetime of the process.
pub struct MetricsHandle {
    _registry: Registry,
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Pool
        Box::new(POOL_CONNECTIONS_OPEN.clone()),
        Box::new(POOL_CONNECTIONS_IN_USE.clone()),
        Box::new(POOL_CONNECTIONS_PEAK.clone()),
        Box::new(POOL_CONNECTIONS_DISCARDED.clone()),
        // Consumer
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(MESSAGES_COMMITTED.clone()),
        Box::new(MESSAGES_ROLLED_BACK.clone()),
        Box::new(MESSAGES_DEAD_LETTERED.clone()),
        Box::new(CONSUMER_ERRORS.clone()),
        // Producer
        Box::new(PRODUCER_SENDS.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: REGISTRY.clone(),
    })
}

/// Raise a counter to the cumulative `total`. Never decreases it.
pub fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn gauge_value(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Publish a pool snapshot.
pub fn record_pool(open: usize, in_use: usize, peak_open: usize, discarded: u64) {
    POOL_CONNECTIONS_OPEN.set(gauge_value(open));
    POOL_CONNECTIONS_IN_USE.set(gauge_value(in_use));
    POOL_CONNECTIONS_PEAK.set(gauge_value(peak_open));
    advance(&POOL_CONNECTIONS_DISCARDED, discarded);
}

/// Cumulative consumer counters, as published by [`record_consumer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerTotals {
    pub received: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub dead_lettered: u64,
    pub errors: u64,
}

/// Publish the snapshot of the consumer on `subscription`.
pub fn record_consumer(subscription: &str, totals: ConsumerTotals) {
    let labels = [subscription];
    advance(&MESSAGES_RECEIVED.with_label_values(&labels), totals.received);
    advance(&MESSAGES_COMMITTED.with_label_values(&labels), totals.committed);
    advance(&MESSAGES_ROLLED_BACK.with_label_values(&labels), totals.rolled_back);
    advance(&MESSAGES_DEAD_LETTERED.with_label_values(&labels), totals.dead_lettered);
    advance(&CONSUMER_ERRORS.with_label_values(&labels), totals.errors);
}

/// Count one producer send.
pub fn record_send(topic: &str, outcome: &str) {
    PRODUCER_SENDS.with_label_values(&[topic, outcome]).inc();
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

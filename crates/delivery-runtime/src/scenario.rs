//! # Reference Scenario
//!
//! Two messages go through the transacted producer with the fault handler:
//!
//! | Body | `isfailed` | Producer session | Reaches sink |
//! |------|-----------|------------------|--------------|
//! | `Hello World 1` | `true` | rolled back | no |
//! | `Hello World 2` | `false` | committed | yes |
//!
//! The sink must end up with exactly `["Hello World 2"]`.

use anyhow::{Context, Result};
use shared_bus::Message;
use std::time::Duration;
use tracing::info;
use tx_delivery::{DeliveryOutcome, MessageHandler, RecordingSink, TransactedProducer};

/// Bodies sent, with whether each carries a raised fault header.
pub const SCENARIO_MESSAGES: [(&str, bool); 2] =
    [("Hello World 1", true), ("Hello World 2", false)];

/// Bodies the sink must receive.
pub const EXPECTED_BODIES: [&str; 1] = ["Hello World 2"];

/// How long the sink is watched for unexpected extra messages.
const SETTLE: Duration = Duration::from_millis(200);

/// What the scenario observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub outcomes: Vec<(String, DeliveryOutcome)>,
    pub received: Vec<String>,
}

/// Run the scenario and verify the sink.
pub async fn run_reference_scenario(
    producer: &TransactedProducer,
    handler: &dyn MessageHandler,
    fault_header: &str,
    sink: &RecordingSink,
    timeout: Duration,
) -> Result<ScenarioReport> {
    sink.expect_bodies(EXPECTED_BODIES);

    let mut outcomes = Vec::with_capacity(SCENARIO_MESSAGES.len());
    for (body, fault) in SCENARIO_MESSAGES {
        let message = Message::new(body).with_header(fault_header, fault);
        let outcome = match producer.send_and_process(message, handler).await {
            Ok(outcome) => outcome,
            Err(err) => {
                delivery_telemetry::record_send(producer.topic(), "failed");
                return Err(err).with_context(|| format!("Failed to send {body:?}"));
            }
        };
        delivery_telemetry::record_send(producer.topic(), outcome_label(outcome));
        info!(body = body, fault, outcome = ?outcome, "Scenario message sent");
        outcomes.push((body.to_string(), outcome));
    }

    sink.assert_satisfied(timeout, SETTLE)
        .await
        .context("Sink expectation not met")?;

    Ok(ScenarioReport {
        outcomes,
        received: sink.received_bodies(),
    })
}

fn outcome_label(outcome: DeliveryOutcome) -> &'static str {
    match outcome {
        DeliveryOutcome::Committed => "committed",
        DeliveryOutcome::RolledBack => "rolled_back",
    }
}

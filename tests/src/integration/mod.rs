//! # Integration Scenarios
//!
//! Every scenario wires a real `InMemoryBroker`, a `ConnectionResource`,
//! producers and consumers; nothing is mocked except the sink.

#[cfg(test)]
mod fixtures;

pub mod broker_failures;
pub mod pool_contention;
pub mod transacted_topic;

//! Ports layer.
//!
//! Outbound (driven) ports: the broker, the message handler and the
//! downstream sink the core depends on.

pub mod outbound;

pub use outbound::*;

//! Adapters layer.
//!
//! Ready-made handler and sink implementations.

pub mod handler;
pub mod sink;

pub use handler::HeaderFaultHandler;
pub use sink::{ExpectationError, RecordingSink};

//! # Domain Layer
//!
//! Pure types and rules of transacted delivery.
//!
//! - `config`: DeliveryConfig, RetryPolicy, ConfigError
//! - `decision`: FaultIndicator and the commit/rollback decision
//! - `entities`: TransactionState, DeliveryOutcome, DeliveryReport
//! - `errors`: DeliveryError

pub mod config;
pub mod decision;
pub mod entities;
pub mod errors;

pub use config::*;
pub use decision::*;
pub use entities::*;
pub use errors::*;

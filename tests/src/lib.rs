//! # Transacted Delivery Test Suite
//!
//! Unified test crate containing:
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/            # Criterion benchmarks (session commit, pool checkout)
//! └── src/integration/    # Cross-crate scenarios over the in-memory broker
//!     ├── transacted_topic.rs   # Producer → durable subscription → sink
//!     ├── pool_contention.rs    # Connection cap, identity exclusivity
//!     └── broker_failures.rs    # Retries, de-duplication, dead letters
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p delivery-tests
//!
//! # By category
//! cargo test -p delivery-tests integration::broker_failures::
//!
//! # Benchmarks
//! cargo bench -p delivery-tests
//! ```

pub mod integration;

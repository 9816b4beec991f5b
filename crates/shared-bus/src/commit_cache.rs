//! # Time-Bounded Commit Cache
//!
//! Remembers which transaction ids the broker has already applied, so that a
//! commit retried after an ambiguous transport failure is applied at most once.
//!
//! ## Design
//!
//! - An id is remembered for the validity window (default 120s)
//! - Expired ids are garbage-collected at most once per GC interval
//! - A retry arriving after the window would be applied again, so the window
//!   must exceed the longest commit retry sequence

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::DEFAULT_COMMIT_DEDUP_WINDOW_SECS;

/// Errors from commit cache operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitCacheError {
    /// The transaction was already applied.
    #[error("Transaction {id} was already applied")]
    AlreadyApplied { id: Uuid },
}

/// Time-bounded record of applied transaction ids.
pub struct TimeBoundedCommitCache {
    /// Map of transaction id -> second it was applied.
    applied: HashMap<Uuid, u64>,

    /// How long an id is remembered, in seconds.
    validity_window_secs: u64,

    /// Last garbage collection timestamp.
    last_gc: u64,

    /// Garbage collection interval in seconds.
    gc_interval_secs: u64,
}

impl TimeBoundedCommitCache {
    /// Default garbage collection interval.
    pub const DEFAULT_GC_INTERVAL: u64 = 10;

    /// Create a cache with the default window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_COMMIT_DEDUP_WINDOW_SECS, Self::DEFAULT_GC_INTERVAL)
    }

    /// Create a cache with custom settings.
    #[must_use]
    pub fn with_config(validity_window_secs: u64, gc_interval_secs: u64) -> Self {
        Self {
            applied: HashMap::new(),
            validity_window_secs,
            last_gc: Self::current_timestamp(),
            gc_interval_secs,
        }
    }

    /// Record a transaction id as applied.
    ///
    /// # Errors
    ///
    /// - `CommitCacheError::AlreadyApplied` - the id is still remembered
    pub fn record(&mut self, id: Uuid) -> Result<(), CommitCacheError> {
        let now = Self::current_timestamp();
        self.maybe_collect(now);

        if self.applied.contains_key(&id) {
            return Err(CommitCacheError::AlreadyApplied { id });
        }

        self.applied.insert(id, now);
        Ok(())
    }

    /// Record a transaction id as applied, refreshing it if already known.
    pub fn insert(&mut self, id: Uuid) {
        let now = Self::current_timestamp();
        self.maybe_collect(now);
        self.applied.insert(id, now);
    }

    /// Check whether an id was applied without recording it.
    #[must_use]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.applied.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    fn maybe_collect(&mut self, now: u64) {
        if now.saturating_sub(self.last_gc) > self.gc_interval_secs {
            self.garbage_collect(now);
            self.last_gc = now;
        }
    }

    fn garbage_collect(&mut self, now: u64) {
        let expiry_threshold = now.saturating_sub(self.validity_window_secs);
        self.applied.retain(|_, &mut ts| ts > expiry_threshold);
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for TimeBoundedCommitCache {
    fn default() -> Self {
        Self::new()
    }
}

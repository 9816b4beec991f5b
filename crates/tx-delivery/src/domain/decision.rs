//! # Fault Decision Protocol
//!
//! Maps the handler's fault indicator to commit or rollback. Pure: it runs
//! after the handler returns and touches nothing.

/// Fault signal produced by a message handler.
///
/// Passed to [`decide`] and nowhere else; it is not part of the message and
/// never reaches a downstream sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultIndicator(bool);

impl FaultIndicator {
    /// Processing succeeded.
    pub const CLEAR: Self = Self(false);
    /// Processing failed; the unit of work must be rolled back.
    pub const RAISED: Self = Self(true);

    #[must_use]
    pub fn is_raised(self) -> bool {
        self.0
    }
}

impl From<bool> for FaultIndicator {
    fn from(raised: bool) -> Self {
        Self(raised)
    }
}

/// What to do with the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

/// Raised ⇒ rollback; clear or absent ⇒ commit.
#[must_use]
pub fn decide(indicator: Option<FaultIndicator>) -> Decision {
    match indicator {
        Some(fault) if fault.is_raised() => Decision::Rollback,
        _ => Decision::Commit,
    }
}

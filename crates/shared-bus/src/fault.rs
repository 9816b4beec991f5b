//! # Fault Injection
//!
//! Scripted transport failures for exercising retry paths against the
//! in-memory broker.

use parking_lot::Mutex;
use tracing::debug;

/// Broker operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Connect,
    Receive,
    Commit,
    Rollback,
    /// Transaction outcome queries.
    Status,
}

/// When the injected failure strikes relative to the operation's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Fail without applying anything.
    BeforeApply,
    /// Apply the operation, then lose the reply.
    AfterApply,
}

#[derive(Debug)]
struct ScriptedFault {
    operation: BrokerOperation,
    mode: FailureMode,
    remaining: u32,
}

/// Queue of scripted failures, consumed in order per operation.
#[derive(Debug, Default)]
pub struct FaultInjector {
    script: Mutex<Vec<ScriptedFault>>,
}

impl FaultInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `operation` with `mode`.
    pub fn fail_next(&self, operation: BrokerOperation, mode: FailureMode, times: u32) {
        if times == 0 {
            return;
        }
        self.script.lock().push(ScriptedFault {
            operation,
            mode,
            remaining: times,
        });
    }

    /// Take the failure scheduled for this call of `operation`, if any.
    pub fn take(&self, operation: BrokerOperation) -> Option<FailureMode> {
        let mut script = self.script.lock();
        let index = script.iter().position(|f| f.operation == operation)?;
        let mode = script[index].mode;
        script[index].remaining -= 1;
        if script[index].remaining == 0 {
            script.remove(index);
        }
        debug!(operation = ?operation, mode = ?mode, "Injected broker fault");
        Some(mode)
    }

    /// Number of scripted failures not yet consumed.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.script.lock().iter().map(|f| f.remaining).sum()
    }

    pub fn clear(&self) {
        self.script.lock().clear();
    }
}

// src/errors.rs
//
// The error taxonomy of §7. Each variant maps to exactly one row of the
// error-policy table; `backoff_hint`/`ack_policy` make that table a pure
// function of the variant instead of scattered call-site literals.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge (discard); the message will not be redelivered.
    Ack,
    /// Negatively acknowledge; the message becomes eligible for redelivery.
    Nack,
    /// Scheduling-internal error; the broker is never contacted.
    NotApplicable,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("malformed message payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("resource mismatch: need exceeds current availability")]
    ResourceMismatch,

    #[error("broker RPC timed out after {0:?}")]
    BrokerTimeout(Duration),

    #[error("lease extension failed: {0}")]
    LeaseExtendFailed(String),

    #[error("task runtime exited with status {exit_code}")]
    RuntimeFailed { exit_code: i32 },

    #[error("task runtime received an unrecoverable spec: {0}")]
    RuntimeUnrecoverable(String),

    #[error("scheduler handler panicked: {0}")]
    Panicked(String),

    #[error("resource ledger corrupted: {0}")]
    LedgerCorrupt(String),
}

impl RunnerError {
    /// Back-off duration to install for this error, if any. `None` means
    /// "the caller decides" (e.g. `RuntimeFailed`'s floor is contextual —
    /// see `Dispatcher`, which applies the Processor-reported duration).
    pub fn backoff_hint(&self) -> Option<Duration> {
        match self {
            RunnerError::Malformed(_) => Some(Duration::from_secs(1)),
            RunnerError::ResourceMismatch => Some(Duration::from_secs(60)),
            RunnerError::BrokerTimeout(_) => Some(Duration::from_secs(60)),
            RunnerError::LeaseExtendFailed(_) => None,
            RunnerError::RuntimeFailed { .. } => Some(Duration::from_secs(30)),
            RunnerError::RuntimeUnrecoverable(_) => Some(Duration::from_secs(300)),
            RunnerError::Panicked(_) => Some(Duration::from_secs(60)),
            RunnerError::LedgerCorrupt(_) => None,
        }
    }

    pub fn ack_policy(&self) -> AckPolicy {
        match self {
            RunnerError::Malformed(_) => AckPolicy::Ack,
            RunnerError::ResourceMismatch => AckPolicy::NotApplicable,
            RunnerError::BrokerTimeout(_) => AckPolicy::NotApplicable,
            RunnerError::LeaseExtendFailed(_) => AckPolicy::NotApplicable,
            RunnerError::RuntimeFailed { .. } => AckPolicy::Nack,
            RunnerError::RuntimeUnrecoverable(_) => AckPolicy::Ack,
            RunnerError::Panicked(_) => AckPolicy::Nack,
            RunnerError::LedgerCorrupt(_) => AckPolicy::NotApplicable,
        }
    }

    /// Doubles the back-off window for consecutive broker timeouts (the
    /// fixed reading of the doubling-policy open question), floored at 60s
    /// and capped to avoid runaway growth across a long outage.
    pub fn doubled_broker_backoff(consecutive_failures: u32) -> Duration {
        let secs = 60u64.saturating_mul(1u64 << consecutive_failures.min(10));
        Duration::from_secs(secs.min(3600))
    }
}

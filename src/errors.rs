//! Error taxonomy for capability operations.
//!
//! Local invariant violations (`InvalidTransition`) are rejected before any
//! syscall is attempted. Kernel-reported failures are never retried here;
//! retry policy belongs to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-thread outcome of one broadcast round. `errno` is zero on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadOutcome {
    pub tid: i32,
    pub errno: i32,
}

/// Best-effort account of which threads applied a broadcast operation and
/// which refused it, so the caller can decide whether partial state is
/// tolerable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub applied: Vec<i32>,
    pub failed: Vec<ThreadOutcome>,
}

impl std::fmt::Display for BroadcastReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} thread(s) applied, {} failed",
            self.applied.len(),
            self.failed.len()
        )?;
        for outcome in &self.failed {
            write!(f, "; tid {} errno {}", outcome.tid, outcome.errno)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CapError {
    /// The requested capability set violates a kernel-enforced invariant
    /// (e.g. Effective without Permitted). Never touches the kernel.
    #[error("invalid capability transition: {0}")]
    InvalidTransition(String),

    /// The kernel holds fewer permitted bits than the request needs.
    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    /// The kernel refused the syscall outright.
    #[error("kernel denied capability change: {0}")]
    Denied(nix::errno::Errno),

    /// A broadcast applied on some threads and failed on others. The process
    /// is in a mixed state the caller must resolve; it is never silently
    /// accepted here.
    #[error("capability change only partially applied: {0}")]
    PartialApplication(BroadcastReport),

    /// Broadcast rendezvous timed out or signaling failed. Kernel state is
    /// of unknown consistency; callers should treat this as fatal.
    #[error("thread synchronization failure: {0}")]
    ThreadSyncFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for capmux operations.
pub type Result<T> = std::result::Result<T, CapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_report_display_names_failing_threads() {
        let report = BroadcastReport {
            applied: vec![100, 101],
            failed: vec![ThreadOutcome { tid: 102, errno: 1 }],
        };
        let text = format!("{}", report);
        assert!(text.contains("2 thread(s) applied"));
        assert!(text.contains("tid 102 errno 1"));
    }

    #[test]
    fn partial_application_carries_report() {
        let err = CapError::PartialApplication(BroadcastReport {
            applied: vec![1],
            failed: vec![ThreadOutcome { tid: 2, errno: 13 }],
        });
        match err {
            CapError::PartialApplication(report) => {
                assert_eq!(report.applied, vec![1]);
                assert_eq!(report.failed[0].errno, 13);
            }
            other => panic!("unexpected error variant: {:?}", other),
        }
    }
}

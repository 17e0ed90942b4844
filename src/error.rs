//! Error types for the harness
//!
//! Two families live here. Plain `Error` types are returned through `Result`
//! and propagate with `?`. `HarnessFault` and `HarnessWarning` are serializable
//! records: they do not abort control flow by themselves but are collected by
//! the run controller and surfaced in the verdict metadata.

use serde::{Deserialize, Serialize};

use crate::history::Process;
use crate::phase::Phase;

/// Violations of the history log's append discipline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// The log was sealed by `snapshot()`; no further appends are accepted
    #[error("history log is sealed, rejected event from {process}")]
    Sealed { process: Process },
    /// A process invoked a second operation while one was still outstanding
    #[error("{process} invoked at index {index} while operation at index {outstanding} is outstanding")]
    DoubleInvoke {
        process: Process,
        index: u64,
        outstanding: u64,
    },
    /// A terminal event arrived for a process with nothing outstanding
    #[error("{process} completed at index {index} without an outstanding invocation")]
    CompletionWithoutInvoke { process: Process, index: u64 },
    /// A terminal event named a different action than its invocation
    #[error("{process} completed a different action at index {index} than it invoked at index {invoked}")]
    ActionMismatch {
        process: Process,
        index: u64,
        invoked: u64,
    },
    /// Sequence numbers are not strictly increasing (loaded histories only)
    #[error("event index {found} out of order, expected {expected}")]
    OutOfOrder { expected: u64, found: u64 },
}

/// Errors reported by a client adapter
///
/// `Rejected` and `Unsupported` are definite: the operation did not take
/// effect. Everything else is ambiguous.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The store affirmatively refused the operation
    #[error("rejected: {0}")]
    Rejected(String),
    /// The adapter cannot express this operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Request timed out
    #[error("timed out")]
    Timeout,
    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),
    /// The store answered with something the adapter could not interpret
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether the error proves the operation did not take effect
    pub fn is_definite(&self) -> bool {
        matches!(self, ClientError::Rejected(_) | ClientError::Unsupported(_))
    }
}

/// Errors reported by a nemesis control plane or database lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum NemesisError {
    /// An external command exited unsuccessfully
    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    /// An external command could not be spawned at all
    #[error("could not run `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    /// The fault references a node this control plane does not know
    #[error("unknown node {0}")]
    UnknownNode(String),
    /// The fault is not supported by this control plane
    #[error("unsupported fault: {0}")]
    Unsupported(String),
}

/// Errors from reading or writing persisted runs
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record in {path} line {line}: {source}")]
    Decode {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    NotFound(String),
}

/// Top-level error of a test run
///
/// Any of these means the test itself is unreliable, as opposed to the system
/// under test being incorrect.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("history invariant violated: {0}")]
    History(#[from] HistoryError),
    #[error("database lifecycle failed: {0}")]
    Database(String),
    #[error("nemesis setup failed: {0}")]
    Nemesis(#[from] NemesisError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A harness-level error recorded during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HarnessFault {
    /// Not every participant reached a phase barrier within the grace period
    BrokenBarrier {
        phase: Phase,
        arrived: usize,
        expected: usize,
    },
    /// A worker or the injector panicked or otherwise vanished
    ParticipantCrashed { process: Process, reason: String },
    /// The history log rejected an append
    HistoryInvariant { process: Process, reason: String },
    /// A worker could not open or set up its connection
    ClientUnavailable { process: Process, reason: String },
    /// The nemesis control plane failed to set up
    NemesisUnavailable { reason: String },
    /// A setup or teardown call did not return within the operation timeout
    Stalled { process: Process, stage: String },
    /// The database lifecycle failed after the run started
    Database { reason: String },
    /// The run was aborted by an operator signal or deadline
    Aborted { reason: String },
}

/// A harness-level anomaly that does not invalidate the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HarnessWarning {
    /// The injector could not heal a fault it introduced
    Unhealed { fault: String, reason: String },
    /// Connection teardown or close failed
    ClientTeardown { process: Process, reason: String },
    /// Nemesis teardown failed
    NemesisTeardown { reason: String },
}

//! The error taxonomy of the engine.

use crate::types::NodeId;
use crate::types::Term;

/// Errors surfaced by group operations.
///
/// Retryable I/O failures are retried in-process against the configured
/// backoff schedule before they ever reach a caller. Everything else is
/// surfaced directly. `LogGap` and quorum math inconsistencies halt the
/// group.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The request hit a non-leader, or a leader whose lease has expired.
    /// Carries the last-known leader id as a redirect hint.
    #[error("not leader, last known leader: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// The request carried a term below the local term.
    #[error("stale term: request term {request} < local term {local}")]
    StaleTerm { request: Term, local: Term },

    /// An append arrived with an index beyond the next expected index.
    /// Fatal for the group.
    #[error("log gap: first index {first} > next index {next}")]
    LogGap { first: u64, next: u64 },

    /// A log record failed CRC validation.
    #[error("log record checksum mismatch at position {pos}")]
    ChecksumFailure { pos: u64 },

    /// An underlying file operation failed after the retry schedule was
    /// exhausted.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// The group (or the whole engine) is stopping. Never retried.
    #[error("raft group is stopping")]
    Stopped,

    /// The user state machine failed; the group is halted.
    #[error("state machine failed: {0}")]
    StateMachine(#[source] anyhow::Error),

    /// The pending-writes or pending-bytes gate rejected the submission.
    #[error("too many pending writes")]
    Backpressure,

    /// The caller's deadline elapsed before the operation completed.
    #[error("deadline elapsed")]
    Timeout,

    /// The group previously hit a fatal error and rejects reads and writes.
    /// It still answers liveness queries so operators can observe it.
    #[error("raft group is in error state")]
    GroupError,

    /// An install-snapshot chunk arrived out of order.
    #[error("snapshot chunk mismatch: expect offset {expect}, got {got}")]
    SnapshotMismatch { expect: u64, got: u64 },

    #[error("{0}")]
    ConfigError(#[from] ConfigError),
}

impl RaftError {
    /// Whether this error is an expected shutdown signal rather than a bug
    /// or an operational failure.
    pub fn is_shutdown_signal(&self) -> bool {
        matches!(self, RaftError::Stopped)
    }
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors produced while validating a config.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Log a failure, classifying expected shutdown signals apart from
/// unexpected ones. Invariant breaches go through here with `bug=true`
/// before the group is halted.
pub(crate) fn record_failure(context: &str, err: &RaftError) {
    if err.is_shutdown_signal() {
        tracing::debug!(context, error=%err, "operation interrupted by shutdown");
    } else {
        tracing::error!(context, error=%err, "operation failed");
    }
}

//! The user state machine seam.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::types::LogItem;
use crate::types::Term;

/// Identifies the log prefix a snapshot covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: Term,
}

/// A snapshot being read for transfer to a lagging peer. Chunks come back
/// in order; `None` marks the end.
#[async_trait]
pub trait Snapshot: Send {
    fn meta(&self) -> SnapshotMeta;

    async fn read_next(&mut self) -> Result<Option<Bytes>>;
}

/// The replicated state machine of one group.
///
/// `exec` is invoked sequentially in index order; an error halts the
/// group. A snapshot install arrives as ordered `install_snapshot` chunks
/// and replaces the machine's state wholesale once the final chunk
/// (`done`) lands.
#[async_trait]
pub trait StateMachine: Send + 'static {
    /// Apply one committed entry and produce its response.
    async fn exec(&mut self, index: u64, term: Term, input: &LogItem) -> Result<Bytes>;

    /// Accept one chunk of a snapshot streamed from the leader. `offset`
    /// is the accumulated byte offset; `done` commits the install.
    async fn install_snapshot(
        &mut self,
        last_included_index: u64,
        last_included_term: Term,
        offset: u64,
        done: bool,
        data: &[u8],
    ) -> Result<()>;

    /// Produce a snapshot of the current state for transfer.
    async fn take_snapshot(&mut self) -> Result<Box<dyn Snapshot>>;

    /// Flush and release resources at group shutdown.
    async fn close(&mut self) -> Result<()>;
}

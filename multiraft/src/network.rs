//! The transport seam.
//!
//! The engine never opens sockets; an application supplies a
//! [`RaftNetwork`] that delivers the four RPCs to a target node. The
//! in-process router used by the integration tests and any real
//! transport both implement this trait.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::PingRequest;
use crate::raft::PingResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::types::NodeId;

/// Sends RPCs to peer nodes.
///
/// Errors are transport failures; protocol-level rejections travel inside
/// the response types.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// RAFT_PING: peer liveness and group readiness.
    async fn ping(&self, target: NodeId, req: PingRequest) -> Result<PingResponse>;

    /// RAFT_REQUEST_VOTE: pre-vote and vote.
    async fn vote(&self, target: NodeId, req: VoteRequest) -> Result<VoteResponse>;

    /// RAFT_APPEND_ENTRIES: replication and heartbeats.
    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// RAFT_INSTALL_SNAPSHOT: snapshot chunk streaming.
    async fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

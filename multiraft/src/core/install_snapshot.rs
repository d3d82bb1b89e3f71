//! The follower side of snapshot installation.

use crate::core::RaftCore;
use crate::core::SnapshotRecv;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::types::MessageSummary;
use crate::types::Role;

impl<N: RaftNetwork> RaftCore<N> {
    /// Accept one chunk of a snapshot stream from the leader.
    ///
    /// Chunks arrive in order with accumulated offsets. A chunk at offset
    /// zero starts (or restarts) a stream; the final chunk commits the
    /// install: the state machine is replaced, `lastApplied` jumps to the
    /// snapshot boundary and the log restarts past it.
    #[tracing::instrument(level = "debug", skip(self, req), fields(group = self.group_id, req = %req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }

        self.update_current_term(req.term, None).await?;
        if self.role.is_leader() || self.role.is_candidate() {
            self.set_role(Role::Follower);
        }
        if self.current_leader != Some(req.leader_id) {
            self.current_leader = Some(req.leader_id);
            self.publish_status();
        }
        self.reset_election_deadline(true);

        let matches_stream = self.snapshot_recv.as_ref().map(|s| {
            s.last_included_index == req.last_included_index
                && s.last_included_term == req.last_included_term
                && s.offset == req.offset
        });
        match matches_stream {
            None | Some(false) if req.offset == 0 => {
                // A new stream begins; drop any stale one.
                self.snapshot_recv = Some(SnapshotRecv {
                    last_included_index: req.last_included_index,
                    last_included_term: req.last_included_term,
                    offset: 0,
                });
            }
            Some(true) => {}
            _ => {
                let expect = self.snapshot_recv.as_ref().map(|s| s.offset).unwrap_or(0);
                tracing::warn!(
                    group = self.group_id,
                    expect,
                    got = req.offset,
                    "out of order snapshot chunk rejected"
                );
                return Err(crate::error::RaftError::SnapshotMismatch {
                    expect,
                    got: req.offset,
                });
            }
        }

        self.sm
            .install_snapshot(
                req.last_included_index,
                req.last_included_term,
                req.offset,
                req.done,
                &req.data,
            )
            .await
            .map_err(crate::error::RaftError::StateMachine)?;

        if req.done {
            self.finalize_snapshot_install(&req).await?;
        } else if let Some(stream) = self.snapshot_recv.as_mut() {
            stream.offset = req.offset + req.data.len() as u64;
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    async fn finalize_snapshot_install(&mut self, req: &InstallSnapshotRequest) -> RaftResult<()> {
        self.snapshot_recv = None;
        self.log
            .reset_to(req.last_included_index, req.last_included_term)
            .await?;
        self.last_log_index = req.last_included_index;
        self.last_log_term = req.last_included_term;
        self.last_persist_index = req.last_included_index;
        self.last_persist_term = req.last_included_term;
        self.last_applied = req.last_included_index;
        self.commit_index = self.commit_index.max(req.last_included_index);
        // Snapshot boundaries are durable points; materialize the commit.
        self.save_status().await?;
        self.publish_status();
        tracing::info!(
            group = self.group_id,
            last_included = req.last_included_index,
            term = req.last_included_term,
            "snapshot installed"
        );
        Ok(())
    }
}

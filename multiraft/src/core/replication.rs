//! The leader role: replication fan-out, lease upkeep and commit
//! advancement.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::fiber::FiberChannel;
use crate::network::RaftNetwork;
use crate::raft::GroupMsg;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::types::NodeId;
use crate::types::Role;

/// Volatile leader state: one replication stream per peer plus the event
/// channel they report into.
pub(crate) struct LeaderState<'a, N: RaftNetwork> {
    core: &'a mut RaftCore<N>,
    repl_rx: FiberChannel<ReplicaEvent>,
    streams: HashMap<NodeId, ReplicationStream>,
}

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    pub(crate) fn new(core: &'a mut RaftCore<N>) -> Self {
        Self {
            core,
            repl_rx: FiberChannel::new(),
            streams: HashMap::new(),
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(group = self.core.group_id, raft_state = "leader"))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        let core = &mut *self.core;
        core.members.reset_for_leader(core.last_log_index);
        core.current_leader = Some(core.node_id);
        // Vote grants already recorded confirm times; a fresh lease can
        // start from them.
        core.lease_end = core.members.lease_end(core.config.elect_timeout);
        tracing::info!(group = core.group_id, term = core.current_term, "assumed leadership");

        for target in core.members.replicate_targets() {
            let stream = ReplicationStream::spawn(
                &core.group,
                core.group_id,
                core.node_id,
                target,
                core.current_term,
                core.config.clone(),
                core.network.clone(),
                core.log.clone(),
                core.last_log_index,
                core.commit_index,
                self.repl_rx.clone(),
            );
            self.streams.insert(target, stream);
        }

        // Anchor the new term with an empty entry; nothing from an older
        // term may be counted committed until this one is.
        let item = self.core.append_term_start().await?;
        self.broadcast(|| RaftEvent::Replicate {
            item: item.clone(),
            commit_index: self.core.commit_index,
        });
        self.advance_commit().await?;
        self.core.publish_status();

        loop {
            if !self.core.role.is_leader() {
                self.terminate_streams();
                return Ok(());
            }
            tokio::select! {
                msg = self.core.rx_api.recv() => match msg {
                    Some(GroupMsg::Submit { req, completer, guard }) => {
                        if let Some(item) = self.core.append_submit(req, completer, guard).await? {
                            self.broadcast(|| RaftEvent::Replicate {
                                item: item.clone(),
                                commit_index: self.core.commit_index,
                            });
                            self.advance_commit().await?;
                            self.core.publish_status();
                        }
                    }
                    Some(GroupMsg::ReadIndex { deadline, tx }) => {
                        self.core.handle_read_index(deadline, tx);
                    }
                    Some(msg) => self.core.handle_msg_default(msg).await?,
                    None => self.core.set_role(Role::Shutdown),
                },
                ev = self.repl_rx.recv() => {
                    if let Ok(ev) = ev {
                        self.handle_replica_event(ev).await?;
                    }
                }
                _ = tokio::time::sleep(self.core.config.heartbeat_interval) => {
                    self.refresh_lease();
                }
                _ = self.core.group.stopped() => self.core.set_role(Role::Shutdown),
            }
        }
    }

    fn broadcast(&self, make: impl Fn() -> RaftEvent) {
        for stream in self.streams.values() {
            stream.event_tx.send(make());
        }
    }

    fn terminate_streams(&mut self) {
        for stream in self.streams.values() {
            tracing::debug!(group = self.core.group_id, target = stream.target, "terminating replication stream");
            stream.event_tx.send(RaftEvent::Terminate);
        }
        self.streams.clear();
    }

    /// Recompute the lease from confirm times; losing it deposes us.
    fn refresh_lease(&mut self) {
        let lease = self.core.members.lease_end(self.core.config.elect_timeout);
        if self.core.lease_end != lease {
            self.core.lease_end = lease;
            self.core.publish_status();
        }
        let expired = match lease {
            Some(end) => Instant::now() >= end,
            None => true,
        };
        if expired && self.core.members.voting_total() > 1 {
            tracing::warn!(group = self.core.group_id, term = self.core.current_term, "lease lost, stepping down");
            self.core.set_role(Role::Follower);
        }
    }

    async fn handle_replica_event(&mut self, ev: ReplicaEvent) -> RaftResult<()> {
        match ev {
            ReplicaEvent::Confirm {
                target,
                match_index,
                sent_at,
            } => {
                self.core.members.record_confirm(target, sent_at);
                self.core.members.update_match(target, match_index);
                self.refresh_lease();
                self.advance_commit().await?;
            }
            ReplicaEvent::HigherTerm { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(group = self.core.group_id, target, term, "peer has higher term, stepping down");
                    self.core.update_current_term(term, None).await?;
                    self.core.current_leader = None;
                    self.core.set_role(Role::Follower);
                }
            }
            ReplicaEvent::NeedsSnapshot { target, tx } => {
                tracing::info!(group = self.core.group_id, target, "peer needs a snapshot");
                match self.core.sm.take_snapshot().await {
                    Ok(snapshot) => tx.complete(snapshot),
                    Err(err) => {
                        tracing::error!(group = self.core.group_id, error = %err, "take_snapshot failed");
                        tx.fail(crate::error::RaftError::StateMachine(err));
                    }
                }
            }
            ReplicaEvent::SnapshotState { target, installing } => {
                self.core.members.set_installing_snapshot(target, installing);
            }
        }
        Ok(())
    }

    /// Advance the commit index to the largest index replicated on an
    /// rw-quorum, provided that entry is from the current term, then
    /// apply.
    async fn advance_commit(&mut self) -> RaftResult<()> {
        let quorum_index = self.core.members.quorum_match_index(self.core.last_log_index);
        if quorum_index <= self.core.commit_index {
            return Ok(());
        }
        if self.core.log.term_of(quorum_index).await? != Some(self.core.current_term) {
            return Ok(());
        }
        self.core.commit_index = quorum_index;
        // Keep the index durable through the commit point so restart can
        // trust it.
        self.core.log.flush_index(quorum_index).await?;
        self.broadcast(|| RaftEvent::UpdateCommitIndex {
            commit_index: self.core.commit_index,
        });
        self.core.drive_apply().await?;
        Ok(())
    }
}

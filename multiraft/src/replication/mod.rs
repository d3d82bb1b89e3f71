//! Per-peer replication streams.
//!
//! The leader runs one fiber per peer. A stream owns the peer's
//! `nextIndex`, reads batches straight from the shared log, and reports
//! progress back to the leader over an in-group channel. Requests are
//! never stacked: the next payload goes out only after the previous
//! response, so delivery stays ordered.

use std::sync::Arc;

use tokio::time::Instant;

use crate::config::RaftConfig;
use crate::error::record_failure;
use crate::fiber::Completer;
use crate::fiber::FiberChannel;
use crate::fiber::FiberFuture;
use crate::fiber::FiberGroup;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotRequest;
use crate::state_machine::Snapshot;
use crate::store::RaftLog;
use crate::types::GroupId;
use crate::types::LogItem;
use crate::types::NodeId;
use crate::types::Term;

/// Commands from the leader to a stream.
pub(crate) enum RaftEvent {
    /// A freshly appended entry; its index is the new last log index.
    Replicate { item: Arc<LogItem>, commit_index: u64 },
    UpdateCommitIndex { commit_index: u64 },
    Terminate,
}

/// Progress reports from a stream to the leader.
pub(crate) enum ReplicaEvent {
    /// The peer acknowledged entries up to `match_index`; the request was
    /// sent at `sent_at` (feeds the lease).
    Confirm {
        target: NodeId,
        match_index: u64,
        sent_at: Instant,
    },
    /// The peer answered with a term above ours.
    HigherTerm { target: NodeId, term: Term },
    /// The peer's next entry was reclaimed; the stream needs a snapshot.
    NeedsSnapshot {
        target: NodeId,
        tx: Completer<Box<dyn Snapshot>>,
    },
    /// The stream entered or left install-snapshot mode.
    SnapshotState { target: NodeId, installing: bool },
}

/// Handle held by the leader for one spawned stream.
pub(crate) struct ReplicationStream {
    pub target: NodeId,
    pub event_tx: FiberChannel<RaftEvent>,
}

impl ReplicationStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<N: RaftNetwork>(
        group: &FiberGroup,
        group_id: GroupId,
        node_id: NodeId,
        target: NodeId,
        term: Term,
        config: Arc<RaftConfig>,
        network: Arc<N>,
        log: RaftLog,
        last_log_index: u64,
        commit_index: u64,
        core_tx: FiberChannel<ReplicaEvent>,
    ) -> Self {
        let event_tx = FiberChannel::new();
        let core = ReplicationCore {
            group_id,
            node_id,
            target,
            term,
            config,
            network,
            log,
            rx: event_tx.clone(),
            core_tx,
            next_index: last_log_index + 1,
            match_index: 0,
            last_log_index,
            commit_index,
            terminated: false,
        };
        group.spawn_daemon(format!("repl-{}", target), core.main());
        Self { target, event_tx }
    }
}

struct ReplicationCore<N: RaftNetwork> {
    group_id: GroupId,
    node_id: NodeId,
    target: NodeId,
    /// The leader's term; fixed for the stream's lifetime.
    term: Term,
    config: Arc<RaftConfig>,
    network: Arc<N>,
    log: RaftLog,
    rx: FiberChannel<RaftEvent>,
    core_tx: FiberChannel<ReplicaEvent>,
    next_index: u64,
    match_index: u64,
    last_log_index: u64,
    commit_index: u64,
    terminated: bool,
}

impl<N: RaftNetwork> ReplicationCore<N> {
    #[tracing::instrument(level = "trace", skip(self), fields(group = self.group_id, target = self.target, term = self.term))]
    async fn main(mut self) {
        tracing::debug!("replication stream started");
        // Establish contact with an immediate heartbeat.
        self.send_append(true).await;
        loop {
            self.drain_events();
            if self.terminated {
                return;
            }
            if self.next_index < self.log.first_index() {
                let before = self.next_index;
                self.stream_snapshot().await;
                if self.next_index == before {
                    self.idle_wait().await;
                }
                continue;
            }
            if self.next_index <= self.last_log_index {
                let progressed = self.send_append(false).await;
                if !progressed {
                    // Back off instead of hammering an unreachable peer.
                    self.idle_wait().await;
                }
                continue;
            }
            self.idle_wait().await;
            if self.terminated {
                return;
            }
            self.send_append(true).await;
        }
    }

    /// Wait for new work or the next heartbeat slot.
    async fn idle_wait(&mut self) {
        tokio::select! {
            ev = self.rx.recv() => match ev {
                Ok(ev) => self.on_event(ev),
                Err(_) => self.terminated = true,
            },
            _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
        }
    }

    fn drain_events(&mut self) {
        while let Some(ev) = self.rx.try_recv() {
            self.on_event(ev);
        }
    }

    fn on_event(&mut self, ev: RaftEvent) {
        match ev {
            RaftEvent::Replicate { item, commit_index } => {
                self.last_log_index = item.index;
                self.commit_index = commit_index;
            }
            RaftEvent::UpdateCommitIndex { commit_index } => {
                self.commit_index = commit_index;
            }
            RaftEvent::Terminate => self.terminated = true,
        }
    }

    /// One AppendEntries round-trip. Returns true if the peer responded.
    async fn send_append(&mut self, heartbeat_only: bool) -> bool {
        let prev_log_index = self.next_index - 1;
        let prev_log_term = match self.log.term_of(prev_log_index).await {
            Ok(Some(term)) => term,
            Ok(None) if prev_log_index == 0 => 0,
            Ok(None) => {
                // The prefix was reclaimed under us; switch to snapshot.
                self.next_index = self.log.first_index().saturating_sub(1).max(1);
                return true;
            }
            Err(err) => {
                record_failure("replication prev term lookup", &err);
                return false;
            }
        };

        let entries = if heartbeat_only {
            Vec::new()
        } else {
            match self
                .log
                .read(
                    self.next_index,
                    self.config.max_replicate_items as usize,
                    self.config.max_body_size,
                )
                .await
            {
                Ok(items) => items,
                Err(err) => {
                    record_failure("replication log read", &err);
                    return false;
                }
            }
        };
        let batch_len = entries.len() as u64;

        let req = AppendEntriesRequest {
            group_id: self.group_id,
            term: self.term,
            leader_id: self.node_id,
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        };
        let sent_at = Instant::now();
        let resp = match tokio::time::timeout(
            self.config.rpc_timeout,
            self.network.append_entries(self.target, req),
        )
        .await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                tracing::debug!(group = self.group_id, target = self.target, error = %err, "append entries rpc failed");
                return false;
            }
            Err(_) => {
                tracing::debug!(group = self.group_id, target = self.target, "append entries rpc timed out");
                return false;
            }
        };

        if resp.term > self.term {
            self.core_tx.send(ReplicaEvent::HigherTerm {
                target: self.target,
                term: resp.term,
            });
            self.terminated = true;
            return true;
        }

        if resp.success {
            let acked = prev_log_index + batch_len;
            self.match_index = self.match_index.max(acked);
            self.next_index = self.match_index + 1;
            self.core_tx.send(ReplicaEvent::Confirm {
                target: self.target,
                match_index: self.match_index,
                sent_at,
            });
        } else {
            // Rewind to where the peer says its log still matches ours.
            let suggested = resp
                .suggested_next_index
                .clamp(1, self.last_log_index + 1);
            tracing::debug!(
                group = self.group_id,
                target = self.target,
                from = self.next_index,
                to = suggested,
                "rewinding next index"
            );
            self.next_index = suggested;
        }
        true
    }

    /// Fetch a snapshot from the leader's state machine and stream it to
    /// the peer, then resume log replication past it.
    async fn stream_snapshot(&mut self) {
        self.core_tx.send(ReplicaEvent::SnapshotState {
            target: self.target,
            installing: true,
        });
        let (fut, completer) = FiberFuture::new();
        self.core_tx.send(ReplicaEvent::NeedsSnapshot {
            target: self.target,
            tx: completer,
        });
        let mut snapshot = match fut.await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                record_failure("fetch snapshot for peer", &err);
                self.finish_snapshot(false).await;
                return;
            }
        };
        let meta = snapshot.meta();
        tracing::info!(
            group = self.group_id,
            target = self.target,
            last_included = meta.last_included_index,
            "streaming snapshot to peer"
        );

        let mut offset = 0u64;
        let mut last_sent: Option<Instant> = None;
        loop {
            let chunk = match snapshot.read_next().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(group = self.group_id, target = self.target, error = %err, "snapshot read failed");
                    self.finish_snapshot(false).await;
                    return;
                }
            };
            let (data, done) = match chunk {
                Some(data) => (data, false),
                None => (bytes::Bytes::new(), true),
            };
            let req = InstallSnapshotRequest {
                group_id: self.group_id,
                term: self.term,
                leader_id: self.node_id,
                last_included_index: meta.last_included_index,
                last_included_term: meta.last_included_term,
                offset,
                data: data.clone(),
                done,
            };
            let sent_at = Instant::now();
            last_sent = Some(sent_at);
            let resp = match tokio::time::timeout(
                self.config.rpc_timeout,
                self.network.install_snapshot(self.target, req),
            )
            .await
            {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    tracing::debug!(group = self.group_id, target = self.target, error = %err, "install snapshot rpc failed");
                    self.finish_snapshot(false).await;
                    return;
                }
                Err(_) => {
                    tracing::debug!(group = self.group_id, target = self.target, "install snapshot rpc timed out");
                    self.finish_snapshot(false).await;
                    return;
                }
            };
            if resp.term > self.term {
                self.core_tx.send(ReplicaEvent::HigherTerm {
                    target: self.target,
                    term: resp.term,
                });
                self.terminated = true;
                return;
            }
            if !resp.success {
                tracing::warn!(group = self.group_id, target = self.target, "peer rejected snapshot chunk");
                self.finish_snapshot(false).await;
                return;
            }
            offset += data.len() as u64;
            if done {
                break;
            }
        }

        self.match_index = self.match_index.max(meta.last_included_index);
        self.next_index = meta.last_included_index + 1;
        self.core_tx.send(ReplicaEvent::Confirm {
            target: self.target,
            match_index: self.match_index,
            sent_at: last_sent.unwrap_or_else(Instant::now),
        });
        self.finish_snapshot(true).await;
    }

    async fn finish_snapshot(&mut self, ok: bool) {
        self.core_tx.send(ReplicaEvent::SnapshotState {
            target: self.target,
            installing: false,
        });
        if !ok {
            // Cool off before the next attempt.
            self.idle_wait().await;
        }
    }
}

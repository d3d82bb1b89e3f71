//! The core logic of one consensus group.
//!
//! A `RaftCore` runs as one fiber on its group's dispatcher thread and is
//! the only writer of the group's state. It assumes a role, delegates to
//! the matching role loop, and switches when the loop returns.

mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::config::GroupConfig;
use crate::config::RaftConfig;
use crate::error::record_failure;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::Completer;
use crate::fiber::FiberGroup;
use crate::fiber::RetrySchedule;
use crate::membership::MemberManager;
use crate::metrics::ShareStatus;
use crate::network::RaftNetwork;
use crate::raft::GroupMsg;
use crate::raft::PendingGuard;
use crate::raft::SubmitResponse;
use crate::state_machine::StateMachine;
use crate::store::status_path;
use crate::store::RaftLog;
use crate::store::StatusFile;
use crate::store::StatusRecord;
use crate::types::GroupId;
use crate::types::LogItem;
use crate::types::NodeId;
use crate::types::Role;
use crate::types::Term;

use replication::LeaderState;

/// How often the reclamation daemon wakes to check markers.
const RECLAIM_TICK: Duration = Duration::from_secs(1);

/// An in-flight proposal parked in the tail cache until apply completes
/// it.
pub(crate) struct RaftTask {
    pub item: Arc<LogItem>,
    pub completer: Completer<SubmitResponse>,
    _guard: PendingGuard,
}

impl RaftTask {
    pub fn new(item: Arc<LogItem>, completer: Completer<SubmitResponse>, guard: PendingGuard) -> Self {
        Self {
            item,
            completer,
            _guard: guard,
        }
    }
}

/// Progress of a snapshot being streamed in from the leader.
pub(crate) struct SnapshotRecv {
    pub last_included_index: u64,
    pub last_included_term: Term,
    pub offset: u64,
}

pub(crate) struct RaftCore<N: RaftNetwork> {
    pub(crate) group_id: GroupId,
    pub(crate) node_id: NodeId,
    pub(crate) config: Arc<RaftConfig>,
    pub(crate) group_config: GroupConfig,
    pub(crate) network: Arc<N>,
    pub(crate) group: FiberGroup,
    pub(crate) schedule: RetrySchedule,
    pub(crate) members: MemberManager,
    pub(crate) log: RaftLog,
    pub(crate) status_file: StatusFile,
    pub(crate) sm: Box<dyn StateMachine>,

    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) last_log_index: u64,
    pub(crate) last_log_term: Term,
    pub(crate) last_persist_index: u64,
    pub(crate) last_persist_term: Term,
    pub(crate) lease_end: Option<Instant>,
    /// When the election clock next fires.
    pub(crate) election_deadline: Instant,
    /// Last time a current leader was heard from; gates pre-vote grants.
    pub(crate) last_leader_contact: Option<Instant>,
    /// Monotonic id of the running election round; stale vote responses
    /// are dropped on mismatch.
    pub(crate) vote_id: u64,
    /// Index of the entry this leader appended when taking office.
    pub(crate) first_commit_of_term: Option<u64>,
    pub(crate) tail_cache: BTreeMap<u64, RaftTask>,
    pub(crate) snapshot_recv: Option<SnapshotRecv>,
    pub(crate) error: bool,

    pub(crate) rx_api: mpsc::UnboundedReceiver<GroupMsg>,
    pub(crate) status_tx: watch::Sender<ShareStatus>,
}

impl<N: RaftNetwork> RaftCore<N> {
    /// Open the store, recover, and assemble the core. Runs inside the
    /// group's first fiber.
    pub(crate) async fn init(
        group: FiberGroup,
        config: Arc<RaftConfig>,
        group_config: GroupConfig,
        network: Arc<N>,
        sm: Box<dyn StateMachine>,
        rx_api: mpsc::UnboundedReceiver<GroupMsg>,
        status_tx: watch::Sender<ShareStatus>,
    ) -> RaftResult<Self> {
        let schedule = RetrySchedule::new(config.io_retry_interval.clone());
        let (status_file, record) =
            StatusFile::open(&group, &schedule, status_path(&group_config.data_dir)).await?;
        let (log, recovered) =
            RaftLog::open(group.clone(), schedule.clone(), &group_config, record.commit_index).await?;

        let members = MemberManager::new(
            config.node_id,
            &group_config.node_ids,
            &group_config.observer_ids,
        );
        members.spawn_ping_fibers(&group, network.clone(), config.clone(), group_config.group_id);
        log.spawn_reclaim_fiber(RECLAIM_TICK);

        let role = if members.self_voting() {
            Role::Follower
        } else {
            Role::Observer
        };
        // Entries below the retained prefix are covered by the state
        // machine's own snapshot; replay resumes from there.
        let last_applied = recovered.first_index.saturating_sub(1);

        let mut core = Self {
            group_id: group_config.group_id,
            node_id: config.node_id,
            election_deadline: Instant::now() + config.rand_elect_timeout(),
            config,
            group_config,
            network,
            group,
            schedule,
            members,
            log,
            status_file,
            sm,
            role,
            current_term: record.current_term,
            voted_for: record.voted_for,
            current_leader: None,
            commit_index: record.commit_index,
            last_applied,
            last_log_index: recovered.last_index,
            last_log_term: recovered.last_term,
            last_persist_index: recovered.last_index,
            last_persist_term: recovered.last_term,
            lease_end: None,
            last_leader_contact: None,
            vote_id: 0,
            first_commit_of_term: None,
            tail_cache: BTreeMap::new(),
            snapshot_recv: None,
            error: false,
            rx_api,
            status_tx,
        };
        tracing::info!(
            group = core.group_id,
            node = core.node_id,
            term = core.current_term,
            last_log = core.last_log_index,
            commit = core.commit_index,
            role = ?core.role,
            "raft group initialized"
        );
        core.publish_status();
        Ok(core)
    }

    /// The main loop: delegate to the current role until shutdown.
    #[tracing::instrument(level = "debug", skip(self), fields(group = self.group_id, node = self.node_id))]
    pub(crate) async fn main(mut self) {
        loop {
            let res = match self.role {
                Role::Leader => LeaderState::new(&mut self).run().await,
                Role::Candidate => self.candidate_loop().await,
                Role::Follower => self.follower_loop().await,
                Role::Observer => self.observer_loop().await,
                Role::Shutdown => break,
            };
            if let Err(err) = res {
                record_failure("role loop", &err);
                if err.is_shutdown_signal() {
                    self.set_role(Role::Shutdown);
                } else {
                    self.enter_error_state().await;
                }
            }
        }
        self.shutdown_cleanup().await;
    }

    /// A fatal error parks the group: reads and writes are rejected, but
    /// the group keeps answering messages so operators can observe it.
    async fn enter_error_state(&mut self) {
        self.error = true;
        self.fail_tail_cache(|| RaftError::GroupError);
        self.publish_status();
        tracing::error!(group = self.group_id, "group entered error state");
        loop {
            tokio::select! {
                msg = self.rx_api.recv() => match msg {
                    Some(msg) => self.reject_msg(msg),
                    None => break,
                },
                _ = self.group.stopped() => break,
            }
        }
        self.set_role(Role::Shutdown);
    }

    fn reject_msg(&mut self, msg: GroupMsg) {
        match msg {
            GroupMsg::AppendEntries { tx, .. } => {
                let _ = tx.send(Err(RaftError::GroupError));
            }
            GroupMsg::Vote { tx, .. } => {
                let _ = tx.send(Err(RaftError::GroupError));
            }
            GroupMsg::InstallSnapshot { tx, .. } => {
                let _ = tx.send(Err(RaftError::GroupError));
            }
            GroupMsg::Submit { completer, .. } => completer.fail(RaftError::GroupError),
            GroupMsg::ReadIndex { tx, .. } => {
                let _ = tx.send(Err(RaftError::GroupError));
            }
            GroupMsg::WaitReady { completer, .. } => completer.fail(RaftError::GroupError),
            GroupMsg::Compact { .. } | GroupMsg::CompactByTime { .. } => {}
        }
    }

    async fn shutdown_cleanup(&mut self) {
        self.role = Role::Shutdown;
        self.fail_tail_cache(|| RaftError::Stopped);
        // Materialize the commit index so restart can scan from it.
        let record = StatusRecord {
            current_term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        };
        if let Err(err) = self.status_file.persist(&self.group, &self.schedule, record).await {
            record_failure("persist status at shutdown", &err);
        }
        if let Err(err) = self.log.close().await {
            record_failure("close log", &err);
        }
        if let Err(err) = self.sm.close().await {
            tracing::warn!(error = %err, "state machine close failed");
        }
        self.publish_status();
        self.group.request_stop();
        tracing::info!(
            group = self.group_id,
            term = self.current_term,
            commit = self.commit_index,
            applied = self.last_applied,
            persisted = self.last_persist_index,
            persisted_term = self.last_persist_term,
            "raft group shut down"
        );
    }

    //////////////////////////////////////////////////////////////////////
    // Role plumbing

    /// Update the role, honoring the observer restriction.
    pub(crate) fn set_role(&mut self, role: Role) {
        let role = if role == Role::Follower && !self.members.self_voting() {
            Role::Observer
        } else {
            role
        };
        if self.role != role {
            tracing::info!(group = self.group_id, node = self.node_id, from = ?self.role, to = ?role, term = self.current_term, "role change");
            self.role = role;
            if !role.is_leader() {
                self.lease_end = None;
                self.first_commit_of_term = None;
                let leader = self.current_leader;
                self.fail_tail_cache(move || RaftError::NotLeader { leader });
            }
            self.publish_status();
        }
    }

    /// Adopt a higher term observed from a peer, clearing the vote.
    pub(crate) async fn update_current_term(&mut self, new_term: Term, voted_for: Option<NodeId>) -> RaftResult<()> {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
            self.save_status().await?;
        }
        Ok(())
    }

    pub(crate) async fn save_status(&mut self) -> RaftResult<()> {
        let record = StatusRecord {
            current_term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        };
        self.status_file.persist(&self.group, &self.schedule, record).await
    }

    /// Push back the election clock; `heard_from_leader` also refreshes
    /// the pre-vote quiet window.
    pub(crate) fn reset_election_deadline(&mut self, heard_from_leader: bool) {
        self.election_deadline = Instant::now() + self.config.rand_elect_timeout();
        if heard_from_leader {
            self.last_leader_contact = Some(Instant::now());
        }
    }

    pub(crate) fn fail_tail_cache(&mut self, err: impl Fn() -> RaftError) {
        if self.tail_cache.is_empty() {
            return;
        }
        tracing::debug!(group = self.group_id, n = self.tail_cache.len(), "aborting pending proposals");
        for (_, task) in std::mem::take(&mut self.tail_cache) {
            task.completer.fail(err());
        }
    }

    /// Drop aborted proposals above (and including) `from`; a follower
    /// truncated our tail away.
    pub(crate) fn abort_tail_cache_from(&mut self, from: u64) {
        let aborted = self.tail_cache.split_off(&from);
        for (_, task) in aborted {
            task.completer.fail(RaftError::NotLeader {
                leader: self.current_leader,
            });
        }
    }

    pub(crate) fn publish_status(&self) {
        let status = ShareStatus {
            group_id: self.group_id,
            node_id: self.node_id,
            role: self.role,
            current_term: self.current_term,
            current_leader: self.current_leader,
            last_log_index: self.last_log_index,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            lease_end: self.lease_end,
            first_commit_of_term: self.first_commit_of_term,
            error: self.error,
        };
        let _ = self.status_tx.send(status);
    }

    //////////////////////////////////////////////////////////////////////
    // Role loops (follower / observer; candidate lives in vote.rs and
    // leader in replication.rs)

    async fn follower_loop(&mut self) -> RaftResult<()> {
        self.publish_status();
        loop {
            if !self.role.is_follower() {
                return Ok(());
            }
            let deadline = self.election_deadline;
            tokio::select! {
                _ = sleep_until(deadline) => {
                    if self.run_pre_vote().await? {
                        self.set_role(Role::Candidate);
                    }
                }
                msg = self.rx_api.recv() => match msg {
                    Some(msg) => self.handle_msg_default(msg).await?,
                    None => self.set_role(Role::Shutdown),
                },
                _ = self.group.stopped() => self.set_role(Role::Shutdown),
            }
        }
    }

    async fn observer_loop(&mut self) -> RaftResult<()> {
        self.publish_status();
        loop {
            if !self.role.is_observer() {
                return Ok(());
            }
            tokio::select! {
                msg = self.rx_api.recv() => match msg {
                    Some(msg) => self.handle_msg_default(msg).await?,
                    None => self.set_role(Role::Shutdown),
                },
                _ = self.group.stopped() => self.set_role(Role::Shutdown),
            }
        }
    }

    /// Message handling shared by every non-leader role.
    pub(crate) async fn handle_msg_default(&mut self, msg: GroupMsg) -> RaftResult<()> {
        match msg {
            GroupMsg::AppendEntries { rpc, tx } => {
                let res = self.handle_append_entries_request(rpc).await;
                self.forward_fatal(&res)?;
                let _ = tx.send(res);
            }
            GroupMsg::Vote { rpc, tx } => {
                let res = self.handle_vote_request(rpc).await;
                self.forward_fatal(&res)?;
                let _ = tx.send(res);
            }
            GroupMsg::InstallSnapshot { rpc, tx } => {
                let res = self.handle_install_snapshot_request(rpc).await;
                self.forward_fatal(&res)?;
                let _ = tx.send(res);
            }
            GroupMsg::Submit { completer, guard, .. } => {
                drop(guard);
                completer.fail(RaftError::NotLeader {
                    leader: self.current_leader,
                });
            }
            GroupMsg::ReadIndex { tx, .. } => {
                let _ = tx.send(Err(RaftError::NotLeader {
                    leader: self.current_leader,
                }));
            }
            GroupMsg::WaitReady { members, completer } => {
                self.spawn_ready_waiter(members, completer);
            }
            GroupMsg::Compact { max_index } => {
                // Never reclaim past what the state machine's snapshot
                // covers.
                let bound = max_index.min(self.last_applied);
                self.log
                    .mark_truncate_by_index(bound, self.commit_index, self.group_config.delete_delay);
            }
            GroupMsg::CompactByTime { timestamp } => {
                self.log
                    .mark_truncate_by_timestamp(timestamp, self.group_config.delete_delay);
            }
        }
        Ok(())
    }

    /// Storage failures inside RPC handlers are fatal for the group even
    /// though the RPC itself gets an error response.
    fn forward_fatal<T>(&self, res: &RaftResult<T>) -> RaftResult<()> {
        match res {
            Err(RaftError::Io(e)) => Err(RaftError::Io(std::io::Error::new(e.kind(), e.to_string()))),
            Err(RaftError::LogGap { first, next }) => Err(RaftError::LogGap {
                first: *first,
                next: *next,
            }),
            Err(RaftError::ChecksumFailure { pos }) => Err(RaftError::ChecksumFailure { pos: *pos }),
            _ => Ok(()),
        }
    }

    pub(crate) fn spawn_ready_waiter(&self, members: usize, completer: Completer<()>) {
        let fut = self.members.ready_future(members);
        self.group.spawn_daemon("ready-waiter", async move {
            match fut.await {
                Ok(()) => completer.complete(()),
                Err(err) => completer.fail(err),
            }
        });
    }

    pub(crate) fn now_millis(&self) -> u64 {
        use std::time::SystemTime;
        use std::time::UNIX_EPOCH;
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

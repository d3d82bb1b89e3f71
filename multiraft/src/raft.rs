//! Public engine interface: RPC types, the per-group handle and the
//! multi-group server.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::GroupConfig;
use crate::config::RaftConfig;
use crate::core::RaftCore;
use crate::error::record_failure;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::Completer;
use crate::fiber::Dispatcher;
use crate::fiber::FiberFuture;
use crate::fiber::FiberGroupHandle;
use crate::metrics::ShareStatus;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;
use crate::types::GroupId;
use crate::types::LogItem;
use crate::types::MessageSummary;
use crate::types::NodeId;
use crate::types::Term;

//////////////////////////////////////////////////////////////////////////////////////////////////

/// RAFT_PING: liveness probe between peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub group_id: GroupId,
    pub node_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub node_id: NodeId,
    pub group_ready: bool,
}

/// RAFT_REQUEST_VOTE, both the pre-vote probe and the real vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub group_id: GroupId,
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
    /// A pre-vote carries `term = currentTerm + 1` without the candidate
    /// having incremented anything.
    pub pre_vote: bool,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "group={}, term={}, candidate={}, last=({},{}), pre_vote={}",
            self.group_id, self.term, self.candidate_id, self.last_log_term, self.last_log_index, self.pre_vote
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// RAFT_APPEND_ENTRIES: replication and heartbeats.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: Term,
    pub leader_commit: u64,
    #[serde(skip)]
    pub entries: Vec<LogItem>,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "group={}, term={}, leader={}, prev=({},{}), commit={}, n={}",
            self.group_id,
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Where the leader should rewind `nextIndex` to after a log
    /// mismatch. Meaningful only when `success` is false.
    pub suggested_next_index: u64,
}

/// RAFT_INSTALL_SNAPSHOT: one chunk of a snapshot stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: Term,
    pub offset: u64,
    #[serde(skip)]
    pub data: Bytes,
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "group={}, term={}, leader={}, last_included=({},{}), offset={}, len={}, done={}",
            self.group_id,
            self.term,
            self.leader_id,
            self.last_included_term,
            self.last_included_index,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A client proposal.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub biz_type: u32,
    pub header: Bytes,
    pub body: Bytes,
}

/// The result of a committed and applied proposal.
#[derive(Clone, Debug)]
pub struct SubmitResponse {
    /// Log index the proposal landed at.
    pub index: u64,
    /// The state machine's output for this entry.
    pub output: Bytes,
}

/// Global admission counters shared by every group of the process.
///
/// Counters are bumped before a proposal is enqueued and released when
/// its task completes, successfully or not.
pub struct PendingStat {
    max_writes: u64,
    max_write_bytes: u64,
    writes: AtomicU64,
    write_bytes: AtomicU64,
}

impl PendingStat {
    pub fn new(max_writes: u64, max_write_bytes: u64) -> Self {
        Self {
            max_writes,
            max_write_bytes,
            writes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
        }
    }

    pub fn pending_writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn pending_write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Acquire)
    }

    fn try_acquire(self: &Arc<Self>, bytes: u64) -> Option<PendingGuard> {
        let writes = self.writes.fetch_add(1, Ordering::AcqRel) + 1;
        let total_bytes = self.write_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if writes > self.max_writes || total_bytes > self.max_write_bytes {
            self.release(bytes);
            return None;
        }
        Some(PendingGuard {
            stat: self.clone(),
            bytes,
        })
    }

    fn release(&self, bytes: u64) {
        self.writes.fetch_sub(1, Ordering::AcqRel);
        self.write_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Releases its share of the admission counters when dropped.
pub struct PendingGuard {
    stat: Arc<PendingStat>,
    bytes: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.stat.release(self.bytes);
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A message crossing from any thread into a group's core fiber.
pub(crate) enum GroupMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    Submit {
        req: SubmitRequest,
        completer: Completer<SubmitResponse>,
        guard: PendingGuard,
    },
    ReadIndex {
        deadline: Instant,
        tx: oneshot::Sender<RaftResult<u64>>,
    },
    WaitReady {
        members: usize,
        completer: Completer<()>,
    },
    /// Ask for log reclamation up to `max_index` (bounded by what the
    /// state machine's snapshot already covers).
    Compact { max_index: u64 },
    /// Ask for reclamation of segments older than `timestamp` (unix
    /// millis).
    CompactByTime { timestamp: u64 },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The handle to one running consensus group.
///
/// Cheap to clone; every method may be called from any thread.
#[derive(Clone)]
pub struct RaftGroup {
    group_id: GroupId,
    node_id: NodeId,
    config: Arc<RaftConfig>,
    tx_api: mpsc::UnboundedSender<GroupMsg>,
    rx_status: watch::Receiver<ShareStatus>,
    pending: Arc<PendingStat>,
    fibers: FiberGroupHandle,
}

impl RaftGroup {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The latest published status snapshot. Lock-free.
    pub fn share_status(&self) -> ShareStatus {
        self.rx_status.borrow().clone()
    }

    /// A waiter over the published status.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.rx_status.clone(),
        }
    }

    /// Answer a RAFT_PING. Served straight off the share status so even a
    /// wedged group stays observable.
    pub fn handle_ping(&self, _req: PingRequest) -> PingResponse {
        let status = self.rx_status.borrow();
        PingResponse {
            node_id: self.node_id,
            group_ready: !status.error && !matches!(status.role, crate::types::Role::Shutdown),
        }
    }

    /// Deliver an AppendEntries RPC to this group.
    pub async fn handle_append_entries(
        &self,
        rpc: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(GroupMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Deliver a RequestVote RPC (vote or pre-vote) to this group.
    pub async fn handle_vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(GroupMsg::Vote { rpc, tx })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Deliver an InstallSnapshot chunk to this group.
    pub async fn handle_install_snapshot(
        &self,
        rpc: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(GroupMsg::InstallSnapshot { rpc, tx })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Propose a write. Resolves once the entry is committed and applied,
    /// with the state machine's output.
    ///
    /// Rejected with [`RaftError::Backpressure`] when the process-wide
    /// pending gates are full, and with [`RaftError::NotLeader`] when this
    /// node cannot commit it.
    pub async fn submit(&self, req: SubmitRequest) -> RaftResult<SubmitResponse> {
        if req.body.len() as u64 > self.config.max_body_size {
            return Err(RaftError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "body exceeds max_body_size",
            )));
        }
        let bytes = (req.header.len() + req.body.len()) as u64;
        let guard = self.pending.try_acquire(bytes).ok_or(RaftError::Backpressure)?;
        let (fut, completer) = FiberFuture::new();
        self.tx_api
            .send(GroupMsg::Submit { req, completer, guard })
            .map_err(|_| RaftError::Stopped)?;
        fut.await
    }

    /// The linearizable read barrier: returns an applied index such that
    /// reading the state machine at or after it is linearizable. Fails
    /// with [`RaftError::NotLeader`] off-leader or with an expired lease.
    pub async fn read_index(&self, deadline: Instant) -> RaftResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx_api
            .send(GroupMsg::ReadIndex { deadline, tx })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Completes once at least `n` members of the group (self included)
    /// answer pings; used to gate traffic at startup.
    pub async fn wait_ready_members(&self, n: usize, timeout: Duration) -> RaftResult<()> {
        let (fut, completer) = FiberFuture::new();
        self.tx_api
            .send(GroupMsg::WaitReady {
                members: n,
                completer,
            })
            .map_err(|_| RaftError::Stopped)?;
        crate::fiber::with_deadline(Instant::now() + timeout, fut).await?
    }

    /// Mark the log for reclamation up to `max_index`. The background
    /// round runs after the group's configured delete delay; the bound is
    /// capped so nothing past the applied (snapshot-covered) prefix is
    /// released.
    pub fn compact_log(&self, max_index: u64) {
        let _ = self.tx_api.send(GroupMsg::Compact { max_index });
    }

    /// Mark segments whose records are all older than `timestamp` (unix
    /// millis) for reclamation.
    pub fn compact_log_by_timestamp(&self, timestamp: u64) {
        let _ = self.tx_api.send(GroupMsg::CompactByTime { timestamp });
    }

    /// Request shutdown and wait for the group's fibers to drain.
    pub async fn shutdown(&self) {
        self.fibers.request_stop();
        self.fibers.join().await;
    }

    pub(crate) fn request_stop(&self) {
        self.fibers.request_stop();
    }

    pub(crate) async fn join(&self) {
        self.fibers.join().await;
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Hosts many consensus groups over a shared config, transport and
/// dispatcher pool.
pub struct MultiRaft<N: RaftNetwork> {
    config: Arc<RaftConfig>,
    network: Arc<N>,
    dispatchers: std::sync::Mutex<Vec<Dispatcher>>,
    dispatcher_handles: Vec<crate::fiber::DispatcherHandle>,
    next_dispatcher: AtomicUsize,
    pending: Arc<PendingStat>,
    groups: RwLock<HashMap<GroupId, RaftGroup>>,
}

impl<N: RaftNetwork> MultiRaft<N> {
    /// Spawn the dispatcher pool. `dispatchers` is the number of
    /// scheduling threads groups are spread over.
    pub fn new(config: RaftConfig, network: Arc<N>, dispatchers: usize) -> RaftResult<Self> {
        let config = Arc::new(config);
        let mut pool = Vec::with_capacity(dispatchers.max(1));
        for i in 0..dispatchers.max(1) {
            pool.push(Dispatcher::spawn(format!("raft-dispatcher-{}", i))?);
        }
        let dispatcher_handles = pool.iter().map(|d| d.handle()).collect();
        let pending = Arc::new(PendingStat::new(
            config.max_pending_writes,
            config.max_pending_write_bytes,
        ));
        Ok(Self {
            config,
            network,
            dispatchers: std::sync::Mutex::new(pool),
            dispatcher_handles,
            next_dispatcher: AtomicUsize::new(0),
            pending,
            groups: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<RaftConfig> {
        &self.config
    }

    pub fn pending_stat(&self) -> &Arc<PendingStat> {
        &self.pending
    }

    /// Start one consensus group and return its handle. The group's
    /// store is opened and recovered before this returns.
    pub async fn add_group(
        &self,
        group_config: GroupConfig,
        state_machine: Box<dyn StateMachine>,
    ) -> RaftResult<RaftGroup> {
        group_config.validate()?;
        let group_id = group_config.group_id;
        if self.groups.read().expect("groups lock").contains_key(&group_id) {
            return Err(RaftError::ConfigError(crate::error::ConfigError::Invalid(
                format!("group {} already exists", group_id),
            )));
        }

        let slot = self.next_dispatcher.fetch_add(1, Ordering::Relaxed) % self.dispatcher_handles.len();
        let fibers = self.dispatcher_handles[slot]
            .create_group(format!("raft-g{}", group_id))
            .await?;

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (status_tx, rx_status) =
            watch::channel(ShareStatus::new_initial(group_id, self.config.node_id));
        let (init_fut, init_done) = FiberFuture::new();

        let config = self.config.clone();
        let network = self.network.clone();
        fibers.run(move |g| {
            let group = g.clone();
            g.spawn("raft-core", async move {
                match RaftCore::init(
                    group.clone(),
                    config,
                    group_config,
                    network,
                    state_machine,
                    rx_api,
                    status_tx,
                )
                .await
                {
                    Ok(core) => {
                        init_done.complete(());
                        core.main().await;
                    }
                    Err(err) => {
                        record_failure("group init", &err);
                        init_done.fail(err);
                        group.request_stop();
                    }
                }
            });
        })?;
        init_fut.await?;

        let handle = RaftGroup {
            group_id,
            node_id: self.config.node_id,
            config: self.config.clone(),
            tx_api,
            rx_status,
            pending: self.pending.clone(),
            fibers,
        };
        self.groups
            .write()
            .expect("groups lock")
            .insert(group_id, handle.clone());
        tracing::info!(group_id, "group started");
        Ok(handle)
    }

    pub fn group(&self, group_id: GroupId) -> Option<RaftGroup> {
        self.groups.read().expect("groups lock").get(&group_id).cloned()
    }

    fn route(&self, group_id: GroupId) -> RaftResult<RaftGroup> {
        self.group(group_id).ok_or(RaftError::Stopped)
    }

    /// Transport entry points, routed by the `group_id` carried in each
    /// RPC body.
    pub fn handle_ping(&self, req: PingRequest) -> PingResponse {
        match self.group(req.group_id) {
            Some(group) => group.handle_ping(req),
            None => PingResponse {
                node_id: self.config.node_id,
                group_ready: false,
            },
        }
    }

    pub async fn handle_vote(&self, req: VoteRequest) -> RaftResult<VoteResponse> {
        self.route(req.group_id)?.handle_vote(req).await
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        self.route(req.group_id)?.handle_append_entries(req).await
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        self.route(req.group_id)?.handle_install_snapshot(req).await
    }

    /// Stop every group, drain their fibers, then stop the dispatchers.
    pub async fn shutdown(&self) {
        let groups: Vec<RaftGroup> = self.groups.read().expect("groups lock").values().cloned().collect();
        for group in &groups {
            group.request_stop();
        }
        for group in &groups {
            group.join().await;
        }
        let dispatchers: Vec<Dispatcher> =
            std::mem::take(&mut *self.dispatchers.lock().expect("dispatchers lock"));
        for dispatcher in dispatchers {
            dispatcher.shutdown();
        }
        tracing::info!("multiraft shut down");
    }
}

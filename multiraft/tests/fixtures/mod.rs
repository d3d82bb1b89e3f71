//! Fixtures for cluster tests: an in-process router implementing
//! `RaftNetwork` with per-node isolation, plus client helpers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tokio::time::Instant;

use memstate::KvRequest;
use memstate::KvResponse;
use memstate::MemKv;
use multiraft::async_trait::async_trait;
use multiraft::raft::AppendEntriesRequest;
use multiraft::raft::AppendEntriesResponse;
use multiraft::raft::InstallSnapshotRequest;
use multiraft::raft::InstallSnapshotResponse;
use multiraft::raft::PingRequest;
use multiraft::raft::PingResponse;
use multiraft::raft::VoteRequest;
use multiraft::raft::VoteResponse;
use multiraft::GroupConfig;
use multiraft::MultiRaft;
use multiraft::NodeId;
use multiraft::RaftConfig;
use multiraft::RaftGroup;
use multiraft::RaftNetwork;
use multiraft::RaftResult;
use multiraft::Role;
use multiraft::SubmitRequest;
use multiraft::SubmitResponse;

pub const GROUP: u32 = 1;

/// Initialize the tracing subscriber for a test binary.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer)
        .try_init();
}

struct Node {
    server: Arc<MultiRaft<RaftRouter>>,
    group: RaftGroup,
    kv: MemKv,
    data_dir: PathBuf,
}

/// Emulates the transport: routes RPCs between in-process nodes and can
/// isolate nodes in both directions.
pub struct RaftRouter {
    node_ids: Vec<NodeId>,
    nodes: RwLock<BTreeMap<NodeId, Node>>,
    isolated: RwLock<HashSet<NodeId>>,
    tmp_dir: tempfile::TempDir,
}

impl RaftRouter {
    /// A router for a cluster with the given voting members.
    pub fn new(node_ids: Vec<NodeId>) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            node_ids,
            nodes: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
            tmp_dir: tempfile::tempdir().expect("tempdir"),
        })
    }

    fn test_config(&self, node_id: NodeId) -> RaftConfig {
        RaftConfig::build(node_id)
            .elect_timeout(Duration::from_millis(300))
            .heartbeat_interval(Duration::from_millis(60))
            .rpc_timeout(Duration::from_millis(200))
            .io_retry_interval(vec![Duration::from_millis(5), Duration::from_millis(20)])
            .validate()
            .expect("test config")
    }

    fn group_config(&self, data_dir: PathBuf) -> GroupConfig {
        let mut gc = GroupConfig::new(GROUP, self.node_ids.clone(), data_dir);
        gc.log_file_shift_bits = 14;
        gc.idx_file_shift_bits = 12;
        gc.delete_delay = Duration::from_millis(10);
        gc
    }

    /// Start a node with a fresh data directory.
    pub async fn add_node(self: &Arc<Self>, node_id: NodeId) -> RaftResult<()> {
        let data_dir = self.tmp_dir.path().join(format!("node-{}", node_id));
        self.start_node(node_id, data_dir).await
    }

    /// Start (or restart) a node over the given data directory.
    pub async fn start_node(self: &Arc<Self>, node_id: NodeId, data_dir: PathBuf) -> RaftResult<()> {
        let server = Arc::new(MultiRaft::new(self.test_config(node_id), self.clone(), 1)?);
        let kv = MemKv::new(node_id);
        let group = server
            .add_group(self.group_config(data_dir.clone()), Box::new(kv.clone()))
            .await?;
        self.nodes.write().unwrap().insert(
            node_id,
            Node {
                server,
                group,
                kv,
                data_dir,
            },
        );
        Ok(())
    }

    /// Stop a node and return its data directory for a later restart.
    pub async fn stop_node(&self, node_id: NodeId) -> Option<PathBuf> {
        let node = self.nodes.write().unwrap().remove(&node_id)?;
        node.server.shutdown().await;
        Some(node.data_dir)
    }

    pub fn isolate(&self, node_id: NodeId) {
        tracing::info!(node_id, "isolating node");
        self.isolated.write().unwrap().insert(node_id);
    }

    pub fn restore(&self, node_id: NodeId) {
        tracing::info!(node_id, "restoring node");
        self.isolated.write().unwrap().remove(&node_id);
    }

    fn is_isolated(&self, node_id: NodeId) -> bool {
        self.isolated.read().unwrap().contains(&node_id)
    }

    pub fn group(&self, node_id: NodeId) -> RaftGroup {
        self.nodes.read().unwrap()[&node_id].group.clone()
    }

    pub fn kv(&self, node_id: NodeId) -> MemKv {
        self.nodes.read().unwrap()[&node_id].kv.clone()
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }

    /// The current leader among non-isolated nodes, if any.
    pub fn leader(&self) -> Option<NodeId> {
        let nodes = self.nodes.read().unwrap();
        let isolated = self.isolated.read().unwrap();
        nodes
            .values()
            .map(|n| n.group.share_status())
            .find(|s| {
                s.role == Role::Leader
                    && s.current_leader == Some(s.node_id)
                    && !isolated.contains(&s.node_id)
            })
            .map(|s| s.node_id)
    }

    /// Wait until a leader is elected; panics on timeout.
    pub async fn wait_for_leader(&self, timeout: Duration) -> NodeId {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return leader;
            }
            assert!(Instant::now() < deadline, "no leader elected within {:?}", timeout);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until every listed node has applied at least `want`.
    pub async fn wait_applied(&self, nodes: &[NodeId], want: u64, timeout: Duration) {
        for &node in nodes {
            self.group(node)
                .wait(Some(timeout))
                .applied(want, &format!("node {} applied {}", node, want))
                .await
                .unwrap_or_else(|e| panic!("node {} did not apply {}: {}", node, want, e));
        }
    }

    /// Submit a KV command to the given node.
    pub async fn submit_to(&self, node_id: NodeId, req: &KvRequest) -> RaftResult<SubmitResponse> {
        self.group(node_id)
            .submit(SubmitRequest {
                biz_type: 0,
                header: bytes::Bytes::new(),
                body: req.to_body(),
            })
            .await
    }

    /// A linearizable read through the leader's read barrier.
    pub async fn linear_read(&self, node_id: NodeId, key: &str) -> RaftResult<Option<String>> {
        let group = self.group(node_id);
        let applied = group.read_index(Instant::now() + Duration::from_secs(2)).await?;
        assert!(applied > 0, "read barrier always covers the leader's term-start entry");
        Ok(self.kv(node_id).read(key))
    }

    /// Write `n` keys through the leader, waiting for each.
    pub async fn write_many(&self, leader: NodeId, prefix: &str, n: u64) -> RaftResult<()> {
        for i in 0..n {
            let req = KvRequest::set(format!("{}-{}", prefix, i), format!("v{}", i));
            self.submit_to(leader, &req).await?;
        }
        Ok(())
    }

    /// Like `write_many` but with padded values, to fill log segments
    /// quickly.
    pub async fn write_bulk(&self, leader: NodeId, prefix: &str, n: u64, value_len: usize) -> RaftResult<()> {
        for i in 0..n {
            let req = KvRequest::set(format!("{}-{}", prefix, i), bulk_value(i, value_len));
            self.submit_to(leader, &req).await?;
        }
        Ok(())
    }

    pub fn parse_response(resp: &SubmitResponse) -> KvResponse {
        KvResponse::from_output(&resp.output).expect("kv response decodes")
    }
}

/// The padded value written by `write_bulk`.
pub fn bulk_value(i: u64, value_len: usize) -> String {
    let mut v = format!("v{}", i);
    while v.len() < value_len {
        v.push('x');
    }
    v
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn ping(&self, target: NodeId, req: PingRequest) -> Result<PingResponse> {
        if self.is_isolated(target) || self.is_isolated(req.node_id) {
            return Err(anyhow!("node isolated"));
        }
        let server = {
            let nodes = self.nodes.read().unwrap();
            nodes.get(&target).map(|n| n.server.clone())
        };
        match server {
            Some(server) => Ok(server.handle_ping(req)),
            None => Err(anyhow!("node {} is down", target)),
        }
    }

    async fn vote(&self, target: NodeId, req: VoteRequest) -> Result<VoteResponse> {
        if self.is_isolated(target) || self.is_isolated(req.candidate_id) {
            return Err(anyhow!("node isolated"));
        }
        let server = {
            let nodes = self.nodes.read().unwrap();
            nodes.get(&target).map(|n| n.server.clone())
        };
        match server {
            Some(server) => Ok(server.handle_vote(req).await?),
            None => Err(anyhow!("node {} is down", target)),
        }
    }

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.is_isolated(target) || self.is_isolated(req.leader_id) {
            return Err(anyhow!("node isolated"));
        }
        let server = {
            let nodes = self.nodes.read().unwrap();
            nodes.get(&target).map(|n| n.server.clone())
        };
        match server {
            Some(server) => Ok(server.handle_append_entries(req).await?),
            None => Err(anyhow!("node {} is down", target)),
        }
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if self.is_isolated(target) || self.is_isolated(req.leader_id) {
            return Err(anyhow!("node isolated"));
        }
        let server = {
            let nodes = self.nodes.read().unwrap();
            nodes.get(&target).map(|n| n.server.clone())
        };
        match server {
            Some(server) => Ok(server.handle_install_snapshot(req).await?),
            None => Err(anyhow!("node {} is down", target)),
        }
    }
}

//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::types::GroupId;
use crate::types::NodeId;

/// The address of one cluster member, parsed from `id@host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddr {
    pub node_id: NodeId,
    pub addr: String,
}

/// Process-wide engine configuration, shared by every hosted group.
///
/// Build one with [`RaftConfig::build`], adjust fields, then call
/// [`RaftConfigBuilder::validate`] to obtain the final config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This node's id. Node ids start at 1.
    pub node_id: NodeId,
    /// The port the transport listens on. Carried for the transport
    /// implementation; the engine itself never binds it.
    pub raft_port: u16,
    /// All known cluster members.
    pub servers: Vec<ServerAddr>,
    /// Election timeout. A follower that hears nothing from a leader for
    /// this long starts a pre-vote round.
    pub elect_timeout: Duration,
    /// Leader heartbeat interval. Must be well below `elect_timeout`.
    pub heartbeat_interval: Duration,
    /// Timeout applied to every outbound RPC.
    pub rpc_timeout: Duration,
    /// Cap on in-flight proposals across all groups.
    pub max_pending_writes: u64,
    /// Cap on in-flight proposal payload bytes across all groups.
    pub max_pending_write_bytes: u64,
    /// Largest accepted entry payload.
    pub max_body_size: u64,
    /// Entries per AppendEntries batch.
    pub max_replicate_items: u64,
    /// Bytes per install-snapshot chunk.
    pub snapshot_chunk_size: usize,
    /// Backoff schedule for retrying failed file I/O. Non-decreasing.
    pub io_retry_interval: Vec<Duration>,
}

impl RaftConfig {
    pub fn build(node_id: NodeId) -> RaftConfigBuilder {
        RaftConfigBuilder {
            config: RaftConfig {
                node_id,
                raft_port: 0,
                servers: Vec::new(),
                elect_timeout: Duration::from_millis(1500),
                heartbeat_interval: Duration::from_millis(150),
                rpc_timeout: Duration::from_millis(1000),
                max_pending_writes: 10_000,
                max_pending_write_bytes: 256 << 20,
                max_body_size: 8 << 20,
                max_replicate_items: 64,
                snapshot_chunk_size: 256 << 10,
                io_retry_interval: vec![
                    Duration::from_millis(100),
                    Duration::from_millis(300),
                    Duration::from_secs(1),
                    Duration::from_secs(3),
                ],
            },
        }
    }

    /// A randomized election timeout for one wait: the configured timeout
    /// plus a small jitter to break symmetric elections.
    pub fn rand_elect_timeout(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..200);
        self.elect_timeout + Duration::from_millis(jitter)
    }

    /// Parse a `1@host:5001,2@host:5002` style server list.
    pub fn parse_servers(s: &str) -> Result<Vec<ServerAddr>, ConfigError> {
        let mut out = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (id, addr) = part
                .split_once('@')
                .ok_or_else(|| ConfigError::Invalid(format!("server entry `{}` is not id@host:port", part)))?;
            let node_id: NodeId = id
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad node id in `{}`", part)))?;
            out.push(ServerAddr {
                node_id,
                addr: addr.to_string(),
            });
        }
        Ok(out)
    }
}

pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn servers(mut self, servers: Vec<ServerAddr>) -> Self {
        self.config.servers = servers;
        self
    }

    pub fn raft_port(mut self, port: u16) -> Self {
        self.config.raft_port = port;
        self
    }

    pub fn elect_timeout(mut self, t: Duration) -> Self {
        self.config.elect_timeout = t;
        self
    }

    pub fn heartbeat_interval(mut self, t: Duration) -> Self {
        self.config.heartbeat_interval = t;
        self
    }

    pub fn rpc_timeout(mut self, t: Duration) -> Self {
        self.config.rpc_timeout = t;
        self
    }

    pub fn max_pending_writes(mut self, n: u64) -> Self {
        self.config.max_pending_writes = n;
        self
    }

    pub fn max_pending_write_bytes(mut self, n: u64) -> Self {
        self.config.max_pending_write_bytes = n;
        self
    }

    pub fn io_retry_interval(mut self, schedule: Vec<Duration>) -> Self {
        self.config.io_retry_interval = schedule;
        self
    }

    pub fn validate(self) -> Result<RaftConfig, ConfigError> {
        let c = &self.config;
        if c.node_id == 0 {
            return Err(ConfigError::Invalid("node id 0 is reserved".into()));
        }
        if c.heartbeat_interval >= c.elect_timeout {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval {:?} must be below elect timeout {:?}",
                c.heartbeat_interval, c.elect_timeout
            )));
        }
        if c.max_pending_writes == 0 || c.max_pending_write_bytes == 0 {
            return Err(ConfigError::Invalid("pending write limits must be positive".into()));
        }
        if c.max_replicate_items == 0 {
            return Err(ConfigError::Invalid("max_replicate_items must be positive".into()));
        }
        if c.snapshot_chunk_size == 0 {
            return Err(ConfigError::Invalid("snapshot_chunk_size must be positive".into()));
        }
        if c.io_retry_interval.is_empty() {
            return Err(ConfigError::Invalid("io_retry_interval must not be empty".into()));
        }
        if c.io_retry_interval.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::Invalid("io_retry_interval must be non-decreasing".into()));
        }
        for s in &c.servers {
            if s.node_id == 0 {
                return Err(ConfigError::Invalid("server node id 0 is reserved".into()));
            }
        }
        Ok(self.config)
    }
}

/// Per-group configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: GroupId,
    /// The static voting membership of the group.
    pub node_ids: Vec<NodeId>,
    /// Nodes that replicate the log but never vote and are not counted in
    /// quorums.
    pub observer_ids: Vec<NodeId>,
    /// Directory holding this group's `status`, `log/`, `idx/` and
    /// `snapshot/` data.
    pub data_dir: PathBuf,
    /// Log segment size as a power of two.
    pub log_file_shift_bits: u32,
    /// Index segment size as a power of two.
    pub idx_file_shift_bits: u32,
    /// How long reclamation markers wait before the delete round runs.
    pub delete_delay: Duration,
}

impl GroupConfig {
    pub fn new(group_id: GroupId, node_ids: Vec<NodeId>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            group_id,
            node_ids,
            observer_ids: Vec::new(),
            data_dir: data_dir.into(),
            log_file_shift_bits: 26,
            idx_file_shift_bits: 20,
            delete_delay: Duration::from_secs(60),
        }
    }

    /// Parse a `1,2,3` style member list.
    pub fn parse_ids(s: &str) -> Result<Vec<NodeId>, ConfigError> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<NodeId>()
                    .map_err(|_| ConfigError::Invalid(format!("bad node id `{}`", p)))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_ids.is_empty() {
            return Err(ConfigError::Invalid("group has no members".into()));
        }
        if self.log_file_shift_bits < 12 || self.log_file_shift_bits > 34 {
            return Err(ConfigError::Invalid("log_file_shift_bits out of range".into()));
        }
        if self.idx_file_shift_bits < 12 || self.idx_file_shift_bits > 34 {
            return Err(ConfigError::Invalid("idx_file_shift_bits out of range".into()));
        }
        if self.node_ids.iter().any(|id| self.observer_ids.contains(id)) {
            return Err(ConfigError::Invalid("a node cannot be both member and observer".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = RaftConfig::build(1).validate().unwrap();
        assert!(config.heartbeat_interval < config.elect_timeout);
    }

    #[test]
    fn heartbeat_above_elect_timeout_is_rejected() {
        let res = RaftConfig::build(1)
            .heartbeat_interval(Duration::from_secs(5))
            .elect_timeout(Duration::from_secs(1))
            .validate();
        assert!(res.is_err());
    }

    #[test]
    fn decreasing_retry_schedule_is_rejected() {
        let res = RaftConfig::build(1)
            .io_retry_interval(vec![Duration::from_secs(3), Duration::from_secs(1)])
            .validate();
        assert!(res.is_err());
    }

    #[test]
    fn parse_server_list() {
        let servers = RaftConfig::parse_servers("1@h1:5001, 2@h2:5002").unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].node_id, 1);
        assert_eq!(servers[1].addr, "h2:5002");
        assert!(RaftConfig::parse_servers("nope").is_err());
    }

    #[test]
    fn parse_member_list() {
        assert_eq!(GroupConfig::parse_ids("1,2,3").unwrap(), vec![1, 2, 3]);
        assert!(GroupConfig::parse_ids("1,x").is_err());
    }

    #[test]
    fn rand_elect_timeout_stays_within_jitter_window() {
        let config = RaftConfig::build(1).validate().unwrap();
        for _ in 0..32 {
            let t = config.rand_elect_timeout();
            assert!(t >= config.elect_timeout);
            assert!(t < config.elect_timeout + Duration::from_millis(200));
        }
    }
}

#![doc = include_str!("../README.md")]

pub mod codec;
pub mod config;
pub mod error;
pub mod fiber;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod state_machine;
pub mod store;
pub mod types;

mod core;
mod membership;
mod replication;

pub use config::GroupConfig;
pub use config::RaftConfig;
pub use config::ServerAddr;
pub use error::ConfigError;
pub use error::RaftError;
pub use error::RaftResult;
pub use membership::RaftMember;
pub use metrics::ShareStatus;
pub use metrics::Wait;
pub use network::RaftNetwork;
pub use raft::MultiRaft;
pub use raft::PendingStat;
pub use raft::RaftGroup;
pub use raft::SubmitRequest;
pub use raft::SubmitResponse;
pub use state_machine::Snapshot;
pub use state_machine::SnapshotMeta;
pub use state_machine::StateMachine;
pub use types::GroupId;
pub use types::ItemType;
pub use types::LogId;
pub use types::LogItem;
pub use types::MessageSummary;
pub use types::NodeId;
pub use types::Role;
pub use types::Term;

/// Re-exported so implementors of [`RaftNetwork`] and [`StateMachine`]
/// use the exact `async_trait` this crate was built with.
pub use async_trait;
pub use anyhow;

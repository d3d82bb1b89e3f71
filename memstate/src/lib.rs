//! An in-memory key-value implementation of `multiraft::StateMachine`,
//! used by the integration tests and as a reference for real state
//! machines.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use multiraft::LogItem;
use multiraft::NodeId;
use multiraft::Snapshot;
use multiraft::SnapshotMeta;
use multiraft::StateMachine;
use multiraft::Term;

/// A key-value command carried in a log entry's body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvRequest {
    Set { key: String, value: String },
    Del { key: String },
    Get { key: String },
}

impl KvRequest {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn to_body(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("kv request serializes"))
    }
}

/// The state machine's answer to one command.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvResponse {
    pub value: Option<String>,
}

impl KvResponse {
    pub fn from_output(output: &[u8]) -> Result<Self> {
        serde_json::from_slice(output).context("decoding kv response")
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    last_included_index: u64,
    last_included_term: Term,
    data: BTreeMap<String, String>,
}

struct Inner {
    data: BTreeMap<String, String>,
    last_applied_index: u64,
    last_applied_term: Term,
    /// Accumulates an inbound snapshot stream until the final chunk.
    install_buf: Vec<u8>,
}

/// The shared in-memory store. Clones share state, so a test can keep a
/// handle while the engine owns the boxed state machine.
#[derive(Clone)]
pub struct MemKv {
    node_id: NodeId,
    inner: Arc<Mutex<Inner>>,
}

impl MemKv {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            inner: Arc::new(Mutex::new(Inner {
                data: BTreeMap::new(),
                last_applied_index: 0,
                last_applied_term: 0,
                install_buf: Vec::new(),
            })),
        }
    }

    /// Read a key directly; pair with `read_index` for linearizable
    /// reads.
    pub fn read(&self, key: &str) -> Option<String> {
        self.inner.lock().expect("memkv lock").data.get(key).cloned()
    }

    pub fn last_applied(&self) -> (u64, Term) {
        let inner = self.inner.lock().expect("memkv lock");
        (inner.last_applied_index, inner.last_applied_term)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("memkv lock").data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateMachine for MemKv {
    async fn exec(&mut self, index: u64, term: Term, input: &LogItem) -> Result<Bytes> {
        let req: KvRequest = serde_json::from_slice(&input.body).context("decoding kv request")?;
        let mut inner = self.inner.lock().expect("memkv lock");
        anyhow::ensure!(
            index > inner.last_applied_index,
            "apply out of order: {} after {}",
            index,
            inner.last_applied_index
        );
        let resp = match req {
            KvRequest::Set { key, value } => {
                inner.data.insert(key, value);
                KvResponse::default()
            }
            KvRequest::Del { key } => KvResponse {
                value: inner.data.remove(&key),
            },
            KvRequest::Get { key } => KvResponse {
                value: inner.data.get(&key).cloned(),
            },
        };
        inner.last_applied_index = index;
        inner.last_applied_term = term;
        tracing::trace!(node = self.node_id, index, "applied kv command");
        Ok(Bytes::from(serde_json::to_vec(&resp)?))
    }

    async fn install_snapshot(
        &mut self,
        last_included_index: u64,
        last_included_term: Term,
        offset: u64,
        done: bool,
        data: &[u8],
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("memkv lock");
        if offset == 0 {
            inner.install_buf.clear();
        }
        anyhow::ensure!(
            offset == inner.install_buf.len() as u64,
            "snapshot chunk at offset {} but buffered {}",
            offset,
            inner.install_buf.len()
        );
        inner.install_buf.extend_from_slice(data);
        if !done {
            return Ok(());
        }
        let buf = std::mem::take(&mut inner.install_buf);
        let payload: SnapshotPayload = serde_json::from_slice(&buf).context("decoding snapshot")?;
        anyhow::ensure!(
            payload.last_included_index == last_included_index
                && payload.last_included_term == last_included_term,
            "snapshot payload does not match its stream metadata"
        );
        inner.data = payload.data;
        inner.last_applied_index = last_included_index;
        inner.last_applied_term = last_included_term;
        tracing::info!(
            node = self.node_id,
            last_included_index,
            keys = inner.data.len(),
            "snapshot installed into memkv"
        );
        Ok(())
    }

    async fn take_snapshot(&mut self) -> Result<Box<dyn Snapshot>> {
        let inner = self.inner.lock().expect("memkv lock");
        let payload = SnapshotPayload {
            last_included_index: inner.last_applied_index,
            last_included_term: inner.last_applied_term,
            data: inner.data.clone(),
        };
        let raw = serde_json::to_vec(&payload)?;
        let chunks = raw
            .chunks(MemSnapshot::CHUNK_SIZE)
            .map(Bytes::copy_from_slice)
            .collect();
        Ok(Box::new(MemSnapshot {
            meta: SnapshotMeta {
                last_included_index: inner.last_applied_index,
                last_included_term: inner.last_applied_term,
            },
            chunks,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        tracing::debug!(node = self.node_id, "memkv closed");
        Ok(())
    }
}

/// A snapshot of the store, read back in fixed-size chunks.
pub struct MemSnapshot {
    meta: SnapshotMeta,
    chunks: VecDeque<Bytes>,
}

impl MemSnapshot {
    const CHUNK_SIZE: usize = 4 * 1024;
}

#[async_trait]
impl Snapshot for MemSnapshot {
    fn meta(&self) -> SnapshotMeta {
        self.meta
    }

    async fn read_next(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

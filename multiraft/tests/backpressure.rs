//! Admission control: concurrent proposals beyond the pending-writes
//! gate are rejected, and the counters drain back to zero.
//!
//! RUST_LOG=multiraft=debug cargo test -p multiraft --test backpressure

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use memstate::KvRequest;
use memstate::MemKv;
use multiraft::GroupConfig;
use multiraft::LogItem;
use multiraft::MultiRaft;
use multiraft::RaftConfig;
use multiraft::RaftError;
use multiraft::Snapshot;
use multiraft::StateMachine;
use multiraft::SubmitRequest;
use multiraft::Term;

use fixtures::RaftRouter;

/// Wraps the KV store with a fixed per-entry apply delay, so proposals
/// pile up behind the gate deterministically.
struct SlowKv {
    inner: MemKv,
    delay: Duration,
}

#[async_trait]
impl StateMachine for SlowKv {
    async fn exec(&mut self, index: u64, term: Term, input: &LogItem) -> anyhow::Result<Bytes> {
        tokio::time::sleep(self.delay).await;
        StateMachine::exec(&mut self.inner, index, term, input).await
    }

    async fn install_snapshot(
        &mut self,
        last_included_index: u64,
        last_included_term: Term,
        offset: u64,
        done: bool,
        data: &[u8],
    ) -> anyhow::Result<()> {
        StateMachine::install_snapshot(
            &mut self.inner,
            last_included_index,
            last_included_term,
            offset,
            done,
            data,
        )
        .await
    }

    async fn take_snapshot(&mut self) -> anyhow::Result<Box<dyn Snapshot>> {
        StateMachine::take_snapshot(&mut self.inner).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        StateMachine::close(&mut self.inner).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_write_gate_rejects_overflow() -> Result<()> {
    fixtures::init_tracing();
    const LIMIT: u64 = 100;

    let router = RaftRouter::new(vec![1]);
    // A dedicated server so the pending-writes cap can be pinned low.
    let config = RaftConfig::build(1)
        .elect_timeout(Duration::from_millis(300))
        .heartbeat_interval(Duration::from_millis(60))
        .rpc_timeout(Duration::from_millis(200))
        .max_pending_writes(LIMIT)
        .io_retry_interval(vec![Duration::from_millis(5)])
        .validate()?;
    let server = Arc::new(MultiRaft::new(config, router.clone(), 1)?);

    let tmp = tempfile::tempdir()?;
    let mut group_config = GroupConfig::new(7, vec![1], tmp.path().join("node-1"));
    group_config.log_file_shift_bits = 14;
    group_config.idx_file_shift_bits = 12;
    let kv = MemKv::new(1);
    let group = server
        .add_group(
            group_config,
            Box::new(SlowKv {
                inner: kv.clone(),
                delay: Duration::from_millis(25),
            }),
        )
        .await?;

    group
        .wait(Some(Duration::from_secs(5)))
        .status(|s| s.role.is_leader(), "leader")
        .await?;

    // Fire twice the limit concurrently.
    let mut futs = Vec::new();
    for i in 0..(2 * LIMIT) {
        let group = group.clone();
        futs.push(async move {
            group
                .submit(SubmitRequest {
                    biz_type: 0,
                    header: Bytes::new(),
                    body: KvRequest::set(format!("k{}", i), "v").to_body(),
                })
                .await
        });
    }
    let results = join_all(futs).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count() as u64;
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(RaftError::Backpressure)))
        .count() as u64;
    assert_eq!(accepted + rejected, 2 * LIMIT, "every proposal either lands or is rejected");
    assert_eq!(accepted, LIMIT, "exactly the gate's worth of proposals may be in flight");
    assert_eq!(rejected, LIMIT);

    // After the drain the counters return to zero.
    assert_eq!(server.pending_stat().pending_writes(), 0);
    assert_eq!(server.pending_stat().pending_write_bytes(), 0);
    assert_eq!(kv.len() as u64, accepted);

    server.shutdown().await;
    Ok(())
}

//! Single-node cluster: immediate leadership, writes, linearizable
//! reads, and durability across a restart.
//!
//! RUST_LOG=multiraft=debug cargo test -p multiraft --test single_node

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use memstate::KvRequest;

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn single_node_write_read_restart() -> Result<()> {
    let router = RaftRouter::new(vec![1]);
    router.add_node(1).await?;

    let leader = router.wait_for_leader(Duration::from_secs(5)).await;
    assert_eq!(leader, 1);

    // Write and read back linearizably.
    let resp = router.submit_to(1, &KvRequest::set("a", "1")).await?;
    assert!(resp.index >= 2, "term-start entry precedes the first write");
    assert_eq!(router.linear_read(1, "a").await?.as_deref(), Some("1"));

    // Counters drain once nothing is in flight.
    let status = router.group(1).share_status();
    assert!(status.role.is_leader());
    assert_eq!(status.commit_index, status.last_applied);

    // Restart over the same data directory: the write must survive.
    let data_dir = router.stop_node(1).await.expect("node existed");
    router.start_node(1, data_dir).await?;
    router.wait_for_leader(Duration::from_secs(5)).await;
    assert_eq!(router.linear_read(1, "a").await?.as_deref(), Some("1"));

    router.stop_node(1).await;
    Ok(())
}

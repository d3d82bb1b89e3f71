//! Divergent-tail rewrite: a deposed leader's uncommitted entry is
//! overwritten by the new leader's entry at the same index, and the
//! orphaned proposal is aborted.
//!
//! RUST_LOG=multiraft=debug cargo test -p multiraft --test log_truncation

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use memstate::KvRequest;
use multiraft::RaftError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_tail_is_overwritten() -> Result<()> {
    let router = RaftRouter::new(vec![1, 2, 3]);
    for id in [1u32, 2, 3] {
        router.add_node(id).await?;
    }

    let old_leader = router.wait_for_leader(Duration::from_secs(5)).await;
    let resp = router.submit_to(old_leader, &KvRequest::set("base", "ok")).await?;
    router.wait_applied(&[1, 2, 3], resp.index, Duration::from_secs(5)).await;

    // Cut the leader off, then feed it a proposal it can append locally
    // but never commit.
    router.isolate(old_leader);
    let orphan_router = router.clone();
    let orphan = tokio::spawn(async move {
        orphan_router
            .submit_to(old_leader, &KvRequest::set("orphan", "lost"))
            .await
    });

    // The rest of the cluster moves on and writes at the same index.
    let new_leader = router.wait_for_leader(Duration::from_secs(10)).await;
    assert_ne!(new_leader, old_leader);
    let win = router.submit_to(new_leader, &KvRequest::set("winner", "kept")).await?;
    let survivors: Vec<u32> = [1, 2, 3].into_iter().filter(|id| *id != old_leader).collect();
    router.wait_applied(&survivors, win.index, Duration::from_secs(5)).await;

    // Heal the partition: the old leader truncates its divergent tail
    // and converges on the new leader's log.
    router.restore(old_leader);
    router.wait_applied(&[1, 2, 3], win.index, Duration::from_secs(10)).await;

    for id in [1u32, 2, 3] {
        let kv = router.kv(id);
        assert_eq!(kv.read("winner").as_deref(), Some("kept"), "node {} diverged", id);
        assert_eq!(kv.read("orphan"), None, "orphan write must not survive on node {}", id);
    }

    // The orphaned proposal's future must have been aborted, not left
    // hanging and never completed as a success.
    let orphan_res = tokio::time::timeout(Duration::from_secs(10), orphan)
        .await
        .expect("orphan future resolved")
        .expect("orphan task not cancelled");
    match orphan_res {
        Err(RaftError::NotLeader { .. }) | Err(RaftError::Stopped) | Err(RaftError::Timeout) => {}
        other => panic!("orphan proposal must fail, got {:?}", other.map(|r| r.index)),
    }

    for id in [1u32, 2, 3] {
        router.stop_node(id).await;
    }
    Ok(())
}

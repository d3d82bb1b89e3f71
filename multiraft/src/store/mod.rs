//! The persistent log subsystem.
//!
//! Per group data directory:
//!
//! ```text
//! <datadir>/status     # term + votedFor + commitIndex, fsynced
//! <datadir>/log/<20d>  # log segments, fixed size
//! <datadir>/idx/<20d>  # index segments, fixed size
//! <datadir>/snapshot/  # owned by the state machine
//! ```

mod file_queue;
mod idx_file;
mod log_file;
mod status;

pub use status::StatusFile;
pub use status::StatusRecord;

use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::{cell::RefCell, time::Duration};

use tokio::time::Instant;

use crate::config::GroupConfig;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::FiberGroup;
use crate::fiber::RetrySchedule;
use crate::types::LogItem;
use crate::types::Term;

use idx_file::IdxFileQueue;
use log_file::LogFileQueue;

/// What a restore recovered from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    pub first_index: u64,
    pub last_index: u64,
    pub last_term: Term,
}

enum ReclaimBound {
    ByIndex(u64),
    ByTimestamp(u64),
}

struct Marker {
    bound: ReclaimBound,
    fire_at: Instant,
}

struct LogState {
    next_index: u64,
    last_term: Term,
    marker: Option<Marker>,
}

/// The append-only replicated log of one group: segmented log files plus
/// the position index. Cheap to clone; all clones share state and run on
/// the group's thread.
#[derive(Clone)]
pub struct RaftLog {
    group: FiberGroup,
    logs: LogFileQueue,
    idx: IdxFileQueue,
    state: Rc<RefCell<LogState>>,
}

impl RaftLog {
    /// Open the queues and recover: locate the persisted commit index in
    /// the index, scan the log forward from there validating every
    /// record, truncate both tails at the first broken record.
    pub async fn open(
        group: FiberGroup,
        schedule: RetrySchedule,
        config: &GroupConfig,
        commit_index: u64,
    ) -> RaftResult<(Self, Recovered)> {
        let dir: &Path = config.data_dir.as_path();
        let logs = LogFileQueue::init(
            group.clone(),
            schedule.clone(),
            dir.join("log"),
            config.log_file_shift_bits,
        )
        .await?;
        let first_hint = logs.first_index();
        let idx = IdxFileQueue::init(
            group.clone(),
            schedule.clone(),
            dir.join("idx"),
            config.idx_file_shift_bits,
            first_hint,
        )
        .await?;

        // Prefer scanning from the commit position; fall back to the head
        // of the queue when the index cannot produce it.
        let mut scan_from = logs.queue_start_position();
        let mut expect = None;
        if commit_index > 0 {
            idx.seed(first_hint, commit_index + 1, commit_index);
            match idx.load_log_pos(commit_index).await {
                Ok(pos) => match logs.read_brief(pos).await {
                    Ok(Some(brief)) if brief.index == commit_index => {
                        scan_from = pos;
                        expect = Some(commit_index);
                    }
                    _ => {
                        tracing::warn!(commit_index, pos, "index does not match log, rescanning from head");
                    }
                },
                Err(err) => {
                    tracing::warn!(commit_index, error = %err, "commit position unavailable, rescanning from head");
                }
            }
        }

        let outcome = logs.restore_scan(scan_from, expect).await?;
        if outcome.last_index < commit_index {
            return Err(RaftError::ChecksumFailure { pos: outcome.end_pos });
        }

        let first_index = logs.first_index();
        let (next_index, last_term) = if outcome.last_index == 0 {
            (first_index, 0)
        } else {
            (outcome.last_index + 1, outcome.last_term)
        };

        // Re-put the scanned tail so the index covers everything the log
        // holds, then flush through it.
        idx.seed(first_index, outcome.entries.first().map(|(i, _)| *i).unwrap_or(next_index), 0);
        for &(index, pos) in &outcome.entries {
            idx.put(index, pos);
        }
        if outcome.last_index > 0 {
            idx.flush_to(outcome.last_index).await?;
        }

        let recovered = Recovered {
            first_index,
            last_index: outcome.last_index,
            last_term,
        };
        tracing::info!(?recovered, commit_index, "raft log recovered");
        let log = Self {
            group,
            logs,
            idx,
            state: Rc::new(RefCell::new(LogState {
                next_index,
                last_term,
                marker: None,
            })),
        };
        Ok((log, recovered))
    }

    pub fn next_index(&self) -> u64 {
        self.state.borrow().next_index
    }

    pub fn first_index(&self) -> u64 {
        self.logs.first_index()
    }

    pub fn last_term(&self) -> Term {
        self.state.borrow().last_term
    }

    /// Append an ordered, contiguous batch.
    ///
    /// `first == next` appends; `first < next` rewrites a divergent tail
    /// by truncating both queues back to `first`; `first > next` is a gap
    /// and fatal for the group.
    pub async fn append(&self, items: &[LogItem]) -> RaftResult<()> {
        let Some(first) = items.first().map(|i| i.index) else {
            return Ok(());
        };
        let next = self.next_index();
        if first > next {
            return Err(RaftError::LogGap { first, next });
        }
        if first < next {
            let pos = self.idx.load_log_pos(first).await?;
            tracing::info!(first, next, pos, "truncating divergent tail before append");
            self.logs.truncate_to(pos).await?;
            self.idx.truncate_tail(first);
            self.state.borrow_mut().next_index = first;
        }

        let positions = self.logs.append(items).await?;
        for (item, pos) in items.iter().zip(&positions) {
            self.idx.put(item.index, *pos);
        }
        {
            let mut state = self.state.borrow_mut();
            let last = items.last().expect("batch checked non-empty");
            state.next_index = last.index + 1;
            state.last_term = last.term;
        }
        if self.idx.needs_flush() {
            let upto = self.next_index() - 1;
            self.idx.flush_to(upto).await?;
        }
        Ok(())
    }

    /// Read up to `max_items` entries starting at `start`, stopping early
    /// once `max_bytes` of payload have been gathered.
    pub async fn read(&self, start: u64, max_items: usize, max_bytes: u64) -> RaftResult<Vec<LogItem>> {
        let mut out = Vec::new();
        let mut bytes = 0u64;
        let mut index = start;
        while index < self.next_index() && out.len() < max_items {
            let pos = self.idx.load_log_pos(index).await?;
            let item = self.logs.read_item(pos).await?;
            bytes += item.payload_len();
            out.push(item);
            index += 1;
            if bytes >= max_bytes {
                break;
            }
        }
        Ok(out)
    }

    /// The term at `index`, or `None` if the entry is no longer retained
    /// (reclaimed prefix) or does not exist yet.
    pub async fn term_of(&self, index: u64) -> RaftResult<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        {
            let state = self.state.borrow();
            if index >= state.next_index {
                return Ok(None);
            }
            if index + 1 == state.next_index {
                return Ok(Some(state.last_term));
            }
        }
        if index < self.first_index() {
            return Ok(None);
        }
        let pos = self.idx.load_log_pos(index).await?;
        Ok(Some(self.logs.term_at(pos).await?))
    }

    /// Make the index durable up to `upto`; called as the commit index
    /// advances so restore can trust the commit position.
    pub async fn flush_index(&self, upto: u64) -> RaftResult<()> {
        let upto = upto.min(self.next_index().saturating_sub(1));
        self.idx.flush_to(upto).await
    }

    /// Ask for reclamation of everything up to `max_index`, capped at
    /// `commit_index - 1`. The delete round runs after `delay`.
    pub fn mark_truncate_by_index(&self, max_index: u64, commit_index: u64, delay: Duration) {
        let bound = max_index.min(commit_index.saturating_sub(1));
        if bound == 0 {
            return;
        }
        self.state.borrow_mut().marker = Some(Marker {
            bound: ReclaimBound::ByIndex(bound),
            fire_at: Instant::now() + delay,
        });
    }

    /// Ask for reclamation of segments whose records are all older than
    /// `timestamp`.
    pub fn mark_truncate_by_timestamp(&self, timestamp: u64, delay: Duration) {
        self.state.borrow_mut().marker = Some(Marker {
            bound: ReclaimBound::ByTimestamp(timestamp),
            fire_at: Instant::now() + delay,
        });
    }

    /// One reclamation round: delete head segments the active marker
    /// allows, then release index segments below the new first index.
    pub async fn run_reclaim_round(&self) -> RaftResult<()> {
        {
            let state = self.state.borrow();
            match &state.marker {
                Some(marker) if marker.fire_at <= Instant::now() => {}
                _ => return Ok(()),
            }
        }
        loop {
            if !self.logs.can_delete() {
                break;
            }
            let Some(second_start) = self.logs.second_segment_start() else {
                break;
            };
            let Some(next_brief) = self.logs.read_brief(second_start).await? else {
                // Next segment was pre-allocated but never written; the
                // head still carries the tail.
                break;
            };
            let deletable = {
                let state = self.state.borrow();
                match &state.marker {
                    Some(Marker { bound: ReclaimBound::ByIndex(bound), .. }) => {
                        next_brief.index <= bound + 1
                    }
                    Some(Marker { bound: ReclaimBound::ByTimestamp(ts), .. }) => {
                        next_brief.timestamp <= *ts
                    }
                    None => false,
                }
            };
            if !deletable {
                break;
            }
            self.logs.delete_head(next_brief.index).await?;
        }
        self.state.borrow_mut().marker = None;
        self.idx.reclaim_below(self.logs.first_index()).await
    }

    /// Spawn the background reclamation fiber: at most one delete round
    /// per interval.
    pub fn spawn_reclaim_fiber(&self, interval: Duration) {
        let log = self.clone();
        let group = self.group.clone();
        self.group.spawn_daemon("log-reclaim", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = group.stopped() => return,
                }
                if let Err(err) = log.run_reclaim_round().await {
                    crate::error::record_failure("log reclaim", &err);
                }
            }
        });
    }

    /// Replace the whole log after a snapshot install: both queues
    /// restart just past `last_index`.
    pub async fn reset_to(&self, last_index: u64, last_term: Term) -> RaftResult<()> {
        self.logs.reset_to(last_index + 1).await?;
        self.idx.reset_to(last_index + 1).await?;
        let mut state = self.state.borrow_mut();
        state.next_index = last_index + 1;
        state.last_term = last_term;
        state.marker = None;
        tracing::info!(last_index, last_term, "log reset after snapshot install");
        Ok(())
    }

    /// Flush everything the index still buffers. Called on shutdown.
    pub async fn close(&self) -> RaftResult<()> {
        let upto = self.next_index().saturating_sub(1);
        if upto > 0 {
            self.idx.flush_to(upto).await?;
        }
        Ok(())
    }
}

/// Directory helpers shared by the engine.
pub(crate) fn status_path(data_dir: &Path) -> PathBuf {
    data_dir.join("status")
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::fiber::Dispatcher;
    use crate::fiber::FiberFuture;
    use crate::fiber::FiberGroup;

    /// Run an async test body inside a fiber on a fresh dispatcher.
    pub(crate) async fn run_in_group<F, Fut, T>(name: &'static str, f: F) -> T
    where
        F: FnOnce(FiberGroup) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let dispatcher = Dispatcher::spawn(name).unwrap();
        let group = dispatcher.create_group("test-group").await.unwrap();
        let (out, completer) = FiberFuture::new();
        group
            .run(move |g| {
                let inner = g.clone();
                g.spawn("test-body", async move {
                    completer.complete(f(inner).await);
                });
            })
            .unwrap();
        let res = out.await.unwrap();
        group.request_stop();
        group.join().await;
        dispatcher.shutdown();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::run_in_group;
    use bytes::Bytes;
    use crate::types::ItemType;
    use pretty_assertions::assert_eq;

    fn schedule() -> RetrySchedule {
        RetrySchedule::new(vec![Duration::from_millis(1)])
    }

    fn group_config(dir: &Path) -> GroupConfig {
        let mut config = GroupConfig::new(1, vec![1], dir);
        config.log_file_shift_bits = 14;
        config.idx_file_shift_bits = 12;
        config
    }

    fn item(index: u64, term: Term, prev: Term) -> LogItem {
        LogItem {
            index,
            term,
            prev_log_term: prev,
            timestamp: 1_000 + index,
            item_type: ItemType::Normal,
            biz_type: 0,
            header: Bytes::new(),
            body: Bytes::from(format!("entry-{}", index)),
        }
    }

    #[tokio::test]
    async fn append_read_and_terms() {
        let dir = tempfile::tempdir().unwrap();
        let config = group_config(dir.path());
        run_in_group("raftlog-basic", move |group| async move {
            let (log, recovered) = RaftLog::open(group, schedule(), &config, 0).await.unwrap();
            assert_eq!(recovered.last_index, 0);
            log.append(&[item(1, 1, 0), item(2, 1, 1), item(3, 2, 1)]).await.unwrap();
            assert_eq!(log.next_index(), 4);
            assert_eq!(log.last_term(), 2);
            let read = log.read(1, 10, u64::MAX).await.unwrap();
            assert_eq!(read.len(), 3);
            assert_eq!(read[2].term, 2);
            assert_eq!(log.term_of(2).await.unwrap(), Some(1));
            assert_eq!(log.term_of(3).await.unwrap(), Some(2));
            assert_eq!(log.term_of(9).await.unwrap(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn divergent_tail_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let config = group_config(dir.path());
        run_in_group("raftlog-rewrite", move |group| async move {
            let (log, _) = RaftLog::open(group, schedule(), &config, 0).await.unwrap();
            log.append(&[item(1, 1, 0), item(2, 1, 1), item(3, 1, 1)]).await.unwrap();
            // A new leader overwrites index 2 onward with term 2 entries.
            log.append(&[item(2, 2, 1), item(3, 2, 2)]).await.unwrap();
            assert_eq!(log.next_index(), 4);
            let read = log.read(1, 10, u64::MAX).await.unwrap();
            assert_eq!(read[1].term, 2);
            assert_eq!(read[2].term, 2);
        })
        .await;
    }

    #[tokio::test]
    async fn gap_append_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = group_config(dir.path());
        run_in_group("raftlog-gap", move |group| async move {
            let (log, _) = RaftLog::open(group, schedule(), &config, 0).await.unwrap();
            log.append(&[item(1, 1, 0)]).await.unwrap();
            let err = log.append(&[item(5, 1, 1)]).await.unwrap_err();
            assert!(matches!(err, RaftError::LogGap { first: 5, next: 2 }));
        })
        .await;
    }

    #[tokio::test]
    async fn restore_is_a_fixed_point_of_persist() {
        let dir = tempfile::tempdir().unwrap();
        let config = group_config(dir.path());
        let c2 = config.clone();
        run_in_group("raftlog-restore", move |group| async move {
            let (log, _) = RaftLog::open(group.clone(), schedule(), &c2, 0).await.unwrap();
            let mut items = Vec::new();
            let mut prev = 0;
            for i in 1..=50u64 {
                let term = if i <= 25 { 1 } else { 2 };
                items.push(item(i, term, prev));
                prev = term;
            }
            log.append(&items).await.unwrap();
            log.flush_index(30).await.unwrap();
            log.close().await.unwrap();
            drop(log);

            // Restart as after a clean shutdown with commit at 30.
            let (log, recovered) = RaftLog::open(group, schedule(), &c2, 30).await.unwrap();
            assert_eq!(
                recovered,
                Recovered {
                    first_index: 1,
                    last_index: 50,
                    last_term: 2
                }
            );
            let read = log.read(1, 100, u64::MAX).await.unwrap();
            assert_eq!(read, items);
        })
        .await;
    }

    #[tokio::test]
    async fn reclaim_rounds_release_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = group_config(dir.path());
        config.log_file_shift_bits = 12; // 4 KiB segments fill quickly
        run_in_group("raftlog-reclaim", move |group| async move {
            let (log, _) = RaftLog::open(group, schedule(), &config, 0).await.unwrap();
            let mut items = Vec::new();
            for i in 1..=200u64 {
                let mut it = item(i, 1, if i == 1 { 0 } else { 1 });
                it.body = Bytes::from(vec![7u8; 100]);
                items.push(it);
            }
            log.append(&items).await.unwrap();
            assert_eq!(log.first_index(), 1);

            log.mark_truncate_by_index(150, 180, Duration::from_millis(0));
            tokio::time::sleep(Duration::from_millis(5)).await;
            log.run_reclaim_round().await.unwrap();

            let first = log.first_index();
            assert!(first > 1, "head segments should have been reclaimed");
            assert!(first <= 151, "must not reclaim past the marker bound");
            // Everything still retained reads back.
            let read = log.read(first, 300, u64::MAX).await.unwrap();
            assert_eq!(read.last().unwrap().index, 200);
            assert!(log.term_of(first - 1).await.unwrap().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn reset_replaces_the_log_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = group_config(dir.path());
        run_in_group("raftlog-reset", move |group| async move {
            let (log, _) = RaftLog::open(group, schedule(), &config, 0).await.unwrap();
            log.append(&[item(1, 1, 0), item(2, 1, 1)]).await.unwrap();
            log.reset_to(100, 3).await.unwrap();
            assert_eq!(log.next_index(), 101);
            assert_eq!(log.first_index(), 101);
            assert_eq!(log.last_term(), 3);
            log.append(&[item(101, 3, 3)]).await.unwrap();
            let read = log.read(101, 10, u64::MAX).await.unwrap();
            assert_eq!(read.len(), 1);
        })
        .await;
    }
}

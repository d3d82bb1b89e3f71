//! The index queue: fixed-width `log index → log position` records.
//!
//! Entry `i` lives at byte `i * 8` of the index stream, so lookup is pure
//! arithmetic. Recent entries are buffered in a memory cache and flushed
//! in batches; the recovery scan of the log rebuilds whatever tail had
//! not been flushed at crash time.

use std::collections::VecDeque;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::{cell::RefCell, sync::Arc};

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::io_call;
use crate::fiber::retry::retry_io;
use crate::fiber::FiberGroup;
use crate::fiber::RetrySchedule;
use crate::store::file_queue::FileQueue;

pub(crate) const IDX_ITEM_LEN: u64 = 8;

/// Entries kept in memory after they have been flushed, so hot readers
/// rarely touch the disk.
const CACHE_RETAIN: usize = 8 * 1024;
/// Flush once this many unflushed entries pile up.
const FLUSH_BATCH: usize = 1024;

pub(crate) fn idx_pos_of(index: u64) -> u64 {
    index * IDX_ITEM_LEN
}

struct IdxState {
    /// `(index, log position)`, contiguous, oldest first.
    cache: VecDeque<(u64, u64)>,
    /// The next index expected by `put`.
    next_index: u64,
    /// Highest index whose entry is on disk.
    persisted_index: u64,
    first_index: u64,
}

#[derive(Clone)]
pub(crate) struct IdxFileQueue {
    queue: FileQueue,
    group: FiberGroup,
    schedule: RetrySchedule,
    state: Rc<RefCell<IdxState>>,
}

impl IdxFileQueue {
    pub async fn init(
        group: FiberGroup,
        schedule: RetrySchedule,
        dir: PathBuf,
        shift_bits: u32,
        first_index: u64,
    ) -> RaftResult<Self> {
        let queue = FileQueue::init(
            group.clone(),
            schedule.clone(),
            dir,
            shift_bits,
            idx_pos_of(first_index),
        )
        .await?;
        Ok(Self {
            queue,
            group,
            schedule,
            state: Rc::new(RefCell::new(IdxState {
                cache: VecDeque::new(),
                next_index: first_index,
                persisted_index: first_index.saturating_sub(1),
                first_index,
            })),
        })
    }

    /// Reposition after a recovery scan: entries up to and including
    /// `persisted_index` are trusted on disk, the cache restarts empty and
    /// the next `put` must carry `next_index`.
    pub fn seed(&self, first_index: u64, next_index: u64, persisted_index: u64) {
        let mut state = self.state.borrow_mut();
        state.cache.clear();
        state.first_index = first_index;
        state.next_index = next_index;
        state.persisted_index = persisted_index.min(next_index.saturating_sub(1));
    }

    pub fn next_index(&self) -> u64 {
        self.state.borrow().next_index
    }

    pub fn first_index(&self) -> u64 {
        self.state.borrow().first_index
    }

    /// Record the position of `index`. Entries arrive strictly in order;
    /// a rewrite after a conflict goes through `truncate_tail` first.
    pub fn put(&self, index: u64, log_pos: u64) {
        let mut state = self.state.borrow_mut();
        debug_assert_eq!(index, state.next_index, "index entries must be contiguous");
        state.cache.push_back((index, log_pos));
        state.next_index = index + 1;
    }

    /// Whether enough unflushed entries accumulated to warrant a batch
    /// flush.
    pub fn needs_flush(&self) -> bool {
        let state = self.state.borrow();
        let unflushed = state.next_index.saturating_sub(state.persisted_index + 1);
        unflushed as usize >= FLUSH_BATCH
    }

    /// Flush cached entries up to and including `upto` to disk.
    pub async fn flush_to(&self, upto: u64) -> RaftResult<()> {
        let (run_start, buf) = {
            let state = self.state.borrow();
            let start = state.persisted_index + 1;
            if upto < start {
                return Ok(());
            }
            let mut buf: Vec<u8> = Vec::new();
            let mut run_start = None;
            for &(index, pos) in state.cache.iter() {
                if index < start {
                    continue;
                }
                if index > upto {
                    break;
                }
                if run_start.is_none() {
                    run_start = Some(index);
                }
                buf.extend_from_slice(&pos.to_le_bytes());
            }
            match run_start {
                Some(s) => (s, buf),
                None => return Ok(()),
            }
        };

        // One contiguous byte run, but it may cross segment boundaries.
        let mut written = 0u64;
        let total = buf.len() as u64;
        while written < total {
            let pos = idx_pos_of(run_start) + written;
            self.queue.ensure_write_pos_ready(pos).await?;
            let remaining_in_file = self.queue.file_size() - (pos & (self.queue.file_size() - 1));
            let chunk = remaining_in_file.min(total - written);
            let (file, offset) = self.queue.file_at(pos)?;
            let slice = buf[written as usize..(written + chunk) as usize].to_vec();
            let slice = Arc::new(slice);
            retry_io(&self.group, "idx write", &self.schedule, || {
                let file = file.clone();
                let slice = slice.clone();
                async move { io_call(move || file.write_at(&slice, offset).map(|_| ())).await }
            })
            .await?;
            retry_io(&self.group, "idx fsync", &self.schedule, || {
                let file = file.clone();
                async move { io_call(move || file.sync_data()).await }
            })
            .await?;
            written += chunk;
        }

        let mut state = self.state.borrow_mut();
        let flushed_upto = run_start + (total / IDX_ITEM_LEN) - 1;
        state.persisted_index = state.persisted_index.max(flushed_upto);
        let persisted = state.persisted_index;
        while state.cache.len() > CACHE_RETAIN {
            match state.cache.front() {
                Some(&(index, _)) if index <= persisted => {
                    state.cache.pop_front();
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Look up the log position of `index`: memory cache first, else a
    /// synchronous read from the index files.
    pub async fn load_log_pos(&self, index: u64) -> RaftResult<u64> {
        {
            let state = self.state.borrow();
            if index < state.first_index || index >= state.next_index {
                return Err(RaftError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("index {} outside [{}, {})", index, state.first_index, state.next_index),
                )));
            }
            if let Some(&(front, _)) = state.cache.front() {
                if index >= front {
                    let offset = (index - front) as usize;
                    if let Some(&(cached_index, pos)) = state.cache.get(offset) {
                        debug_assert_eq!(cached_index, index);
                        return Ok(pos);
                    }
                }
            }
        }
        self.sync_load_log_pos(index).await
    }

    async fn sync_load_log_pos(&self, index: u64) -> RaftResult<u64> {
        let pos = idx_pos_of(index);
        let (file, offset) = self.queue.file_at(pos)?;
        let raw = retry_io(&self.group, "idx read", &self.schedule, || {
            let file = file.clone();
            async move {
                io_call(move || {
                    let mut buf = [0u8; IDX_ITEM_LEN as usize];
                    file.read_exact_at(&mut buf, offset)?;
                    Ok(buf)
                })
                .await
            }
        })
        .await?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Drop all entries at and above `index`; the follower is rewriting a
    /// divergent tail.
    pub fn truncate_tail(&self, index: u64) {
        let mut state = self.state.borrow_mut();
        while matches!(state.cache.back(), Some(&(i, _)) if i >= index) {
            state.cache.pop_back();
        }
        if state.next_index > index {
            state.next_index = index;
        }
        if state.persisted_index >= index {
            state.persisted_index = index.saturating_sub(1);
        }
    }

    /// Delete index segments that only cover indexes below
    /// `first_log_index`.
    pub async fn reclaim_below(&self, first_log_index: u64) -> RaftResult<()> {
        loop {
            if !self.queue.can_delete() {
                return Ok(());
            }
            let head_end = match self.queue.head_range() {
                Some((_, end)) => end,
                None => return Ok(()),
            };
            // Highest index addressed by the head segment.
            let head_last_index = (head_end / IDX_ITEM_LEN).saturating_sub(1);
            if head_last_index >= first_log_index {
                return Ok(());
            }
            self.queue.delete_first().await?;
            let mut state = self.state.borrow_mut();
            state.first_index = state.first_index.max(head_end / IDX_ITEM_LEN);
        }
    }

    /// Restart the index after a snapshot replaced the log.
    pub async fn reset_to(&self, first_index: u64) -> RaftResult<()> {
        self.queue.reset(idx_pos_of(first_index)).await?;
        self.seed(first_index, first_index, first_index.saturating_sub(1));
        Ok(())
    }
}

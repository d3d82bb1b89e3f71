//! The base segmented file queue.
//!
//! A queue is an ordered list of fixed-size append-only files inside one
//! directory. Each file is named by the byte offset of its first byte
//! within the logical stream, zero padded to 20 decimal digits, so a file
//! lookup from a stream position is a shift and an index. Allocation runs
//! ahead of the writer on its own fiber; deletion releases head files one
//! round at a time.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::{cell::RefCell, collections::VecDeque};

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::io_call;
use crate::fiber::retry::retry_io;
use crate::fiber::FiberFuture;
use crate::fiber::FiberGroup;
use crate::fiber::RetrySchedule;

/// One open segment.
pub(crate) struct QueueFile {
    pub start_pos: u64,
    pub file: Arc<File>,
    pub path: PathBuf,
}

struct FqState {
    files: VecDeque<QueueFile>,
    queue_start_position: u64,
    queue_end_position: u64,
    allocating: Option<FiberFuture<QueueFile>>,
    deleting: bool,
}

/// An ordered queue of fixed-size segment files. Cheap to clone; all
/// clones share the queue state and run on the owning group's thread.
#[derive(Clone)]
pub(crate) struct FileQueue {
    dir: PathBuf,
    file_size: u64,
    shift_bits: u32,
    group: FiberGroup,
    schedule: RetrySchedule,
    state: Rc<RefCell<FqState>>,
}

fn segment_name(start_pos: u64) -> String {
    format!("{:020}", start_pos)
}

fn scan_dir(dir: &Path, file_size: u64) -> std::io::Result<Vec<(u64, File, PathBuf)>> {
    std::fs::create_dir_all(dir)?;
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() != 20 {
            continue;
        }
        let start_pos: u64 = match name.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let path = entry.path();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len != file_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment {} has length {}, expected {}", name, len, file_size),
            ));
        }
        if start_pos % file_size != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment {} is not aligned to {}", name, file_size),
            ));
        }
        found.push((start_pos, file, path));
    }
    found.sort_by_key(|(pos, _, _)| *pos);
    for pair in found.windows(2) {
        if pair[0].0 + file_size != pair[1].0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment gap between {} and {}", pair[0].0, pair[1].0),
            ));
        }
    }
    Ok(found)
}

impl FileQueue {
    /// Open the queue, validating alignment, sizes and contiguity of any
    /// existing segments. An empty directory starts the queue at
    /// `init_pos` rounded down to a segment boundary.
    pub async fn init(
        group: FiberGroup,
        schedule: RetrySchedule,
        dir: PathBuf,
        shift_bits: u32,
        init_pos: u64,
    ) -> RaftResult<Self> {
        let file_size = 1u64 << shift_bits;
        let scan_dir_path = dir.clone();
        let found = retry_io(&group, "open segment dir", &schedule, || {
            let d = scan_dir_path.clone();
            async move { io_call(move || scan_dir(&d, file_size)).await }
        })
        .await?;

        let (start, end) = match (found.first(), found.last()) {
            (Some(first), Some(last)) => (first.0, last.0 + file_size),
            _ => {
                let aligned = init_pos & !(file_size - 1);
                (aligned, aligned)
            }
        };
        let files = found
            .into_iter()
            .map(|(start_pos, file, path)| QueueFile {
                start_pos,
                file: Arc::new(file),
                path,
            })
            .collect();
        tracing::debug!(dir = %dir.display(), start, end, "file queue opened");
        Ok(Self {
            dir,
            file_size,
            shift_bits,
            group,
            schedule,
            state: Rc::new(RefCell::new(FqState {
                files,
                queue_start_position: start,
                queue_end_position: end,
                allocating: None,
                deleting: false,
            })),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn start_position(&self) -> u64 {
        self.state.borrow().queue_start_position
    }

    pub fn end_position(&self) -> u64 {
        self.state.borrow().queue_end_position
    }

    pub fn file_count(&self) -> usize {
        self.state.borrow().files.len()
    }

    /// The segment containing `pos`, with the offset of `pos` inside it.
    pub fn file_at(&self, pos: u64) -> RaftResult<(Arc<File>, u64)> {
        let state = self.state.borrow();
        if pos < state.queue_start_position || pos >= state.queue_end_position {
            return Err(RaftError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("position {} outside queue", pos),
            )));
        }
        let first_start = match state.files.front() {
            Some(f) => f.start_pos,
            None => {
                return Err(RaftError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "queue is empty",
                )))
            }
        };
        let idx = ((pos - first_start) >> self.shift_bits) as usize;
        let file = state.files[idx].file.clone();
        Ok((file, pos & (self.file_size - 1)))
    }

    /// The start positions of the first and last segments, if any.
    pub fn head_range(&self) -> Option<(u64, u64)> {
        let state = self.state.borrow();
        state
            .files
            .front()
            .map(|f| (f.start_pos, f.start_pos + self.file_size))
    }

    fn start_allocation(&self) {
        let start_pos = {
            let state = self.state.borrow();
            if state.allocating.is_some() {
                return;
            }
            state.queue_end_position
        };
        let (fut, completer) = FiberFuture::new();
        self.state.borrow_mut().allocating = Some(fut);

        let path = self.dir.join(segment_name(start_pos));
        let file_size = self.file_size;
        let group = self.group.clone();
        let schedule = self.schedule.clone();
        let alloc_group = group.clone();
        group.spawn_daemon("segment-alloc", async move {
            let res = retry_io(&alloc_group, "allocate segment", &schedule, || {
                let p = path.clone();
                async move {
                    io_call(move || {
                        let file = OpenOptions::new().read(true).write(true).create(true).open(&p)?;
                        // Reserve the blocks up front so the append path
                        // never extends the file.
                        file.write_at(&[0u8], file_size - 1)?;
                        file.sync_all()?;
                        Ok(file)
                    })
                    .await
                }
            })
            .await;
            match res {
                Ok(file) => completer.complete(QueueFile {
                    start_pos,
                    file: Arc::new(file),
                    path,
                }),
                Err(err) => completer.fail(err),
            }
        });
    }

    /// Wait until the queue covers `pos`, then kick off pre-allocation of
    /// the next segment so a steady writer never waits.
    pub async fn ensure_write_pos_ready(&self, pos: u64) -> RaftResult<()> {
        loop {
            let pending = {
                let mut state = self.state.borrow_mut();
                if pos < state.queue_end_position {
                    None
                } else {
                    state.allocating.take()
                }
            };
            match pending {
                None => {
                    if pos < self.state.borrow().queue_end_position {
                        break;
                    }
                    self.start_allocation();
                }
                Some(fut) => {
                    let queue_file = fut.await?;
                    let mut state = self.state.borrow_mut();
                    state.queue_end_position = queue_file.start_pos + self.file_size;
                    state.files.push_back(queue_file);
                }
            }
        }
        if self.state.borrow().allocating.is_none() {
            self.start_allocation();
        }
        Ok(())
    }

    /// Whether a delete round may run now: more than one segment and no
    /// delete already in flight.
    pub fn can_delete(&self) -> bool {
        let state = self.state.borrow();
        state.files.len() > 1 && !state.deleting
    }

    /// Delete the head segment. One round at a time; a failed round clears
    /// the flag and is not retried until the next round.
    pub async fn delete_first(&self) -> RaftResult<()> {
        let path = {
            let mut state = self.state.borrow_mut();
            if state.files.len() <= 1 || state.deleting {
                return Ok(());
            }
            state.deleting = true;
            state.files.front().map(|f| f.path.clone())
        };
        let path = match path {
            Some(p) => p,
            None => return Ok(()),
        };
        let unlink = path.clone();
        let res = io_call(move || std::fs::remove_file(&unlink)).await;
        let mut state = self.state.borrow_mut();
        state.deleting = false;
        match res {
            Ok(()) => {
                if let Some(removed) = state.files.pop_front() {
                    state.queue_start_position = removed.start_pos + self.file_size;
                }
                tracing::debug!(path = %path.display(), "segment deleted");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "segment delete failed");
                Err(RaftError::Io(err))
            }
        }
    }

    /// Drop every segment and restart the queue at `new_pos`. Used when a
    /// snapshot install replaces the whole log.
    pub async fn reset(&self, new_pos: u64) -> RaftResult<()> {
        let paths: Vec<PathBuf> = {
            let mut state = self.state.borrow_mut();
            state.allocating = None;
            state.files.drain(..).map(|f| f.path).collect()
        };
        for path in paths {
            let p = path.clone();
            retry_io(&self.group, "remove segment", &self.schedule, || {
                let p2 = p.clone();
                async move { io_call(move || std::fs::remove_file(&p2)).await }
            })
            .await?;
        }
        let aligned = new_pos & !(self.file_size - 1);
        let mut state = self.state.borrow_mut();
        state.queue_start_position = aligned;
        state.queue_end_position = aligned;
        Ok(())
    }
}

//! Log segments: record framing, append, tail scan and truncation.
//!
//! On-disk record layout (little-endian):
//!
//! ```text
//! magic u32 | total_len u32 | term u32 | prev_log_term u32 | index u64 |
//! timestamp u64 | type u8 | biz_type u32 | header_len u32 | body_len u32 |
//! header | body | crc32 u32
//! ```
//!
//! The CRC covers every byte of the record before it. A padding record
//! carries a distinct magic and a `total_len` spanning the remainder of
//! its segment; records never straddle a segment boundary.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::{cell::RefCell, collections::HashMap};

use bytes::Bytes;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fiber::io_call;
use crate::fiber::retry::retry_io;
use crate::fiber::FiberGroup;
use crate::fiber::RetrySchedule;
use crate::store::file_queue::FileQueue;
use crate::types::ItemType;
use crate::types::LogItem;
use crate::types::Term;

pub(crate) const DATA_MAGIC: u32 = 0x5EC0_7A11;
pub(crate) const PADDING_MAGIC: u32 = 0x5EC0_F111;

/// Fixed part of a data record: everything before the variable header,
/// body and trailing CRC.
pub(crate) const RECORD_HEADER_LEN: usize = 45;
/// Smallest prefix that identifies a record: magic and total_len.
pub(crate) const RECORD_BRIEF_LEN: usize = 8;
pub(crate) const CRC_LEN: usize = 4;

/// Encode one item into its on-disk record.
pub(crate) fn encode_record(item: &LogItem) -> Vec<u8> {
    let total = RECORD_HEADER_LEN + item.header.len() + item.body.len() + CRC_LEN;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&DATA_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&item.term.to_le_bytes());
    buf.extend_from_slice(&item.prev_log_term.to_le_bytes());
    buf.extend_from_slice(&item.index.to_le_bytes());
    buf.extend_from_slice(&item.timestamp.to_le_bytes());
    buf.push(item.item_type as u8);
    buf.extend_from_slice(&item.biz_type.to_le_bytes());
    buf.extend_from_slice(&(item.header.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(item.body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&item.header);
    buf.extend_from_slice(&item.body);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub magic: u32,
    pub total_len: u32,
    pub term: Term,
    pub prev_log_term: Term,
    pub index: u64,
    pub timestamp: u64,
    pub item_type: u8,
    pub biz_type: u32,
    pub header_len: u32,
    pub body_len: u32,
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

pub(crate) fn parse_record_header(buf: &[u8]) -> RecordHeader {
    RecordHeader {
        magic: le_u32(buf, 0),
        total_len: le_u32(buf, 4),
        term: le_u32(buf, 8),
        prev_log_term: le_u32(buf, 12),
        index: le_u64(buf, 16),
        timestamp: le_u64(buf, 24),
        item_type: buf[32],
        biz_type: le_u32(buf, 33),
        header_len: le_u32(buf, 37),
        body_len: le_u32(buf, 41),
    }
}

/// Decode a complete raw record previously framed by [`encode_record`].
/// The CRC must already have been verified by the caller.
fn record_to_item(hdr: &RecordHeader, raw: &[u8]) -> RaftResult<LogItem> {
    let item_type = ItemType::from_u8(hdr.item_type).ok_or(RaftError::ChecksumFailure { pos: 0 })?;
    let header_end = RECORD_HEADER_LEN + hdr.header_len as usize;
    let body_end = header_end + hdr.body_len as usize;
    Ok(LogItem {
        index: hdr.index,
        term: hdr.term,
        prev_log_term: hdr.prev_log_term,
        timestamp: hdr.timestamp,
        item_type,
        biz_type: hdr.biz_type,
        header: Bytes::copy_from_slice(&raw[RECORD_HEADER_LEN..header_end]),
        body: Bytes::copy_from_slice(&raw[header_end..body_end]),
    })
}

fn record_crc_ok(raw: &[u8]) -> bool {
    let body = &raw[..raw.len() - CRC_LEN];
    let stored = le_u32(raw, raw.len() - CRC_LEN);
    crc32fast::hash(body) == stored
}

/// A cheap summary of the record starting at some position.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordBrief {
    pub index: u64,
    pub term: Term,
    pub timestamp: u64,
}

/// What the recovery scan found.
pub(crate) struct ScanOutcome {
    pub last_index: u64,
    pub last_term: Term,
    /// `(index, position)` of every valid record scanned, in order.
    pub entries: Vec<(u64, u64)>,
    /// The position just past the last valid record; the new tail.
    pub end_pos: u64,
}

struct LfqState {
    write_pos: u64,
    first_index: u64,
}

/// The queue of log segments plus the record-level append and scan logic.
#[derive(Clone)]
pub(crate) struct LogFileQueue {
    queue: FileQueue,
    group: FiberGroup,
    schedule: RetrySchedule,
    state: Rc<RefCell<LfqState>>,
}

impl LogFileQueue {
    pub async fn init(
        group: FiberGroup,
        schedule: RetrySchedule,
        dir: PathBuf,
        shift_bits: u32,
    ) -> RaftResult<Self> {
        let queue = FileQueue::init(group.clone(), schedule.clone(), dir, shift_bits, 0).await?;
        let this = Self {
            queue,
            group,
            schedule,
            state: Rc::new(RefCell::new(LfqState {
                write_pos: 0,
                first_index: 1,
            })),
        };
        // The head segment always begins with a record, so the first
        // retained index is read straight off it.
        if let Some((head_start, _)) = this.queue.head_range() {
            this.state.borrow_mut().write_pos = head_start;
            if let Some(brief) = this.read_brief(head_start).await? {
                this.state.borrow_mut().first_index = brief.index;
            }
        }
        Ok(this)
    }

    pub fn file_size(&self) -> u64 {
        self.queue.file_size()
    }

    pub fn first_index(&self) -> u64 {
        self.state.borrow().first_index
    }

    pub fn write_pos(&self) -> u64 {
        self.state.borrow().write_pos
    }

    pub fn queue_start_position(&self) -> u64 {
        self.queue.start_position()
    }

    fn remaining_in_file(&self, pos: u64) -> u64 {
        self.file_size() - (pos & (self.file_size() - 1))
    }

    async fn write_at_retry(&self, pos: u64, data: Vec<u8>) -> RaftResult<Arc<File>> {
        self.queue.ensure_write_pos_ready(pos + data.len() as u64 - 1).await?;
        let (file, offset) = self.queue.file_at(pos)?;
        let data = Arc::new(data);
        retry_io(&self.group, "log write", &self.schedule, || {
            let file = file.clone();
            let data = data.clone();
            async move { io_call(move || file.write_at(&data, offset).map(|_| ())).await }
        })
        .await?;
        Ok(file)
    }

    async fn sync_file(&self, file: Arc<File>) -> RaftResult<()> {
        retry_io(&self.group, "log fsync", &self.schedule, || {
            let file = file.clone();
            async move { io_call(move || file.sync_data()).await }
        })
        .await
    }

    /// Append an ordered batch, returning the position of each record.
    /// The caller guarantees contiguous indexes; this layer only places
    /// bytes.
    pub async fn append(&self, items: &[LogItem]) -> RaftResult<Vec<u64>> {
        let mut positions = Vec::with_capacity(items.len());
        let mut touched: HashMap<u64, Arc<File>> = HashMap::new();
        let file_size = self.file_size();
        for item in items {
            let record = encode_record(item);
            if record.len() as u64 > file_size {
                return Err(RaftError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("record of {} bytes exceeds segment size {}", record.len(), file_size),
                )));
            }
            let record_len = record.len() as u64;
            let mut pos = self.write_pos();
            let remaining = self.remaining_in_file(pos);
            if record_len > remaining {
                self.write_padding(pos, remaining).await?;
                pos += remaining;
                self.state.borrow_mut().write_pos = pos;
            }
            let file = self.write_at_retry(pos, record).await?;
            touched.insert(pos & !(file_size - 1), file);
            positions.push(pos);
            self.state.borrow_mut().write_pos = pos + record_len;
        }
        for (_, file) in touched {
            self.sync_file(file).await?;
        }
        Ok(positions)
    }

    async fn write_padding(&self, pos: u64, remaining: u64) -> RaftResult<()> {
        let mut buf = vec![0u8; remaining.min(RECORD_BRIEF_LEN as u64) as usize];
        if remaining >= RECORD_BRIEF_LEN as u64 {
            buf[0..4].copy_from_slice(&PADDING_MAGIC.to_le_bytes());
            buf[4..8].copy_from_slice(&(remaining as u32).to_le_bytes());
        }
        self.write_at_retry(pos, buf).await?;
        Ok(())
    }

    async fn read_exact_retry(&self, pos: u64, len: usize) -> RaftResult<Vec<u8>> {
        let (file, offset) = self.queue.file_at(pos)?;
        retry_io(&self.group, "log read", &self.schedule, || {
            let file = file.clone();
            async move {
                io_call(move || {
                    let mut buf = vec![0u8; len];
                    file.read_exact_at(&mut buf, offset)?;
                    Ok(buf)
                })
                .await
            }
        })
        .await
    }

    /// Read the brief of the record at `pos`, or `None` when the bytes
    /// there were never written.
    pub async fn read_brief(&self, pos: u64) -> RaftResult<Option<RecordBrief>> {
        if pos >= self.queue.end_position() {
            return Ok(None);
        }
        let raw = self.read_exact_retry(pos, RECORD_HEADER_LEN).await?;
        let hdr = parse_record_header(&raw);
        if hdr.magic != DATA_MAGIC {
            return Ok(None);
        }
        Ok(Some(RecordBrief {
            index: hdr.index,
            term: hdr.term,
            timestamp: hdr.timestamp,
        }))
    }

    /// Read and verify the full record at `pos`.
    pub async fn read_item(&self, pos: u64) -> RaftResult<LogItem> {
        let head = self.read_exact_retry(pos, RECORD_HEADER_LEN).await?;
        let hdr = parse_record_header(&head);
        if hdr.magic != DATA_MAGIC {
            return Err(RaftError::ChecksumFailure { pos });
        }
        let total = hdr.total_len as usize;
        if total < RECORD_HEADER_LEN + CRC_LEN || total as u64 > self.remaining_in_file(pos) {
            return Err(RaftError::ChecksumFailure { pos });
        }
        let raw = self.read_exact_retry(pos, total).await?;
        if !record_crc_ok(&raw) {
            return Err(RaftError::ChecksumFailure { pos });
        }
        record_to_item(&hdr, &raw).map_err(|_| RaftError::ChecksumFailure { pos })
    }

    /// Term of the record at `pos` without reading its payload.
    pub async fn term_at(&self, pos: u64) -> RaftResult<Term> {
        match self.read_brief(pos).await? {
            Some(brief) => Ok(brief.term),
            None => Err(RaftError::ChecksumFailure { pos }),
        }
    }

    /// Scan forward from `start_pos`, validating CRCs, index continuity
    /// and term chaining, stopping at the first broken or unwritten
    /// record. Truncates the tail to the stop position.
    pub async fn restore_scan(
        &self,
        start_pos: u64,
        expect_index: Option<u64>,
    ) -> RaftResult<ScanOutcome> {
        let file_size = self.file_size();
        let mut pos = start_pos;
        let mut expected = expect_index;
        let mut prev_term: Option<Term> = None;
        let mut entries = Vec::new();
        let mut last_index = 0u64;
        let mut last_term = 0;

        loop {
            if pos >= self.queue.end_position() {
                break;
            }
            let remaining = file_size - (pos & (file_size - 1));
            if remaining < RECORD_BRIEF_LEN as u64 {
                pos += remaining;
                continue;
            }
            let brief_raw = self.read_exact_retry(pos, RECORD_BRIEF_LEN).await?;
            let magic = le_u32(&brief_raw, 0);
            let total_len = le_u32(&brief_raw, 4) as u64;
            if magic == PADDING_MAGIC {
                if total_len != remaining {
                    tracing::warn!(pos, total_len, remaining, "bad padding record, stopping restore");
                    break;
                }
                pos += remaining;
                continue;
            }
            if magic != DATA_MAGIC {
                break;
            }
            if total_len < (RECORD_HEADER_LEN + CRC_LEN) as u64 || total_len > remaining {
                tracing::warn!(pos, total_len, "record length out of bounds, stopping restore");
                break;
            }
            let raw = self.read_exact_retry(pos, total_len as usize).await?;
            if !record_crc_ok(&raw) {
                tracing::warn!(pos, "record crc mismatch, truncating here");
                break;
            }
            let hdr = parse_record_header(&raw);
            if hdr.header_len as usize + hdr.body_len as usize + RECORD_HEADER_LEN + CRC_LEN
                != total_len as usize
            {
                tracing::warn!(pos, "record length fields inconsistent, stopping restore");
                break;
            }
            if let Some(exp) = expected {
                if hdr.index != exp {
                    tracing::warn!(pos, index = hdr.index, expected = exp, "index discontinuity, stopping restore");
                    break;
                }
            }
            if let Some(prev) = prev_term {
                if hdr.prev_log_term != prev {
                    tracing::warn!(pos, "prev term chain broken, stopping restore");
                    break;
                }
            }
            entries.push((hdr.index, pos));
            last_index = hdr.index;
            last_term = hdr.term;
            prev_term = Some(hdr.term);
            expected = Some(hdr.index + 1);
            pos += total_len;
        }

        self.truncate_to(pos).await?;
        if let Some((first, _)) = entries.first() {
            if start_pos == self.queue.start_position() {
                self.state.borrow_mut().first_index = *first;
            }
        }
        Ok(ScanOutcome {
            last_index,
            last_term,
            entries,
            end_pos: pos,
        })
    }

    /// Move the tail back to `pos` and stamp a stop marker there, so a
    /// later restore never walks into stale bytes.
    pub async fn truncate_to(&self, pos: u64) -> RaftResult<()> {
        self.state.borrow_mut().write_pos = pos;
        if pos < self.queue.end_position() && self.remaining_in_file(pos) >= RECORD_BRIEF_LEN as u64 {
            let file = self.write_at_retry(pos, vec![0u8; RECORD_BRIEF_LEN]).await?;
            self.sync_file(file).await?;
        }
        Ok(())
    }

    /// Start position of the second segment, if there is one.
    pub fn second_segment_start(&self) -> Option<u64> {
        if self.queue.file_count() < 2 {
            return None;
        }
        self.queue.head_range().map(|(_, end)| end)
    }

    pub fn can_delete(&self) -> bool {
        self.queue.can_delete()
    }

    /// Delete the head segment; the caller has already decided it is
    /// reclaimable and told us the first index of the next one.
    pub async fn delete_head(&self, next_first_index: u64) -> RaftResult<()> {
        self.queue.delete_first().await?;
        self.state.borrow_mut().first_index = next_first_index;
        Ok(())
    }

    /// Drop everything and restart the byte stream; the log then begins
    /// at `first_index`.
    pub async fn reset_to(&self, first_index: u64) -> RaftResult<()> {
        self.queue.reset(0).await?;
        let mut state = self.state.borrow_mut();
        state.write_pos = 0;
        state.first_index = first_index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::run_in_group;
    use crate::types::ItemType;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn item(index: u64, term: Term, prev: Term, body: &str) -> LogItem {
        LogItem {
            index,
            term,
            prev_log_term: prev,
            timestamp: 1000 + index,
            item_type: ItemType::Normal,
            biz_type: 0,
            header: Bytes::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    fn schedule() -> RetrySchedule {
        RetrySchedule::new(vec![Duration::from_millis(1)])
    }

    #[test]
    fn record_round_trip() {
        let it = item(5, 2, 1, "hello");
        let raw = encode_record(&it);
        assert!(record_crc_ok(&raw));
        let hdr = parse_record_header(&raw);
        assert_eq!(hdr.magic, DATA_MAGIC);
        assert_eq!(hdr.total_len as usize, raw.len());
        let back = record_to_item(&hdr, &raw).unwrap();
        assert_eq!(back, it);
    }

    #[test]
    fn crc_detects_any_single_byte_corruption() {
        let raw = encode_record(&item(1, 1, 0, "payload"));
        for i in 0..raw.len() {
            let mut bad = raw.clone();
            bad[i] ^= 0x01;
            assert!(!record_crc_ok(&bad), "corruption at byte {} went undetected", i);
        }
    }

    #[tokio::test]
    async fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        run_in_group("lfq-append", move |group| async move {
            let logs = LogFileQueue::init(group, schedule(), path, 16).await.unwrap();
            let items = vec![item(1, 1, 0, "a"), item(2, 1, 1, "b"), item(3, 1, 1, "c")];
            let positions = logs.append(&items).await.unwrap();
            assert_eq!(positions.len(), 3);
            for (it, pos) in items.iter().zip(&positions) {
                let got = logs.read_item(*pos).await.unwrap();
                assert_eq!(&got, it);
            }
        })
        .await;
    }

    #[tokio::test]
    async fn records_never_straddle_a_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        run_in_group("lfq-padding", move |group| async move {
            // 4 KiB segments; ~1 KiB records force padding before long.
            let logs = LogFileQueue::init(group, schedule(), path, 12).await.unwrap();
            let big = "x".repeat(1000);
            let mut prev = 0;
            let mut items = Vec::new();
            for i in 1..=10u64 {
                items.push(item(i, 1, prev, &big));
                prev = 1;
            }
            let positions = logs.append(&items).await.unwrap();
            let size = logs.file_size();
            for (it, pos) in items.iter().zip(&positions) {
                let offset = pos & (size - 1);
                let len = encode_record(it).len() as u64;
                assert!(offset + len <= size, "record {} straddles a segment", it.index);
                assert_eq!(logs.read_item(*pos).await.unwrap().index, it.index);
            }
        })
        .await;
    }

    #[tokio::test]
    async fn restore_scan_is_a_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let p2 = path.clone();
        run_in_group("lfq-restore", move |group| async move {
            let logs = LogFileQueue::init(group.clone(), schedule(), p2.clone(), 14)
                .await
                .unwrap();
            let items: Vec<_> = (1..=20u64)
                .map(|i| item(i, 1, if i == 1 { 0 } else { 1 }, "data"))
                .collect();
            logs.append(&items).await.unwrap();
            drop(logs);

            let logs = LogFileQueue::init(group, schedule(), p2, 14).await.unwrap();
            let outcome = logs.restore_scan(0, None).await.unwrap();
            assert_eq!(outcome.last_index, 20);
            assert_eq!(outcome.last_term, 1);
            assert_eq!(outcome.entries.len(), 20);
        })
        .await;
    }

    #[tokio::test]
    async fn restore_stops_at_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let p2 = path.clone();
        let positions = run_in_group("lfq-corrupt", move |group| async move {
            let logs = LogFileQueue::init(group, schedule(), p2, 14).await.unwrap();
            let items: Vec<_> = (1..=5u64)
                .map(|i| item(i, 1, if i == 1 { 0 } else { 1 }, "data"))
                .collect();
            logs.append(&items).await.unwrap()
        })
        .await;

        // Flip one byte inside the fourth record.
        use std::os::unix::fs::FileExt;
        let seg = path.join("00000000000000000000");
        let f = std::fs::OpenOptions::new().read(true).write(true).open(&seg).unwrap();
        let mut b = [0u8; 1];
        f.read_exact_at(&mut b, positions[3] + 50).unwrap();
        b[0] ^= 0xff;
        f.write_at(&b, positions[3] + 50).unwrap();
        drop(f);

        run_in_group("lfq-corrupt2", move |group| async move {
            let logs = LogFileQueue::init(group, schedule(), path, 14).await.unwrap();
            let outcome = logs.restore_scan(0, None).await.unwrap();
            assert_eq!(outcome.last_index, 3, "scan must stop before the corrupt record");
            assert_eq!(outcome.end_pos, positions[3]);
        })
        .await;
    }
}

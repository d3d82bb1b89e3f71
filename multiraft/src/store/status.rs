//! The persistent status record: term, vote and materialized commit index.
//!
//! The file holds two fixed slots written alternately, each carrying a
//! generation counter and a CRC. A torn write can only damage the slot
//! being written; the previous good record always survives, which makes
//! every update transactional without a rename.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::RaftResult;
use crate::fiber::io_call;
use crate::fiber::retry::retry_io;
use crate::fiber::FiberGroup;
use crate::fiber::RetrySchedule;
use crate::types::NodeId;
use crate::types::Term;

const STATUS_MAGIC: u32 = 0x5EC0_57A7;
const SLOT_LEN: u64 = 64;

/// The durable part of a group's state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    /// Materialized at shutdown and snapshot so restart does not rescan
    /// the whole log.
    pub commit_index: u64,
}

fn encode_slot(record: &StatusRecord, generation: u64) -> [u8; SLOT_LEN as usize] {
    let mut buf = [0u8; SLOT_LEN as usize];
    buf[0..4].copy_from_slice(&STATUS_MAGIC.to_le_bytes());
    buf[4..12].copy_from_slice(&generation.to_le_bytes());
    buf[12..16].copy_from_slice(&record.current_term.to_le_bytes());
    buf[16..20].copy_from_slice(&record.voted_for.unwrap_or(0).to_le_bytes());
    buf[20..28].copy_from_slice(&record.commit_index.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..28]);
    buf[28..32].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_slot(buf: &[u8]) -> Option<(StatusRecord, u64)> {
    let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    if magic != STATUS_MAGIC {
        return None;
    }
    let crc = u32::from_le_bytes(buf[28..32].try_into().ok()?);
    if crc32fast::hash(&buf[0..28]) != crc {
        return None;
    }
    let generation = u64::from_le_bytes(buf[4..12].try_into().ok()?);
    let voted_for = u32::from_le_bytes(buf[16..20].try_into().ok()?);
    Some((
        StatusRecord {
            current_term: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            voted_for: if voted_for == 0 { None } else { Some(voted_for) },
            commit_index: u64::from_le_bytes(buf[20..28].try_into().ok()?),
        },
        generation,
    ))
}

/// The always-fsynced status file of one group.
pub struct StatusFile {
    path: PathBuf,
    file: Arc<File>,
    generation: u64,
}

impl StatusFile {
    /// Open (or create) the status file and return the newest valid
    /// record found in it.
    pub async fn open(
        group: &FiberGroup,
        schedule: &RetrySchedule,
        path: impl AsRef<Path>,
    ) -> RaftResult<(Self, StatusRecord)> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let (file, record, generation) = retry_io(group, "open status file", schedule, || {
            let p = open_path.clone();
            async move {
                io_call(move || {
                    if let Some(parent) = p.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let file = OpenOptions::new().read(true).write(true).create(true).open(&p)?;
                    let mut buf = [0u8; (SLOT_LEN * 2) as usize];
                    let len = file.metadata()?.len();
                    if len >= SLOT_LEN * 2 {
                        file.read_exact_at(&mut buf, 0)?;
                    } else if len > 0 {
                        // A short file can only come from a torn first
                        // write; read whatever is there.
                        let mut short = vec![0u8; len as usize];
                        file.read_exact_at(&mut short, 0)?;
                        buf[..short.len()].copy_from_slice(&short);
                    }
                    let a = decode_slot(&buf[..SLOT_LEN as usize]);
                    let b = decode_slot(&buf[SLOT_LEN as usize..]);
                    let best = match (a, b) {
                        (Some(x), Some(y)) => Some(if x.1 >= y.1 { x } else { y }),
                        (Some(x), None) => Some(x),
                        (None, Some(y)) => Some(y),
                        (None, None) => None,
                    };
                    let (record, generation) = best.unwrap_or_default();
                    Ok((file, record, generation))
                })
                .await
            }
        })
        .await?;
        tracing::debug!(path = %path.display(), ?record, generation, "status file opened");
        Ok((
            Self {
                path,
                file: Arc::new(file),
                generation,
            },
            record,
        ))
    }

    /// Persist a new record: write the alternate slot, then fsync.
    pub async fn persist(
        &mut self,
        group: &FiberGroup,
        schedule: &RetrySchedule,
        record: StatusRecord,
    ) -> RaftResult<()> {
        let generation = self.generation + 1;
        let slot = encode_slot(&record, generation);
        let offset = (generation % 2) * SLOT_LEN;
        let file = self.file.clone();
        retry_io(group, "persist status", schedule, || {
            let file = file.clone();
            async move {
                io_call(move || {
                    file.write_at(&slot, offset)?;
                    file.sync_data()
                })
                .await
            }
        })
        .await?;
        self.generation = generation;
        tracing::trace!(path = %self.path.display(), ?record, generation, "status persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::run_in_group;
    use std::time::Duration;

    fn schedule() -> RetrySchedule {
        RetrySchedule::new(vec![Duration::from_millis(1)])
    }

    #[test]
    fn slot_round_trip() {
        let record = StatusRecord {
            current_term: 7,
            voted_for: Some(3),
            commit_index: 1234,
        };
        let raw = encode_slot(&record, 42);
        let (back, generation) = decode_slot(&raw).unwrap();
        assert_eq!(back, record);
        assert_eq!(generation, 42);
    }

    #[test]
    fn corrupt_slot_is_rejected() {
        let mut raw = encode_slot(&StatusRecord::default(), 1);
        raw[13] ^= 0x40;
        assert!(decode_slot(&raw).is_none());
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        run_in_group("status-reopen", move |group| async move {
            let (mut status, record) = StatusFile::open(&group, &schedule(), &path).await.unwrap();
            assert_eq!(record, StatusRecord::default());
            for term in 1..=5u32 {
                status
                    .persist(
                        &group,
                        &schedule(),
                        StatusRecord {
                            current_term: term,
                            voted_for: Some(1),
                            commit_index: u64::from(term) * 10,
                        },
                    )
                    .await
                    .unwrap();
            }
            drop(status);

            let (_status, record) = StatusFile::open(&group, &schedule(), &path).await.unwrap();
            assert_eq!(record.current_term, 5);
            assert_eq!(record.voted_for, Some(1));
            assert_eq!(record.commit_index, 50);
        })
        .await;
    }

    #[tokio::test]
    async fn a_torn_slot_falls_back_to_the_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let p2 = path.clone();
        run_in_group("status-torn", move |group| async move {
            let (mut status, _) = StatusFile::open(&group, &schedule(), &p2).await.unwrap();
            status
                .persist(&group, &schedule(), StatusRecord { current_term: 1, voted_for: None, commit_index: 10 })
                .await
                .unwrap();
            status
                .persist(&group, &schedule(), StatusRecord { current_term: 2, voted_for: Some(2), commit_index: 20 })
                .await
                .unwrap();
        })
        .await;

        // Tear the most recently written slot (generation 2 lives in slot 0).
        let f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.write_at(&[0xde, 0xad], 6).unwrap();
        drop(f);

        run_in_group("status-torn2", move |group| async move {
            let (_s, record) = StatusFile::open(&group, &schedule(), &path).await.unwrap();
            assert_eq!(record.current_term, 1);
            assert_eq!(record.commit_index, 10);
        })
        .await;
    }
}

//! Core identifier and log entry types shared across the engine.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

/// The unique identifier of a node within the cluster. Node ids start at 1;
/// 0 is reserved as the "none" encoding in persistent records.
pub type NodeId = u32;

/// The identifier of one consensus group hosted by the process.
pub type GroupId = u32;

/// A Raft term. Monotonic non-decreasing through the life of a node.
pub type Term = u32;

/// The id of a log entry: its term and its position in the log.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: u64,
}

impl LogId {
    pub fn new(term: Term, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.term, self.index)
    }
}

/// The kind of a replicated log entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemType {
    /// An application entry carrying a client payload.
    Normal = 0,
    /// The empty entry a new leader appends at the start of its term.
    TermStart = 1,
}

impl ItemType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ItemType::Normal),
            1 => Some(ItemType::TermStart),
            _ => None,
        }
    }
}

/// One replicated log entry.
///
/// Indexes start at 1 and are strictly contiguous within a group.
/// `prev_log_term` chains each entry to its predecessor so that the
/// recovery scan can validate continuity without the index files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogItem {
    pub index: u64,
    pub term: Term,
    pub prev_log_term: Term,
    /// Milliseconds since the unix epoch, taken at append time on the leader.
    pub timestamp: u64,
    pub item_type: ItemType,
    /// An application-defined discriminator carried opaquely by the engine.
    pub biz_type: u32,
    pub header: Bytes,
    pub body: Bytes,
}

impl LogItem {
    /// The term-start entry appended by a new leader.
    pub fn term_start(index: u64, term: Term, prev_log_term: Term, timestamp: u64) -> Self {
        Self {
            index,
            term,
            prev_log_term,
            timestamp,
            item_type: ItemType::TermStart,
            biz_type: 0,
            header: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn log_id(&self) -> LogId {
        LogId::new(self.term, self.index)
    }

    /// The payload size accounted against the pending-bytes gate.
    pub fn payload_len(&self) -> u64 {
        (self.header.len() + self.body.len()) as u64
    }
}

impl fmt::Display for LogItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:?} biz={} hdr={}B body={}B",
            self.log_id(),
            self.item_type,
            self.biz_type,
            self.header.len(),
            self.body.len()
        )
    }
}

/// All possible roles of a group member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Replicates entries but never votes and is not counted in quorums.
    Observer,
    /// Replicates entries from the leader and votes in elections.
    Follower,
    /// Campaigning to become the group leader.
    Candidate,
    /// The group leader.
    Leader,
    /// The group is shutting down.
    Shutdown,
}

impl Role {
    pub fn is_observer(&self) -> bool {
        matches!(self, Self::Observer)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// A short human-readable rendering of a message, used in trace events.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_type_round_trip() {
        assert_eq!(ItemType::from_u8(0), Some(ItemType::Normal));
        assert_eq!(ItemType::from_u8(1), Some(ItemType::TermStart));
        assert_eq!(ItemType::from_u8(7), None);
    }

    #[test]
    fn log_id_ordering_is_term_major() {
        assert!(LogId::new(2, 1) > LogId::new(1, 100));
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
    }
}

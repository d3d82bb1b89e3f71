//! Wire codec for RPC bodies.
//!
//! Bodies are compact varint-tagged records: every field is written as
//! `tag = (field_number << 3) | wire_type` followed by the value. Wire
//! types are varint (0), fixed64 (1), length-delimited (2) and fixed32
//! (5). Unknown fields are skipped, so responders can be upgraded ahead
//! of callers.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::PingRequest;
use crate::raft::PingResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::types::ItemType;
use crate::types::LogItem;

pub(crate) const WIRE_VARINT: u8 = 0;
pub(crate) const WIRE_FIXED64: u8 = 1;
pub(crate) const WIRE_LEN: u8 = 2;
pub(crate) const WIRE_FIXED32: u8 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("record truncated")]
    Truncated,
    #[error("varint longer than 10 bytes")]
    InvalidVarint,
    #[error("unknown wire type {0}")]
    UnknownWireType(u8),
    #[error("invalid value for field: {0}")]
    InvalidValue(&'static str),
}

/// A message with a tagged wire form.
pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError>;

    fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn decode_from(mut body: Bytes) -> Result<Self, CodecError> {
        Self::decode(&mut body)
    }
}

pub(crate) fn put_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub(crate) fn get_varint(buf: &mut Bytes) -> Result<u64, CodecError> {
    let mut v: u64 = 0;
    for shift in 0..10 {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated);
        }
        let byte = buf.get_u8();
        v |= u64::from(byte & 0x7f) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(v);
        }
    }
    Err(CodecError::InvalidVarint)
}

fn put_tag(buf: &mut BytesMut, field: u32, wire: u8) {
    put_varint(buf, (u64::from(field) << 3) | u64::from(wire));
}

fn put_uint(buf: &mut BytesMut, field: u32, v: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, v);
}

fn put_bool(buf: &mut BytesMut, field: u32, v: bool) {
    put_uint(buf, field, u64::from(v));
}

fn put_bytes(buf: &mut BytesMut, field: u32, v: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, v.len() as u64);
    buf.put_slice(v);
}

fn get_len_delimited(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(buf.split_to(len))
}

fn skip_field(buf: &mut Bytes, wire: u8) -> Result<(), CodecError> {
    match wire {
        WIRE_VARINT => {
            get_varint(buf)?;
        }
        WIRE_FIXED64 => {
            if buf.remaining() < 8 {
                return Err(CodecError::Truncated);
            }
            buf.advance(8);
        }
        WIRE_LEN => {
            get_len_delimited(buf)?;
        }
        WIRE_FIXED32 => {
            if buf.remaining() < 4 {
                return Err(CodecError::Truncated);
            }
            buf.advance(4);
        }
        other => return Err(CodecError::UnknownWireType(other)),
    }
    Ok(())
}

/// Drive a field-by-field decode loop over `buf`, calling `on_field` for
/// every tag. The callback returns `false` to have the field skipped.
fn decode_fields<F>(buf: &mut Bytes, mut on_field: F) -> Result<(), CodecError>
where
    F: FnMut(u32, u8, &mut Bytes) -> Result<bool, CodecError>,
{
    while buf.has_remaining() {
        let tag = get_varint(buf)?;
        let field = (tag >> 3) as u32;
        let wire = (tag & 0x7) as u8;
        if !on_field(field, wire, buf)? {
            skip_field(buf, wire)?;
        }
    }
    Ok(())
}

impl Wire for LogItem {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, self.index);
        put_uint(buf, 2, u64::from(self.term));
        put_uint(buf, 3, u64::from(self.prev_log_term));
        put_uint(buf, 4, self.timestamp);
        put_uint(buf, 5, u64::from(self.item_type as u8));
        put_uint(buf, 6, u64::from(self.biz_type));
        put_bytes(buf, 7, &self.header);
        put_bytes(buf, 8, &self.body);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut item = LogItem {
            index: 0,
            term: 0,
            prev_log_term: 0,
            timestamp: 0,
            item_type: ItemType::Normal,
            biz_type: 0,
            header: Bytes::new(),
            body: Bytes::new(),
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => item.index = get_varint(buf)?,
                2 => item.term = get_varint(buf)? as u32,
                3 => item.prev_log_term = get_varint(buf)? as u32,
                4 => item.timestamp = get_varint(buf)?,
                5 => {
                    let raw = get_varint(buf)? as u8;
                    item.item_type =
                        ItemType::from_u8(raw).ok_or(CodecError::InvalidValue("item_type"))?;
                }
                6 => item.biz_type = get_varint(buf)? as u32,
                7 => item.header = get_len_delimited(buf)?,
                8 => item.body = get_len_delimited(buf)?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(item)
    }
}

impl Wire for PingRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.group_id));
        put_uint(buf, 2, u64::from(self.node_id));
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = PingRequest {
            group_id: 0,
            node_id: 0,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.group_id = get_varint(buf)? as u32,
                2 => msg.node_id = get_varint(buf)? as u32,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for PingResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.node_id));
        put_bool(buf, 2, self.group_ready);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = PingResponse {
            node_id: 0,
            group_ready: false,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.node_id = get_varint(buf)? as u32,
                2 => msg.group_ready = get_varint(buf)? != 0,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for VoteRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.group_id));
        put_uint(buf, 2, u64::from(self.term));
        put_uint(buf, 3, u64::from(self.candidate_id));
        put_uint(buf, 4, self.last_log_index);
        put_uint(buf, 5, u64::from(self.last_log_term));
        put_bool(buf, 6, self.pre_vote);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = VoteRequest {
            group_id: 0,
            term: 0,
            candidate_id: 0,
            last_log_index: 0,
            last_log_term: 0,
            pre_vote: false,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.group_id = get_varint(buf)? as u32,
                2 => msg.term = get_varint(buf)? as u32,
                3 => msg.candidate_id = get_varint(buf)? as u32,
                4 => msg.last_log_index = get_varint(buf)?,
                5 => msg.last_log_term = get_varint(buf)? as u32,
                6 => msg.pre_vote = get_varint(buf)? != 0,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for VoteResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.term));
        put_bool(buf, 2, self.vote_granted);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = VoteResponse {
            term: 0,
            vote_granted: false,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.term = get_varint(buf)? as u32,
                2 => msg.vote_granted = get_varint(buf)? != 0,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for AppendEntriesRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.group_id));
        put_uint(buf, 2, u64::from(self.term));
        put_uint(buf, 3, u64::from(self.leader_id));
        put_uint(buf, 4, self.prev_log_index);
        put_uint(buf, 5, u64::from(self.prev_log_term));
        put_uint(buf, 6, self.leader_commit);
        for entry in &self.entries {
            let mut sub = BytesMut::new();
            entry.encode(&mut sub);
            put_bytes(buf, 7, &sub);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = AppendEntriesRequest {
            group_id: 0,
            term: 0,
            leader_id: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: Vec::new(),
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.group_id = get_varint(buf)? as u32,
                2 => msg.term = get_varint(buf)? as u32,
                3 => msg.leader_id = get_varint(buf)? as u32,
                4 => msg.prev_log_index = get_varint(buf)?,
                5 => msg.prev_log_term = get_varint(buf)? as u32,
                6 => msg.leader_commit = get_varint(buf)?,
                7 => {
                    let mut sub = get_len_delimited(buf)?;
                    msg.entries.push(LogItem::decode(&mut sub)?);
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for AppendEntriesResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.term));
        put_bool(buf, 2, self.success);
        put_uint(buf, 3, self.suggested_next_index);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = AppendEntriesResponse {
            term: 0,
            success: false,
            suggested_next_index: 0,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.term = get_varint(buf)? as u32,
                2 => msg.success = get_varint(buf)? != 0,
                3 => msg.suggested_next_index = get_varint(buf)?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for InstallSnapshotRequest {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.group_id));
        put_uint(buf, 2, u64::from(self.term));
        put_uint(buf, 3, u64::from(self.leader_id));
        put_uint(buf, 4, self.last_included_index);
        put_uint(buf, 5, u64::from(self.last_included_term));
        put_uint(buf, 6, self.offset);
        put_bytes(buf, 7, &self.data);
        put_bool(buf, 8, self.done);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = InstallSnapshotRequest {
            group_id: 0,
            term: 0,
            leader_id: 0,
            last_included_index: 0,
            last_included_term: 0,
            offset: 0,
            data: Bytes::new(),
            done: false,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.group_id = get_varint(buf)? as u32,
                2 => msg.term = get_varint(buf)? as u32,
                3 => msg.leader_id = get_varint(buf)? as u32,
                4 => msg.last_included_index = get_varint(buf)?,
                5 => msg.last_included_term = get_varint(buf)? as u32,
                6 => msg.offset = get_varint(buf)?,
                7 => msg.data = get_len_delimited(buf)?,
                8 => msg.done = get_varint(buf)? != 0,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

impl Wire for InstallSnapshotResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_uint(buf, 1, u64::from(self.term));
        put_bool(buf, 2, self.success);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut msg = InstallSnapshotResponse {
            term: 0,
            success: false,
        };
        decode_fields(buf, |field, _wire, buf| {
            match field {
                1 => msg.term = get_varint(buf)? as u32,
                2 => msg.success = get_varint(buf)? != 0,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_item(index: u64) -> LogItem {
        LogItem {
            index,
            term: 3,
            prev_log_term: 2,
            timestamp: 1_700_000_000_123,
            item_type: ItemType::Normal,
            biz_type: 9,
            header: Bytes::from_static(b"hdr"),
            body: Bytes::from_static(b"some payload"),
        }
    }

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, v);
            let mut b = buf.freeze();
            assert_eq!(get_varint(&mut b).unwrap(), v);
            assert!(!b.has_remaining());
        }
    }

    #[test]
    fn truncated_varint_is_rejected() {
        let mut b = Bytes::from_static(&[0x80, 0x80]);
        assert_eq!(get_varint(&mut b), Err(CodecError::Truncated));
    }

    #[test]
    fn log_item_round_trip() {
        let item = sample_item(42);
        let decoded = LogItem::decode_from(item.encode_to_bytes()).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn vote_request_round_trip() {
        let req = VoteRequest {
            group_id: 7,
            term: 5,
            candidate_id: 2,
            last_log_index: 99,
            last_log_term: 4,
            pre_vote: true,
        };
        let got = VoteRequest::decode_from(req.encode_to_bytes()).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn append_entries_round_trip() {
        let req = AppendEntriesRequest {
            group_id: 1,
            term: 8,
            leader_id: 3,
            prev_log_index: 11,
            prev_log_term: 7,
            leader_commit: 10,
            entries: vec![sample_item(12), sample_item(13)],
        };
        let got = AppendEntriesRequest::decode_from(req.encode_to_bytes()).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn install_snapshot_round_trip() {
        let req = InstallSnapshotRequest {
            group_id: 1,
            term: 8,
            leader_id: 3,
            last_included_index: 100,
            last_included_term: 7,
            offset: 4096,
            data: Bytes::from_static(b"chunk"),
            done: true,
        };
        let got = InstallSnapshotRequest::decode_from(req.encode_to_bytes()).unwrap();
        assert_eq!(got, req);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let resp = VoteResponse {
            term: 4,
            vote_granted: true,
        };
        let mut buf = BytesMut::new();
        resp.encode(&mut buf);
        // A future field 9 (varint) appended by a newer peer.
        put_uint(&mut buf, 9, 77);
        let got = VoteResponse::decode_from(buf.freeze()).unwrap();
        assert_eq!(got, resp);
    }
}

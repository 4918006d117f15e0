//! pgoutput logical decoding messages and the replication protocol's
//! control frames (keepalive, XLogData, standby status update).
//!
//! This is a direct byte-for-byte decoder/encoder for the wire format
//! documented at
//! <https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html>
//! and <https://www.postgresql.org/docs/current/protocol-replication.html>.

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{OutboxError, OutboxResult};
use crate::wire::{buf_recv_i32, buf_recv_i8, buf_recv_u32, buf_recv_u64, Oid, Xid};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub key_flag: i8,
    pub column_name: String,
    pub column_type: Oid,
    pub atttypmod: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub relation_name: String,
    pub replica_identity: char,
    pub column_count: i16,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnData {
    pub data_type: char,
    pub length: i32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TupleData {
    pub column_count: i16,
    pub columns: Vec<ColumnData>,
    pub processed_length: usize,
}

impl TupleData {
    /// Look up a column's text value by name, matching against the relation's
    /// column order.
    pub fn text(&self, relation: &RelationInfo, name: &str) -> Option<&str> {
        relation
            .columns
            .iter()
            .position(|c| c.column_name == name)
            .and_then(|idx| self.columns.get(idx))
            .filter(|c| c.data_type == 't')
            .map(|c| c.data.as_str())
    }
}

/// A decoded pgoutput logical replication message.
#[derive(Debug, Clone, Serialize)]
pub enum ReplicationMessage {
    Begin {
        final_lsn: u64,
        timestamp: i64,
        xid: Xid,
    },
    Commit {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: i64,
    },
    Relation {
        relation: RelationInfo,
    },
    Insert {
        relation_id: Oid,
        tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Update {
        relation_id: Oid,
        key_type: Option<char>,
        old_tuple_data: Option<TupleData>,
        new_tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Delete {
        relation_id: Oid,
        key_type: char,
        tuple_data: TupleData,
        is_stream: bool,
        xid: Option<Xid>,
    },
    Truncate {
        relation_ids: Vec<Oid>,
        flags: i8,
        is_stream: bool,
        xid: Option<Xid>,
    },
    StreamStart {
        xid: Xid,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: Xid,
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: i64,
    },
    StreamAbort {
        xid: Xid,
        subtransaction_xid: Xid,
    },
}

impl ReplicationMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ReplicationMessage::Begin { .. } => "Begin",
            ReplicationMessage::Commit { .. } => "Commit",
            ReplicationMessage::Relation { .. } => "Relation",
            ReplicationMessage::Insert { .. } => "Insert",
            ReplicationMessage::Update { .. } => "Update",
            ReplicationMessage::Delete { .. } => "Delete",
            ReplicationMessage::Truncate { .. } => "Truncate",
            ReplicationMessage::StreamStart { .. } => "StreamStart",
            ReplicationMessage::StreamStop => "StreamStop",
            ReplicationMessage::StreamCommit { .. } => "StreamCommit",
            ReplicationMessage::StreamAbort { .. } => "StreamAbort",
        }
    }
}

/// Schema cache keyed by relation OID, populated as `Relation` messages
/// arrive on the stream.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<Oid, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, relation: RelationInfo) {
        self.relations.insert(relation.oid, relation);
    }

    pub fn get(&self, oid: Oid) -> Option<&RelationInfo> {
        self.relations.get(&oid)
    }
}

/// Parses pgoutput logical decoding messages from raw `XLogData` payloads.
pub struct MessageParser;

impl MessageParser {
    pub fn parse_wal_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.is_empty() {
            return Err(OutboxError::protocol("empty message buffer"));
        }

        let message_type = buffer[0] as char;
        debug!(message_type, "parsing pgoutput message");

        match message_type {
            'B' => Self::parse_begin_message(buffer),
            'C' => Self::parse_commit_message(buffer),
            'R' => Self::parse_relation_message(buffer),
            'I' => Self::parse_insert_message(buffer),
            'U' => Self::parse_update_message(buffer),
            'D' => Self::parse_delete_message(buffer),
            'T' => Self::parse_truncate_message(buffer),
            'S' => Self::parse_stream_start_message(buffer),
            'E' => Self::parse_stream_stop_message(buffer),
            'c' => Self::parse_stream_commit_message(buffer),
            'A' => Self::parse_stream_abort_message(buffer),
            other => {
                warn!(message_type = %other, "unknown pgoutput message type");
                Err(OutboxError::protocol(format!("unknown message type: {other}")))
            }
        }
    }

    fn parse_begin_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 21 {
            return Err(OutboxError::protocol("begin message too short"));
        }
        let mut offset = 1;
        let final_lsn = buf_recv_u64(&buffer[offset..]);
        offset += 8;
        let timestamp = buf_recv_u64(&buffer[offset..]) as i64;
        offset += 8;
        let xid = buf_recv_u32(&buffer[offset..]);

        Ok(ReplicationMessage::Begin {
            final_lsn,
            timestamp,
            xid,
        })
    }

    fn parse_commit_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 26 {
            return Err(OutboxError::protocol("commit message too short"));
        }
        let mut offset = 1;
        let flags = buffer[offset];
        offset += 1;
        let commit_lsn = buf_recv_u64(&buffer[offset..]);
        offset += 8;
        let end_lsn = buf_recv_u64(&buffer[offset..]);
        offset += 8;
        let timestamp = buf_recv_u64(&buffer[offset..]) as i64;

        Ok(ReplicationMessage::Commit {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn parse_relation_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 7 {
            return Err(OutboxError::protocol("relation message too short"));
        }
        let mut offset = 1;
        let oid = buf_recv_u32(&buffer[offset..]);
        offset += 4;

        let namespace_start = offset;
        while offset < buffer.len() && buffer[offset] != 0 {
            offset += 1;
        }
        if offset >= buffer.len() {
            return Err(OutboxError::protocol("invalid namespace in relation message"));
        }
        let namespace = String::from_utf8_lossy(&buffer[namespace_start..offset]).into_owned();
        offset += 1;

        let relation_name_start = offset;
        while offset < buffer.len() && buffer[offset] != 0 {
            offset += 1;
        }
        if offset >= buffer.len() {
            return Err(OutboxError::protocol("invalid relation name in relation message"));
        }
        let relation_name = String::from_utf8_lossy(&buffer[relation_name_start..offset]).into_owned();
        offset += 1;

        if offset >= buffer.len() {
            return Err(OutboxError::protocol("relation message truncated"));
        }
        let replica_identity = buffer[offset] as char;
        offset += 1;

        if offset + 2 > buffer.len() {
            return Err(OutboxError::protocol("relation message truncated"));
        }
        let column_count = crate::wire::buf_recv_i16(&buffer[offset..]);
        offset += 2;

        let mut columns = Vec::new();
        for _ in 0..column_count {
            if offset >= buffer.len() {
                return Err(OutboxError::protocol("column data truncated"));
            }
            let key_flag = buf_recv_i8(&buffer[offset..]);
            offset += 1;

            let column_name_start = offset;
            while offset < buffer.len() && buffer[offset] != 0 {
                offset += 1;
            }
            if offset >= buffer.len() {
                return Err(OutboxError::protocol("invalid column name"));
            }
            let column_name = String::from_utf8_lossy(&buffer[column_name_start..offset]).into_owned();
            offset += 1;

            if offset + 8 > buffer.len() {
                return Err(OutboxError::protocol("column data truncated"));
            }
            let column_type = buf_recv_u32(&buffer[offset..]);
            offset += 4;
            let atttypmod = buf_recv_i32(&buffer[offset..]);
            offset += 4;

            columns.push(ColumnInfo {
                key_flag,
                column_name,
                column_type,
                atttypmod,
            });
        }

        Ok(ReplicationMessage::Relation {
            relation: RelationInfo {
                oid,
                namespace,
                relation_name,
                replica_identity,
                column_count,
                columns,
            },
        })
    }

    fn parse_insert_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(OutboxError::protocol("insert message too short"));
        }
        let mut offset = 1;
        let transaction_id_or_oid = buf_recv_u32(&buffer[offset..]);
        offset += 4;

        let (relation_id, is_stream, xid) = if offset < buffer.len() && buffer[offset] == b'N' {
            (transaction_id_or_oid, false, None)
        } else {
            let relation_id = buf_recv_u32(&buffer[offset..]);
            offset += 4;
            (relation_id, true, Some(transaction_id_or_oid))
        };

        if offset >= buffer.len() || buffer[offset] != b'N' {
            return Err(OutboxError::protocol("expected 'N' marker in insert message"));
        }
        offset += 1;

        let tuple_data = Self::parse_tuple_data(&buffer[offset..])?;

        Ok(ReplicationMessage::Insert {
            relation_id,
            tuple_data,
            is_stream,
            xid,
        })
    }

    fn parse_update_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(OutboxError::protocol("update message too short"));
        }
        let mut offset = 1;
        let transaction_id_or_oid = buf_recv_u32(&buffer[offset..]);
        offset += 4;

        let (relation_id, is_stream, xid) = if offset < buffer.len()
            && (buffer[offset] == b'K' || buffer[offset] == b'O' || buffer[offset] == b'N')
        {
            (transaction_id_or_oid, false, None)
        } else {
            let relation_id = buf_recv_u32(&buffer[offset..]);
            offset += 4;
            (relation_id, true, Some(transaction_id_or_oid))
        };

        if offset >= buffer.len() {
            return Err(OutboxError::protocol("update message truncated"));
        }
        let marker = buffer[offset] as char;
        offset += 1;

        let (key_type, old_tuple_data) = match marker {
            'K' | 'O' => {
                let tuple_data = Self::parse_tuple_data(&buffer[offset..])?;
                offset += tuple_data.processed_length;

                if offset >= buffer.len() || buffer[offset] != b'N' {
                    return Err(OutboxError::protocol("expected 'N' marker after old tuple data"));
                }
                offset += 1;
                (Some(marker), Some(tuple_data))
            }
            'N' => (None, None),
            other => return Err(OutboxError::protocol(format!("invalid marker in update message: {other}"))),
        };

        let new_tuple_data = Self::parse_tuple_data(&buffer[offset..])?;

        Ok(ReplicationMessage::Update {
            relation_id,
            key_type,
            old_tuple_data,
            new_tuple_data,
            is_stream,
            xid,
        })
    }

    fn parse_delete_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(OutboxError::protocol("delete message too short"));
        }
        let mut offset = 1;
        let transaction_id_or_oid = buf_recv_u32(&buffer[offset..]);
        offset += 4;

        let (relation_id, is_stream, xid, key_type) = if offset < buffer.len()
            && (buffer[offset] == b'K' || buffer[offset] == b'O')
        {
            let key_type = buffer[offset] as char;
            offset += 1;
            (transaction_id_or_oid, false, None, key_type)
        } else {
            let relation_id = buf_recv_u32(&buffer[offset..]);
            offset += 4;
            if offset >= buffer.len() {
                return Err(OutboxError::protocol("delete message truncated"));
            }
            let key_type = buffer[offset] as char;
            offset += 1;
            (relation_id, true, Some(transaction_id_or_oid), key_type)
        };

        let tuple_data = Self::parse_tuple_data(&buffer[offset..])?;

        Ok(ReplicationMessage::Delete {
            relation_id,
            key_type,
            tuple_data,
            is_stream,
            xid,
        })
    }

    fn parse_truncate_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 10 {
            return Err(OutboxError::protocol("truncate message too short"));
        }
        let mut offset = 1;
        let xid_or_num_relations = buf_recv_u32(&buffer[offset..]);
        offset += 4;
        let possible_relation_num = buf_recv_u32(&buffer[offset..]);
        offset += 4;

        let remaining = buffer.len() - offset;
        let expected_size = 1 + (possible_relation_num as usize * 4);

        let (is_stream, xid, num_relations) = if remaining == expected_size {
            (true, Some(xid_or_num_relations), possible_relation_num)
        } else {
            offset -= 4;
            (false, None, xid_or_num_relations)
        };

        if offset >= buffer.len() {
            return Err(OutboxError::protocol("truncate message truncated"));
        }
        let flags = buf_recv_i8(&buffer[offset..]);
        offset += 1;

        let mut relation_ids = Vec::new();
        for _ in 0..num_relations {
            if offset + 4 > buffer.len() {
                return Err(OutboxError::protocol("truncate relation ids truncated"));
            }
            relation_ids.push(buf_recv_u32(&buffer[offset..]));
            offset += 4;
        }

        Ok(ReplicationMessage::Truncate {
            relation_ids,
            flags,
            is_stream,
            xid,
        })
    }

    fn parse_stream_start_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 6 {
            return Err(OutboxError::protocol("stream start message too short"));
        }
        let mut offset = 1;
        let xid = buf_recv_u32(&buffer[offset..]);
        offset += 4;
        let first_segment = offset < buffer.len() && buffer[offset] == 1;

        Ok(ReplicationMessage::StreamStart { xid, first_segment })
    }

    fn parse_stream_stop_message(_buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        Ok(ReplicationMessage::StreamStop)
    }

    fn parse_stream_commit_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 26 {
            return Err(OutboxError::protocol("stream commit message too short"));
        }
        let mut offset = 1;
        let xid = buf_recv_u32(&buffer[offset..]);
        offset += 4;
        let flags = buffer[offset];
        offset += 1;
        let commit_lsn = buf_recv_u64(&buffer[offset..]);
        offset += 8;
        let end_lsn = buf_recv_u64(&buffer[offset..]);
        offset += 8;
        let timestamp = buf_recv_u64(&buffer[offset..]) as i64;

        Ok(ReplicationMessage::StreamCommit {
            xid,
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn parse_stream_abort_message(buffer: &[u8]) -> OutboxResult<ReplicationMessage> {
        if buffer.len() < 9 {
            return Err(OutboxError::protocol("stream abort message too short"));
        }
        let mut offset = 1;
        let xid = buf_recv_u32(&buffer[offset..]);
        offset += 4;
        let subtransaction_xid = buf_recv_u32(&buffer[offset..]);

        Ok(ReplicationMessage::StreamAbort {
            xid,
            subtransaction_xid,
        })
    }

    fn parse_tuple_data(buffer: &[u8]) -> OutboxResult<TupleData> {
        if buffer.len() < 2 {
            return Err(OutboxError::protocol("tuple data too short"));
        }
        let mut offset = 0;
        let column_count = crate::wire::buf_recv_i16(&buffer[offset..]);
        offset += 2;

        let mut columns = Vec::new();
        for _ in 0..column_count {
            if offset >= buffer.len() {
                return Err(OutboxError::protocol("tuple data truncated"));
            }
            let data_type = buffer[offset] as char;
            offset += 1;

            let column_data = match data_type {
                'n' => ColumnData {
                    data_type: 'n',
                    length: 0,
                    data: String::new(),
                },
                'u' => ColumnData {
                    data_type: 'u',
                    length: 0,
                    data: String::new(),
                },
                't' => {
                    if offset + 4 > buffer.len() {
                        return Err(OutboxError::protocol("text data length truncated"));
                    }
                    let text_len = buf_recv_i32(&buffer[offset..]);
                    offset += 4;
                    if offset + text_len as usize > buffer.len() {
                        return Err(OutboxError::protocol("text data truncated"));
                    }
                    let text_data =
                        String::from_utf8_lossy(&buffer[offset..offset + text_len as usize]).into_owned();
                    offset += text_len as usize;
                    ColumnData {
                        data_type: 't',
                        length: text_len,
                        data: text_data,
                    }
                }
                other => {
                    return Err(OutboxError::protocol(format!("unknown tuple data type: {other}")));
                }
            };

            columns.push(column_data);
        }

        Ok(TupleData {
            column_count,
            columns,
            processed_length: offset,
        })
    }
}

/// `k` primary keepalive message (server → client).
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveMessage {
    pub wal_end: u64,
    pub timestamp: u64,
    pub reply_requested: bool,
}

impl KeepaliveMessage {
    pub fn parse(data: &[u8]) -> OutboxResult<Self> {
        if data.len() < 18 {
            return Err(OutboxError::protocol("keepalive message too short"));
        }
        let mut reader = BufferReader::new(data);
        reader.skip_message_type()?;
        let wal_end = reader.read_u64()?;
        let timestamp = reader.read_u64()?;
        let reply_requested = reader.read_u8()? != 0;

        Ok(Self {
            wal_end,
            timestamp,
            reply_requested,
        })
    }
}

/// `w` XLogData message (server → client): a chunk of WAL carrying a
/// pgoutput-encoded logical decoding message in `data`.
#[derive(Debug, Clone)]
pub struct XLogDataMessage {
    pub data_start: u64,
    pub wal_end: u64,
    pub send_time: u64,
    pub data: Vec<u8>,
}

impl XLogDataMessage {
    pub fn parse(data: &[u8]) -> OutboxResult<Self> {
        if data.len() < 25 {
            return Err(OutboxError::protocol("WAL message too short"));
        }
        let mut reader = BufferReader::new(data);
        reader.skip_message_type()?;
        let data_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_u64()?;
        let data = reader.read_bytes(reader.remaining())?;

        Ok(Self {
            data_start,
            wal_end,
            send_time,
            data,
        })
    }
}

/// `r` standby status update (client → server): tells the server how far
/// we've received/flushed/applied WAL. This is the message that actually
/// advances `confirmed_flush_lsn` for the replication slot.
#[derive(Debug, Clone, Copy)]
pub struct StandbyStatusUpdate {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub client_time: u64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Bit-exact 34-byte frame: 1 (type) + 8*4 (LSNs + timestamp) + 1 (reply flag).
    pub fn to_bytes(self) -> OutboxResult<[u8; 34]> {
        let mut buf = [0u8; 34];
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_char('r')?;
        writer.write_u64(self.write_lsn)?;
        writer.write_u64(self.flush_lsn)?;
        writer.write_u64(self.apply_lsn)?;
        writer.write_u64(self.client_time)?;
        writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
        debug_assert_eq!(writer.bytes_written(), 34);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_bytes() -> Vec<u8> {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(&200i64.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf
    }

    #[test]
    fn parses_begin_message() {
        let msg = MessageParser::parse_wal_message(&begin_bytes()).unwrap();
        match msg {
            ReplicationMessage::Begin { final_lsn, timestamp, xid } => {
                assert_eq!(final_lsn, 100);
                assert_eq!(timestamp, 200);
                assert_eq!(xid, 42);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        let err = MessageParser::parse_wal_message(&[b'?']).unwrap_err();
        assert!(matches!(err, OutboxError::Protocol { .. }));
    }

    #[test]
    fn parses_insert_message_with_text_column() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&7u32.to_be_bytes()); // relation oid
        buf.push(b'N');
        // tuple: 1 column, text "hi"
        buf.extend_from_slice(&1i16.to_be_bytes());
        buf.push(b't');
        buf.extend_from_slice(&2i32.to_be_bytes());
        buf.extend_from_slice(b"hi");

        let msg = MessageParser::parse_wal_message(&buf).unwrap();
        match msg {
            ReplicationMessage::Insert { relation_id, tuple_data, is_stream, xid } => {
                assert_eq!(relation_id, 7);
                assert!(!is_stream);
                assert_eq!(xid, None);
                assert_eq!(tuple_data.columns[0].data, "hi");
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn parses_null_and_unchanged_toast_columns() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&2i16.to_be_bytes());
        buf.push(b'n');
        buf.push(b'u');

        let msg = MessageParser::parse_wal_message(&buf).unwrap();
        match msg {
            ReplicationMessage::Insert { tuple_data, .. } => {
                assert_eq!(tuple_data.columns[0].data_type, 'n');
                assert_eq!(tuple_data.columns[1].data_type, 'u');
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn standby_status_update_is_exactly_34_bytes() {
        let update = StandbyStatusUpdate {
            write_lsn: 1,
            flush_lsn: 1,
            apply_lsn: 1,
            client_time: 0,
            reply_requested: false,
        };
        let bytes = update.to_bytes().unwrap();
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[0], b'r');
    }

    #[test]
    fn keepalive_round_trips_reply_flag() {
        let mut buf = vec![b'k'];
        buf.extend_from_slice(&500u64.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.push(1);

        let msg = KeepaliveMessage::parse(&buf).unwrap();
        assert_eq!(msg.wal_end, 500);
        assert!(msg.reply_requested);
    }
}

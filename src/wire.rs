//! Byte-order helpers and PostgreSQL timestamp conversion shared by the
//! buffer reader/writer and the replication protocol frames.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds from the Unix epoch (1970-01-01) to the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub type XLogRecPtr = u64;
pub type Xid = u32;
pub type Oid = u32;
pub type TimestampTz = i64;

/// Convert a `SystemTime` to microseconds since the PostgreSQL epoch, the
/// unit used by keepalive and standby status update frames.
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> TimestampTz {
    let duration_since_unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let unix_secs = duration_since_unix.as_secs() as i64;
    let unix_micros = unix_secs * 1_000_000 + (duration_since_unix.subsec_micros() as i64);
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

pub fn buf_recv_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

pub fn buf_recv_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

pub fn buf_recv_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

pub fn buf_recv_i16(buf: &[u8]) -> i16 {
    buf_recv_u16(buf) as i16
}

pub fn buf_recv_i32(buf: &[u8]) -> i32 {
    buf_recv_u32(buf) as i32
}

pub fn buf_recv_i64(buf: &[u8]) -> i64 {
    buf_recv_u64(buf) as i64
}

pub fn buf_recv_i8(buf: &[u8]) -> i8 {
    buf[0] as i8
}

pub fn buf_send_u16(val: u16, buf: &mut [u8]) {
    buf[0..2].copy_from_slice(&val.to_be_bytes());
}

pub fn buf_send_u32(val: u32, buf: &mut [u8]) {
    buf[0..4].copy_from_slice(&val.to_be_bytes());
}

pub fn buf_send_u64(val: u64, buf: &mut [u8]) {
    buf[0..8].copy_from_slice(&val.to_be_bytes());
}

pub fn buf_send_i16(val: i16, buf: &mut [u8]) {
    buf_send_u16(val as u16, buf)
}

pub fn buf_send_i32(val: i32, buf: &mut [u8]) {
    buf_send_u32(val as u32, buf)
}

pub fn buf_send_i64(val: i64, buf: &mut [u8]) {
    buf_send_u64(val as u64, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_u64() {
        let mut buf = [0u8; 8];
        buf_send_u64(0x0123_4567_89AB_CDEF, &mut buf);
        assert_eq!(buf_recv_u64(&buf), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn round_trips_i32_negative() {
        let mut buf = [0u8; 4];
        buf_send_i32(-42, &mut buf);
        assert_eq!(buf_recv_i32(&buf), -42);
    }

    #[test]
    fn postgres_timestamp_is_offset_from_pg_epoch() {
        let pg_epoch = SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(PG_EPOCH_OFFSET_SECS as u64);
        assert_eq!(system_time_to_postgres_timestamp(pg_epoch), 0);
    }
}

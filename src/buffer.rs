//! Cursor-based readers/writers over the fixed-layout byte frames used by
//! the pgoutput plugin and the replication protocol's keepalive/feedback
//! messages.

use crate::errors::{OutboxError, OutboxResult};
use crate::wire::{buf_recv_i16, buf_recv_i32, buf_recv_i64, buf_recv_u32, buf_recv_u64};

/// A buffer reader that manages position and provides meaningful parsing methods
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Skip the message type byte (typically the first byte of a frame).
    pub fn skip_message_type(&mut self) -> OutboxResult<char> {
        self.read_char()
    }

    pub fn read_u8(&mut self) -> OutboxResult<u8> {
        if !self.has_bytes(1) {
            return Err(OutboxError::buffer("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> OutboxResult<i16> {
        if !self.has_bytes(2) {
            return Err(OutboxError::buffer("not enough bytes for i16"));
        }
        let value = buf_recv_i16(&self.buffer[self.position..]);
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> OutboxResult<u32> {
        if !self.has_bytes(4) {
            return Err(OutboxError::buffer("not enough bytes for u32"));
        }
        let value = buf_recv_u32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> OutboxResult<i32> {
        if !self.has_bytes(4) {
            return Err(OutboxError::buffer("not enough bytes for i32"));
        }
        let value = buf_recv_i32(&self.buffer[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> OutboxResult<u64> {
        if !self.has_bytes(8) {
            return Err(OutboxError::buffer("not enough bytes for u64"));
        }
        let value = buf_recv_u64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> OutboxResult<i64> {
        if !self.has_bytes(8) {
            return Err(OutboxError::buffer("not enough bytes for i64"));
        }
        let value = buf_recv_i64(&self.buffer[self.position..]);
        self.position += 8;
        Ok(value)
    }

    pub fn read_null_terminated_string(&mut self) -> OutboxResult<String> {
        let start_pos = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(OutboxError::buffer("string not null-terminated"));
        }
        let string_value = String::from_utf8_lossy(&self.buffer[start_pos..self.position]).into_owned();
        self.position += 1;
        Ok(string_value)
    }

    pub fn read_length_prefixed_string(&mut self) -> OutboxResult<String> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(OutboxError::buffer("negative string length"));
        }

        const MAX_STRING_LENGTH: usize = 1024 * 1024;
        let length = length as usize;
        if length > MAX_STRING_LENGTH {
            return Err(OutboxError::buffer("string length exceeds maximum allowed size"));
        }
        if !self.has_bytes(length) {
            return Err(OutboxError::buffer("string data truncated"));
        }

        let string_value =
            String::from_utf8_lossy(&self.buffer[self.position..self.position + length]).into_owned();
        self.position += length;
        Ok(string_value)
    }

    pub fn peek_u8(&self) -> OutboxResult<u8> {
        if !self.has_bytes(1) {
            return Err(OutboxError::buffer("no bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }

    pub fn set_position(&mut self, position: usize) -> OutboxResult<()> {
        if position > self.buffer.len() {
            return Err(OutboxError::buffer("position out of bounds"));
        }
        self.position = position;
        Ok(())
    }

    pub fn read_char(&mut self) -> OutboxResult<char> {
        if !self.has_bytes(1) {
            return Err(OutboxError::buffer("not enough bytes for char"));
        }
        let val = self.buffer[self.position] as char;
        self.position += 1;
        Ok(val)
    }

    pub fn read_bytes(&mut self, count: usize) -> OutboxResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(OutboxError::buffer("not enough bytes"));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes.to_vec())
    }
}

/// A buffer writer that manages position and provides meaningful writing
/// methods for constructing binary messages with automatic position tracking.
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_space(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn write_u8(&mut self, value: u8) -> OutboxResult<()> {
        if !self.has_space(1) {
            return Err(OutboxError::buffer("not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> OutboxResult<()> {
        if !self.has_space(4) {
            return Err(OutboxError::buffer("not enough space for u32"));
        }
        crate::wire::buf_send_u32(value, &mut self.buffer[self.position..]);
        self.position += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> OutboxResult<()> {
        if !self.has_space(8) {
            return Err(OutboxError::buffer("not enough space for u64"));
        }
        crate::wire::buf_send_u64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> OutboxResult<()> {
        if !self.has_space(8) {
            return Err(OutboxError::buffer("not enough space for i64"));
        }
        crate::wire::buf_send_i64(value, &mut self.buffer[self.position..]);
        self.position += 8;
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }

    pub fn write_char(&mut self, message_type: char) -> OutboxResult<()> {
        if !self.has_space(1) {
            return Err(OutboxError::buffer("not enough space for char"));
        }
        self.buffer[self.position] = message_type as u8;
        self.position += 1;
        Ok(())
    }
}

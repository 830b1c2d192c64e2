//! Field encoding inside one frame.
//!
//! Integers are LEB128 varints (zig-zag for signed values), text is a varint
//! byte length followed by UTF-8, and nullable text carries a presence flag so
//! `None` never collides with the empty string. A writer accumulates a whole
//! frame in memory; nothing reaches the socket until the frame is complete.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MasterError;

/// Longest valid LEB128 encoding of a `u64`.
const MAX_VARINT_BYTES: usize = 10;

/// Builds one frame payload.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Create a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Write an unsigned LEB128 varint.
    pub fn write_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    /// Write a signed varint using zig-zag encoding.
    pub fn write_signed_varint(&mut self, value: i64) {
        self.write_varint(((value << 1) ^ (value >> 63)) as u64);
    }

    /// Write length-prefixed UTF-8 text.
    pub fn write_utf(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write text that may be absent.
    pub fn write_nullable_utf(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.write_bool(true);
                self.write_utf(value);
            }
            None => self.write_bool(false),
        }
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_varint(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish the frame.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads fields out of one received frame.
///
/// Every read is bounds-checked; a short or malformed frame yields
/// [`MasterError::Decode`], which retires the session it arrived on.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, MasterError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| MasterError::decode(format!("truncated frame at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bool(&mut self) -> Result<bool, MasterError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(MasterError::decode(format!("invalid boolean byte {other:#04x}"))),
        }
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> Result<u64, MasterError> {
        let mut value = 0u64;
        for index in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            // The tenth byte may only carry the final bit of a u64.
            if index == MAX_VARINT_BYTES - 1 && byte > 1 {
                return Err(MasterError::decode("varint overflows 64 bits"));
            }
            value |= u64::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(MasterError::decode("varint longer than 10 bytes"))
    }

    /// Read a zig-zag encoded signed varint.
    pub fn read_signed_varint(&mut self) -> Result<i64, MasterError> {
        let raw = self.read_varint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    /// Read a varint that must fit in `u32`.
    pub fn read_u32(&mut self) -> Result<u32, MasterError> {
        let raw = self.read_varint()?;
        u32::try_from(raw).map_err(|_| MasterError::decode(format!("value {raw} exceeds u32")))
    }

    /// Read a length prefix and check it against the bytes left in the frame.
    fn read_len(&mut self) -> Result<usize, MasterError> {
        let len = self.read_varint()?;
        if len > self.remaining() as u64 {
            return Err(MasterError::decode(format!(
                "length prefix {len} exceeds {} remaining bytes",
                self.remaining()
            )));
        }
        Ok(len as usize)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], MasterError> {
        let len = self.read_len()?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_utf(&mut self) -> Result<String, MasterError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| MasterError::decode(format!("invalid UTF-8 text: {e}")))
    }

    pub fn read_nullable_utf(&mut self) -> Result<Option<String>, MasterError> {
        if self.read_bool()? {
            self.read_utf().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Ensure the whole frame was consumed.
    pub fn finish(self) -> Result<(), MasterError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(MasterError::decode(format!("{} trailing bytes in frame", self.remaining())))
        }
    }
}

//! Big-endian byte encoding and decoding utilities
//!
//! Class files store every multi-byte quantity in big-endian order. The writer
//! and reader here are the only places that know about byte order.

use thiserror::Error;

/// Errors that can occur while decoding a class file
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid magic number
    #[error("Invalid magic number: expected 0xCAFEBABE, got {0:#010x}")]
    InvalidMagic(u32),

    /// Unknown constant pool tag
    #[error("Unknown constant pool tag {tag} for entry {index} at offset {offset}")]
    UnknownTag {
        /// The tag byte that was read
        tag: u8,
        /// Constant pool index of the entry
        index: u16,
        /// Byte offset of the tag
        offset: usize,
    },

    /// Invalid modified UTF-8 string
    #[error("Invalid modified UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Bytes left over after the last attribute
    #[error("{0} trailing bytes after end of class file")]
    TrailingBytes(usize),
}

/// Byte writer for class-file structures
pub struct ByteWriter {
    pub(crate) buffer: Vec<u8>,
}

impl ByteWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the bytes written so far
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer (big-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Emit a 32-bit unsigned integer (big-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Emit a 32-bit signed integer (big-endian)
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Emit a 64-bit signed integer (big-endian)
    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte reader over a class-file buffer
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a new reader positioned at the start of `buffer`
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Remaining bytes
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit unsigned integer (big-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit unsigned integer (big-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 32-bit signed integer (big-endian)
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a 64-bit signed integer (big-endian)
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let high = self.read_u32()? as u64;
        let low = self.read_u32()? as u64;
        Ok(((high << 32) | low) as i64)
    }

    /// Read a fixed number of bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(count)?.to_vec())
    }

    /// Skip a fixed number of bytes
    pub fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        self.take(count).map(|_| ())
    }
}

/// Encode a string in the modified UTF-8 form used by class files
///
/// NUL is written as the two-byte sequence `C0 80` and supplementary
/// characters as surrogate pairs, each pair half in three bytes.
pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

/// Decode modified UTF-8 bytes; `offset` is used for error reporting only
pub fn decode_modified_utf8(bytes: &[u8], offset: usize) -> Result<String, DecodeError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let unit = match b {
            0x01..=0x7F => {
                i += 1;
                b as u16
            }
            0xC0..=0xDF => {
                let b2 = continuation(bytes, i + 1, offset)?;
                i += 2;
                (((b & 0x1F) as u16) << 6) | b2
            }
            0xE0..=0xEF => {
                let b2 = continuation(bytes, i + 1, offset)?;
                let b3 = continuation(bytes, i + 2, offset)?;
                i += 3;
                (((b & 0x0F) as u16) << 12) | (b2 << 6) | b3
            }
            _ => return Err(DecodeError::InvalidUtf8(offset + i)),
        };
        units.push(unit);
    }
    String::from_utf16(&units).map_err(|_| DecodeError::InvalidUtf8(offset))
}

fn continuation(bytes: &[u8], at: usize, offset: usize) -> Result<u16, DecodeError> {
    match bytes.get(at) {
        Some(&b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u16),
        _ => Err(DecodeError::InvalidUtf8(offset + at)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_emission() {
        let mut writer = ByteWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u16(0x1234);
        writer.emit_u32(0xCAFE_BABE);

        assert_eq!(
            writer.buffer(),
            &[0x42, 0x12, 0x34, 0xCA, 0xFE, 0xBA, 0xBE]
        );
    }

    #[test]
    fn test_reader_primitives() {
        let mut writer = ByteWriter::new();
        writer.emit_u16(0xBEEF);
        writer.emit_i32(-42);
        writer.emit_i64(-5_000_000_000);

        let bytes = writer.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_i64().unwrap(), -5_000_000_000);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_reader_bounds_checking() {
        let bytes = [0x01];
        let mut reader = ByteReader::new(&bytes);

        assert_eq!(reader.read_u16(), Err(DecodeError::UnexpectedEnd(0)));
        // A failed read does not advance
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert!(reader.skip(1).is_err());
    }

    #[test]
    fn test_modified_utf8_ascii_is_identity() {
        assert_eq!(encode_modified_utf8("com/example/Marker"), b"com/example/Marker");
    }

    #[test]
    fn test_modified_utf8_nul_and_supplementary() {
        let encoded = encode_modified_utf8("a\0b");
        assert_eq!(encoded, vec![b'a', 0xC0, 0x80, b'b']);

        // U+1F389 becomes a surrogate pair, six bytes in total
        let party = encode_modified_utf8("\u{1F389}");
        assert_eq!(party.len(), 6);
        assert_eq!(decode_modified_utf8(&party, 0).unwrap(), "\u{1F389}");
    }

    #[test]
    fn test_modified_utf8_rejects_raw_nul() {
        assert_eq!(
            decode_modified_utf8(&[b'a', 0x00], 10),
            Err(DecodeError::InvalidUtf8(11))
        );
    }

    #[test]
    fn test_modified_utf8_roundtrip_multibyte() {
        let text = "caf\u{e9}/\u{3053}\u{3093}";
        let encoded = encode_modified_utf8(text);
        assert_eq!(decode_modified_utf8(&encoded, 0).unwrap(), text);
    }
}

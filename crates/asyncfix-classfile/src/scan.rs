//! Constant pool scanning without a full decode
//!
//! [`PoolIndex`] records the byte offset of every constant pool entry, the
//! same item table a streaming class reader keeps, and answers questions
//! about the raw bytes directly. Checking whether a module still mentions a
//! marker type then costs one pass over the pool and no allocation per entry.

use crate::constants::tags;
use crate::encoder::{encode_modified_utf8, ByteReader, DecodeError};
use crate::module::MAGIC;

/// Offset of `constant_pool_count` in a class file
const POOL_COUNT_OFFSET: usize = 8;

/// Item table of a class file's constant pool
///
/// `item(i)` is the offset of the first byte after entry `i`'s tag, or 0 when
/// slot `i` holds no entry (slot 0, the upper half of a `Long`/`Double`, or
/// an index past the end of the table).
#[derive(Debug, Clone)]
pub struct PoolIndex<'a> {
    data: &'a [u8],
    items: Vec<usize>,
    end: usize,
    complete: bool,
}

impl<'a> PoolIndex<'a> {
    /// Index the pool, failing on a bad header or a malformed entry
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(data);
        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(DecodeError::InvalidMagic(magic));
        }
        reader.skip(4)?;
        let count = reader.read_u16()?;

        let index = Self::index_entries(data, count);
        if !index.complete {
            let offset = index.end;
            return Err(match data.get(offset) {
                Some(&tag) if tags::fixed_payload_len(tag).is_none() && tag != tags::UTF8 => {
                    DecodeError::UnknownTag {
                        tag,
                        index: index.items.len() as u16,
                        offset,
                    }
                }
                _ => DecodeError::UnexpectedEnd(offset),
            });
        }
        Ok(index)
    }

    /// Index as much of the pool as is well formed
    ///
    /// Never fails: a short header yields an empty index, and indexing stops
    /// at the first truncated or unknown entry.
    pub fn parse_lenient(data: &'a [u8]) -> Self {
        match read_u16_at(data, POOL_COUNT_OFFSET) {
            Some(count) => Self::index_entries(data, count),
            None => Self {
                data,
                items: vec![0],
                end: data.len(),
                complete: false,
            },
        }
    }

    fn index_entries(data: &'a [u8], count: u16) -> Self {
        let mut items = Vec::with_capacity(count as usize);
        items.push(0);
        let mut offset = POOL_COUNT_OFFSET + 2;
        let mut complete = true;

        while items.len() < count as usize {
            let Some(&tag) = data.get(offset) else {
                complete = false;
                break;
            };
            let payload = match tags::fixed_payload_len(tag) {
                Some(len) => Some(len),
                None if tag == tags::UTF8 => {
                    read_u16_at(data, offset + 1).map(|len| 2 + len as usize)
                }
                None => None,
            };
            let Some(payload) = payload.filter(|len| offset + 1 + len <= data.len()) else {
                complete = false;
                break;
            };

            items.push(offset + 1);
            if tag == tags::LONG || tag == tags::DOUBLE {
                items.push(0);
            }
            offset += 1 + payload;
        }

        Self {
            data,
            items,
            end: offset,
            complete,
        }
    }

    /// Number of pool slots indexed (including slot 0)
    pub fn item_count(&self) -> u16 {
        self.items.len() as u16
    }

    /// Whether every entry declared by `constant_pool_count` was indexed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Offset just past the last indexed entry
    pub fn end_offset(&self) -> usize {
        self.end
    }

    /// Data offset of entry `index`, 0 if there is none
    pub fn item(&self, index: u16) -> usize {
        self.items.get(index as usize).copied().unwrap_or(0)
    }

    /// Tag of entry `index`
    pub fn tag(&self, index: u16) -> Option<u8> {
        match self.item(index) {
            0 => None,
            address => self.data.get(address - 1).copied(),
        }
    }

    /// Raw modified UTF-8 bytes of the `Utf8` entry at `index`
    pub fn utf8_bytes(&self, index: u16) -> Option<&'a [u8]> {
        if index == 0 || self.tag(index)? != tags::UTF8 {
            return None;
        }
        let address = self.item(index);
        let len = read_u16_at(self.data, address)? as usize;
        self.data.get(address + 2..address + 2 + len)
    }

    /// Raw name bytes of the `Class` entry at `index`
    pub fn class_name_bytes(&self, index: u16) -> Option<&'a [u8]> {
        if self.tag(index)? != tags::CLASS {
            return None;
        }
        let name_index = read_u16_at(self.data, self.item(index))?;
        self.utf8_bytes(name_index)
    }

    /// Names of every type referenced through a `Class` entry, in pool order
    pub fn class_references(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (1..self.item_count()).filter_map(move |i| self.class_name_bytes(i))
    }

    /// Check whether some `Class` entry names exactly `encoded_name`
    ///
    /// `encoded_name` must already be in modified UTF-8 form.
    pub fn references_class(&self, encoded_name: &[u8]) -> bool {
        for i in 1..self.item_count() {
            let address = self.item(i);
            if address > 0
                && self.data.get(address - 1) == Some(&tags::CLASS)
                && self.class_entry_equals(address, encoded_name)
            {
                return true;
            }
        }
        false
    }

    fn class_entry_equals(&self, address: usize, expected: &[u8]) -> bool {
        let Some(utf8_index) = read_u16_at(self.data, address) else {
            return false;
        };
        if utf8_index == 0 {
            return false;
        }
        let utf8_address = self.item(utf8_index);
        if utf8_address == 0 || self.data.get(utf8_address - 1) != Some(&tags::UTF8) {
            return false;
        }
        let Some(len) = read_u16_at(self.data, utf8_address) else {
            return false;
        };
        if len as usize != expected.len() {
            return false;
        }
        let start = utf8_address + 2;
        self.data.get(start..start + expected.len()) == Some(expected)
    }
}

fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Check whether `module` references the type `symbol` through a `Class` entry
///
/// Malformed input never panics; whatever part of the pool is readable is
/// scanned and everything else counts as no match.
pub fn references(module: &[u8], symbol: &str) -> bool {
    PoolIndex::parse_lenient(module).references_class(&encode_modified_utf8(symbol))
}

/// Reusable reference check for one symbol
///
/// Keeps the encoded form of the symbol so checking many fixtures does not
/// re-encode it each time.
#[derive(Debug, Clone)]
pub struct Scanner {
    symbol: String,
    encoded: Vec<u8>,
}

impl Scanner {
    /// Create a scanner for the internal type name `symbol`
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        let encoded = encode_modified_utf8(&symbol);
        Self { symbol, encoded }
    }

    /// The symbol this scanner looks for
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Check a module
    pub fn is_referenced_by(&self, module: &[u8]) -> bool {
        PoolIndex::parse_lenient(module).references_class(&self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::Constant;
    use crate::module::{ClassFile, OBJECT};

    fn class_mentioning(names: &[&str]) -> Vec<u8> {
        let mut class = ClassFile::new("test/Fixture", OBJECT);
        for name in names {
            class.constants.class(name);
        }
        class.encode()
    }

    #[test]
    fn test_finds_marker() {
        let bytes = class_mentioning(&["com/example/Marker"]);
        assert!(references(&bytes, "com/example/Marker"));
        assert!(!references(&bytes, "com/example/Other"));
    }

    #[test]
    fn test_utf8_without_class_entry_is_not_a_reference() {
        let mut class = ClassFile::new("test/Fixture", OBJECT);
        class.constants.utf8("com/example/Marker");
        let bytes = class.encode();
        assert!(!references(&bytes, "com/example/Marker"));
    }

    #[test]
    fn test_prefix_is_not_a_match() {
        let bytes = class_mentioning(&["com/example/MarkerExtra"]);
        assert!(!references(&bytes, "com/example/Marker"));
    }

    #[test]
    fn test_zero_name_index_is_non_matching() {
        let mut class = ClassFile::new("test/Fixture", OBJECT);
        class.constants.push(Constant::Class { name_index: 0 });
        let bytes = class.encode();
        let index = PoolIndex::parse(&bytes).unwrap();
        assert!(!index.references_class(b"anything"));
    }

    #[test]
    fn test_out_of_range_name_index_is_skipped() {
        let mut class = ClassFile::new("test/Fixture", OBJECT);
        class.constants.push(Constant::Class { name_index: 999 });
        class.constants.class("com/example/Marker");
        let bytes = class.encode();
        assert!(references(&bytes, "com/example/Marker"));
    }

    #[test]
    fn test_class_pointing_at_non_utf8_is_skipped() {
        let mut class = ClassFile::new("test/Fixture", OBJECT);
        let int_index = class.constants.integer(7);
        class.constants.push(Constant::Class {
            name_index: int_index,
        });
        let bytes = class.encode();
        assert!(!references(&bytes, "test/Fixture2"));
        assert_eq!(PoolIndex::parse(&bytes).unwrap().class_references().count(), 2);
    }

    #[test]
    fn test_wide_entries_are_skipped_in_item_table() {
        let mut class = ClassFile::new("test/Fixture", OBJECT);
        let long = class.constants.push(Constant::Long(-1));
        class.constants.class("com/example/Marker");
        let bytes = class.encode();

        let index = PoolIndex::parse(&bytes).unwrap();
        assert_ne!(index.item(long), 0);
        assert_eq!(index.item(long + 1), 0);
        assert!(index.is_complete());
        assert!(index.end_offset() < bytes.len());
        assert!(index.references_class(b"com/example/Marker"));
    }

    #[test]
    fn test_truncated_module_never_panics() {
        let bytes = class_mentioning(&["com/example/Marker"]);
        for len in 0..bytes.len() {
            let _ = references(&bytes[..len], "com/example/Marker");
        }
        // 20 bytes ends inside the first Utf8 entry
        let index = PoolIndex::parse_lenient(&bytes[..20]);
        assert!(!index.is_complete());
        assert!(index.end_offset() <= 20);
        assert!(PoolIndex::parse(&bytes[..20]).is_err());
    }

    #[test]
    fn test_non_ascii_symbol() {
        let bytes = class_mentioning(&["caf\u{e9}/Marker"]);
        assert!(references(&bytes, "caf\u{e9}/Marker"));
        assert!(!references(&bytes, "cafe/Marker"));
    }

    #[test]
    fn test_scanner_reuse() {
        let scanner = Scanner::new("com/example/Marker");
        assert!(scanner.is_referenced_by(&class_mentioning(&["com/example/Marker"])));
        assert!(!scanner.is_referenced_by(&class_mentioning(&[])));
        assert_eq!(scanner.symbol(), "com/example/Marker");
    }

    #[test]
    fn test_item_table_matches_full_decode() {
        let bytes = class_mentioning(&["a/A", "b/B"]);
        let decoded = ClassFile::decode(&bytes).unwrap();
        let index = PoolIndex::parse(&bytes).unwrap();

        assert_eq!(index.item_count(), decoded.constants.count());
        for (i, constant) in decoded.constants.iter() {
            assert_eq!(index.tag(i), Some(constant.tag()));
        }
    }
}

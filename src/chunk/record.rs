//! Key-value record layout inside a chunk arena:
//! `[keySize: u8][key][valueSize: u24 big-endian][value]`.
//!
//! A zero key size marks the end of the records; the tail of every data
//! chunk past its size is kept zero-filled.

pub const KEY_SIZE_BYTES: usize = 1;
pub const VALUE_SIZE_BYTES: usize = 3;
pub const RECORD_HEADER_SIZE: usize = KEY_SIZE_BYTES + VALUE_SIZE_BYTES;
pub const MAX_KEY_SIZE: usize = u8::MAX as usize;
pub const MAX_VALUE_SIZE: usize = (1 << 24) - 1;

pub fn record_size(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + value_len
}

/// Offset of the value bytes relative to the start of the record.
pub fn value_start(key_len: usize) -> usize {
    KEY_SIZE_BYTES + key_len + VALUE_SIZE_BYTES
}

/// Writes a record into `out`, which must be exactly `record_size` long.
pub fn write_record(out: &mut [u8], key: &[u8], value: &[u8]) {
    let value_len = value.len() as u32;
    out[0] = key.len() as u8;
    out[KEY_SIZE_BYTES..KEY_SIZE_BYTES + key.len()].copy_from_slice(key);
    let size_at = KEY_SIZE_BYTES + key.len();
    out[size_at..size_at + VALUE_SIZE_BYTES].copy_from_slice(&value_len.to_be_bytes()[1..]);
    out[size_at + VALUE_SIZE_BYTES..].copy_from_slice(value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl Record<'_> {
    pub fn size(&self) -> usize {
        record_size(self.key.len(), self.value.len())
    }
}

/// Parses the record at the start of `buf`. `None` at the end marker or on truncation.
pub fn read_record(buf: &[u8]) -> Option<Record<'_>> {
    let key_len = *buf.first()? as usize;
    if key_len == 0 {
        return None;
    }
    let key = buf.get(KEY_SIZE_BYTES..KEY_SIZE_BYTES + key_len)?;
    let size_at = KEY_SIZE_BYTES + key_len;
    let size_bytes = buf.get(size_at..size_at + VALUE_SIZE_BYTES)?;
    let value_len = u32::from_be_bytes([0, size_bytes[0], size_bytes[1], size_bytes[2]]) as usize;
    let value_at = size_at + VALUE_SIZE_BYTES;
    let value = buf.get(value_at..value_at + value_len)?;
    Some(Record { key, value })
}

/// Walks the records of an arena from offset 0.
pub fn records(buf: &[u8]) -> Records<'_> {
    Records { buf, offset: 0 }
}

pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = (usize, Record<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let record = read_record(self.buf.get(self.offset..)?)?;
        let at = self.offset;
        self.offset += record.size();
        Some((at, record))
    }
}

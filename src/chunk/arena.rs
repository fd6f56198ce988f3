use parking_lot::RwLock;
use std::sync::Arc;

use super::record::{self, Record};
use super::types::{ByteDelta, ChunkId, ChunkStatus, SealRecord, SharedChunk};
use crate::error::{EngineError, Result};

/// Fixed-capacity byte arena holding key-value records (data chunks) or
/// accumulated parity bytes (parity chunks).
///
/// Bytes past `size` are always zero, so a data chunk can be folded into
/// parity over its whole capacity and records can be scanned up to the
/// first zero key size.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    is_parity: bool,
    status: ChunkStatus,
    size: u32,
    capacity: u32,
    last_delete_pos: u32,
    /// Empty while the chunk is evicted to persistence.
    data: Vec<u8>,
}

impl Chunk {
    pub fn new(id: ChunkId, capacity: u32, is_parity: bool) -> Self {
        Self {
            id,
            is_parity,
            status: ChunkStatus::Empty,
            size: 0,
            capacity,
            last_delete_pos: 0,
            data: vec![0; capacity as usize],
        }
    }

    /// Rebuilds a chunk from raw arena bytes (chunk transfer, reconstruction).
    ///
    /// Shorter inputs are zero-padded. The size of a data chunk is recovered by
    /// walking its records; a parity chunk is considered full.
    pub fn from_bytes(
        id: ChunkId,
        capacity: u32,
        is_parity: bool,
        bytes: &[u8],
        status: ChunkStatus,
    ) -> Result<Self> {
        if bytes.len() > capacity as usize {
            return Err(EngineError::OutOfRange {
                offset: 0,
                end: bytes.len(),
                capacity: capacity as usize,
            });
        }
        let mut data = vec![0; capacity as usize];
        data[..bytes.len()].copy_from_slice(bytes);
        let size = if is_parity {
            capacity
        } else {
            record::records(&data).map(|(_, r)| r.size() as u32).sum()
        };
        Ok(Self {
            id,
            is_parity,
            status,
            size,
            capacity,
            last_delete_pos: 0,
            data,
        })
    }

    pub fn into_shared(self) -> SharedChunk {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn is_parity(&self) -> bool {
        self.is_parity
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ChunkStatus) {
        self.status = status;
    }

    pub fn is_sealed(&self) -> bool {
        matches!(
            self.status,
            ChunkStatus::Sealed | ChunkStatus::NeedsLoadFromDisk | ChunkStatus::Reconstructed
        )
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn free_space(&self) -> u32 {
        self.capacity - self.size
    }

    /// Lowest offset touched by the most recent compaction.
    pub fn last_delete_pos(&self) -> u32 {
        self.last_delete_pos
    }

    pub fn is_resident(&self) -> bool {
        self.status != ChunkStatus::NeedsLoadFromDisk
    }

    /// The full arena, `capacity` bytes long.
    pub fn data(&self) -> Result<&[u8]> {
        self.ensure_resident()?;
        Ok(&self.data)
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        self.ensure_resident()?;
        Ok(&mut self.data)
    }

    fn ensure_resident(&self) -> Result<()> {
        if self.is_resident() {
            Ok(())
        } else {
            Err(EngineError::ChunkNotResident(self.id))
        }
    }

    /// Appends a record and returns its offset. Moves an empty chunk to `Dirty`.
    pub fn append_record(&mut self, key: &[u8], value: &[u8]) -> Result<u32> {
        self.ensure_resident()?;
        let size = record::record_size(key.len(), value.len());
        if key.is_empty() || key.len() > record::MAX_KEY_SIZE || value.len() > record::MAX_VALUE_SIZE
        {
            return Err(EngineError::RecordTooLarge {
                size,
                capacity: self.capacity as usize,
            });
        }
        if size > self.free_space() as usize {
            return Err(EngineError::RecordTooLarge {
                size,
                capacity: self.free_space() as usize,
            });
        }

        let offset = self.size;
        let start = offset as usize;
        record::write_record(&mut self.data[start..start + size], key, value);
        self.size += size as u32;
        if self.status == ChunkStatus::Empty {
            self.status = ChunkStatus::Dirty;
        }
        Ok(offset)
    }

    /// The record starting at `offset`.
    pub fn record_at(&self, offset: u32) -> Result<Record<'_>> {
        self.ensure_resident()?;
        let start = offset as usize;
        let used = &self.data[..self.size as usize];
        used.get(start..)
            .and_then(record::read_record)
            .ok_or(EngineError::OutOfRange {
                offset: start,
                end: start,
                capacity: self.size as usize,
            })
    }

    /// Overwrites `bytes.len()` bytes of the value at `value_offset` inside the
    /// record at `offset`. Returns the arena delta (old XOR new).
    pub fn update_value(&mut self, offset: u32, value_offset: u32, bytes: &[u8]) -> Result<ByteDelta> {
        let (key_len, value_len) = {
            let record = self.record_at(offset)?;
            (record.key.len(), record.value.len())
        };
        let value_end = value_offset as usize + bytes.len();
        if value_end > value_len {
            return Err(EngineError::OutOfRange {
                offset: value_offset as usize,
                end: value_end,
                capacity: value_len,
            });
        }

        let start = offset as usize + record::value_start(key_len) + value_offset as usize;
        let target = &mut self.data[start..start + bytes.len()];
        let delta = target.iter().zip(bytes).map(|(old, new)| old ^ new).collect();
        target.copy_from_slice(bytes);
        Ok(ByteDelta {
            offset: start as u32,
            bytes: delta,
        })
    }

    /// Removes the record at `offset` by shifting every later record down.
    ///
    /// Returns the removed record length and the arena delta over
    /// `[offset, old size)`.
    pub fn delete_record(&mut self, offset: u32) -> Result<(u32, ByteDelta)> {
        let length = self.record_at(offset)?.size();
        let start = offset as usize;
        let old_size = self.size as usize;

        let before = self.data[start..old_size].to_vec();
        self.data.copy_within(start + length..old_size, start);
        self.data[old_size - length..old_size].fill(0);
        self.size -= length as u32;
        self.last_delete_pos = offset;

        let delta = before
            .iter()
            .zip(&self.data[start..old_size])
            .map(|(old, new)| old ^ new)
            .collect();
        Ok((
            length as u32,
            ByteDelta {
                offset,
                bytes: delta,
            },
        ))
    }

    /// XORs `delta` into the arena at `offset`, growing a parity chunk's size
    /// to cover the touched range.
    pub fn apply_delta(&mut self, offset: u32, delta: &[u8]) -> Result<()> {
        self.ensure_resident()?;
        let start = offset as usize;
        let end = start + delta.len();
        if end > self.capacity as usize {
            return Err(EngineError::OutOfRange {
                offset: start,
                end,
                capacity: self.capacity as usize,
            });
        }
        crate::coding::galois::xor_into(&mut self.data[start..end], delta);
        if self.is_parity && end as u32 > self.size {
            self.size = end as u32;
        }
        Ok(())
    }

    /// Every record of the chunk as `(key, offset, length)`.
    pub fn seal_records(&self) -> Result<Vec<SealRecord>> {
        self.ensure_resident()?;
        Ok(record::records(&self.data[..self.size as usize])
            .map(|(offset, r)| SealRecord {
                key: String::from_utf8_lossy(r.key).into_owned(),
                offset: offset as u32,
                length: r.size() as u32,
            })
            .collect())
    }

    /// Freezes the chunk against further appends.
    pub fn seal(&mut self) {
        if !self.is_sealed() {
            self.status = ChunkStatus::Sealed;
        }
    }

    /// Drops the resident bytes after the chunk was written to persistence.
    pub fn evict(&mut self) {
        self.data = Vec::new();
        self.status = ChunkStatus::NeedsLoadFromDisk;
    }

    /// Restores the bytes of an evicted chunk.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.capacity as usize {
            return Err(EngineError::OutOfRange {
                offset: 0,
                end: bytes.len(),
                capacity: self.capacity as usize,
            });
        }
        self.data = bytes.to_vec();
        self.status = ChunkStatus::Sealed;
        Ok(())
    }
}

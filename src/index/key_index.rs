use parking_lot::RwLock;
use std::collections::HashMap;

use crate::chunk::record;
use crate::chunk::{ByteDelta, Chunk, ChunkId, KeyLocation, SharedChunk};
use crate::error::{EngineError, Result};

/// Maps keys to the location of their latest value and chunk ids to the
/// resident chunks.
///
/// Lock order is always `keys -> chunks -> chunk`. Every operation that
/// touches a record holds the key map for its whole duration, so a reader
/// either sees the record before a compaction or does not find the key.
#[derive(Debug, Default)]
pub struct KeyIndex {
    keys: RwLock<HashMap<String, KeyLocation>>,
    chunks: RwLock<HashMap<ChunkId, SharedChunk>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chunk(&self, chunk: SharedChunk) {
        let id = chunk.read().id();
        self.chunks.write().insert(id, chunk);
    }

    pub fn find_chunk_by_id(&self, id: &ChunkId) -> Option<SharedChunk> {
        self.chunks.read().get(id).cloned()
    }

    /// False for open chunks and for chunks this index does not hold.
    pub fn is_sealed(&self, id: &ChunkId) -> bool {
        self.find_chunk_by_id(id)
            .map(|chunk| chunk.read().is_sealed())
            .unwrap_or(false)
    }

    /// Drops a chunk together with every key pointing into it.
    pub fn remove_chunk(&self, id: &ChunkId) -> Option<SharedChunk> {
        let mut keys = self.keys.write();
        let mut chunks = self.chunks.write();
        keys.retain(|_, location| location.chunk() != *id);
        chunks.remove(id)
    }

    /// Installs a whole chunk and indexes its records, replacing any keys
    /// previously indexed into the same chunk. An already known chunk is
    /// overwritten in place so other holders of it see the new bytes.
    pub fn install_chunk(&self, chunk: Chunk) -> Result<SharedChunk> {
        let id = chunk.id();
        let records = chunk.seal_records()?;

        let mut keys = self.keys.write();
        let mut chunks = self.chunks.write();
        keys.retain(|_, location| location.chunk() != id);
        let shared = match chunks.get(&id) {
            Some(existing) => {
                *existing.write() = chunk;
                existing.clone()
            }
            None => {
                let shared = chunk.into_shared();
                chunks.insert(id, shared.clone());
                shared
            }
        };
        for record in records {
            keys.insert(
                record.key,
                KeyLocation {
                    list_id: id.list_id,
                    stripe_id: id.stripe_id,
                    chunk_id: id.chunk_id,
                    offset: record.offset,
                    length: record.length,
                },
            );
        }
        Ok(shared)
    }

    pub fn find_location(&self, key: &str) -> Option<KeyLocation> {
        self.keys.read().get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.read().contains_key(key)
    }

    /// Appends `key -> value` to `chunk` and indexes it.
    pub fn insert_key(&self, key: &str, chunk: &SharedChunk, value: &[u8]) -> Result<KeyLocation> {
        let mut keys = self.keys.write();
        if keys.contains_key(key) {
            return Err(EngineError::KeyExists(key.to_string()));
        }
        let mut chunks = self.chunks.write();
        let mut guard = chunk.write();
        let id = guard.id();
        let offset = guard.append_record(key.as_bytes(), value)?;
        chunks.entry(id).or_insert_with(|| chunk.clone());

        let location = KeyLocation {
            list_id: id.list_id,
            stripe_id: id.stripe_id,
            chunk_id: id.chunk_id,
            offset,
            length: record::record_size(key.len(), value.len()) as u32,
        };
        keys.insert(key.to_string(), location);
        Ok(location)
    }

    /// Copy of the latest value of `key`.
    pub fn find_value_by_key(&self, key: &str) -> Result<(KeyLocation, Vec<u8>)> {
        let keys = self.keys.read();
        let location = *keys
            .get(key)
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
        let chunk = self.chunk_for(&location)?;
        let guard = chunk.read();
        let value = guard.record_at(location.offset)?.value.to_vec();
        Ok((location, value))
    }

    pub fn update_value(&self, key: &str, value_offset: u32, bytes: &[u8]) -> Result<(KeyLocation, ByteDelta)> {
        let keys = self.keys.read();
        let location = *keys
            .get(key)
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
        let chunk = self.chunk_for(&location)?;
        let delta = chunk.write().update_value(location.offset, value_offset, bytes)?;
        Ok((location, delta))
    }

    /// Removes `key` from its chunk. Records shifted down by the compaction
    /// get their offsets adjusted before the key map is released.
    pub fn delete_key(&self, key: &str) -> Result<(KeyLocation, ByteDelta)> {
        let mut keys = self.keys.write();
        let location = *keys
            .get(key)
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
        let chunk = self.chunk_for(&location)?;
        let mut guard = chunk.write();
        let (length, delta) = guard.delete_record(location.offset)?;
        keys.remove(key);

        let start = location.offset as usize;
        let shifted = guard.data()?[start..guard.size() as usize].to_vec();
        for (relative, moved) in record::records(&shifted) {
            let moved_key = String::from_utf8_lossy(moved.key);
            if let Some(entry) = keys.get_mut(&*moved_key)
                && entry.chunk() == location.chunk()
            {
                debug_assert_eq!(entry.offset, location.offset + relative as u32 + length);
                entry.offset = location.offset + relative as u32;
            }
        }
        Ok((location, delta))
    }

    fn chunk_for(&self, location: &KeyLocation) -> Result<SharedChunk> {
        self.chunks
            .read()
            .get(&location.chunk())
            .cloned()
            .ok_or(EngineError::ChunkNotResident(location.chunk()))
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.chunks.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

use dashmap::DashMap;

use super::Persistence;
use crate::chunk::{Chunk, ChunkId, ChunkStatus};
use crate::error::{EngineError, Result};

/// Persistence backend keeping chunk images in a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Full arena images keyed by `(id, is_parity)`.
    chunks: DashMap<(ChunkId, bool), Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn contains(&self, id: ChunkId, is_parity: bool) -> bool {
        self.chunks.contains_key(&(id, is_parity))
    }
}

impl Persistence for MemoryStorage {
    fn write(&self, chunk: &Chunk) -> Result<()> {
        let bytes = chunk.data()?.to_vec();
        self.chunks.insert((chunk.id(), chunk.is_parity()), bytes);
        tracing::debug!("Persisted chunk {} ({} bytes used)", chunk.id(), chunk.size());
        Ok(())
    }

    fn read(&self, id: ChunkId, is_parity: bool) -> Result<Option<Chunk>> {
        let Some(bytes) = self
            .chunks
            .get(&(id, is_parity))
            .map(|entry| entry.value().clone())
        else {
            return Ok(None);
        };
        let capacity = u32::try_from(bytes.len())
            .map_err(|_| EngineError::Persistence(format!("chunk {} image too large", id)))?;
        Chunk::from_bytes(id, capacity, is_parity, &bytes, ChunkStatus::Sealed).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_restores_records() {
        let storage = MemoryStorage::new();
        let mut chunk = Chunk::new(ChunkId::new(1, 2, 0), 32, false);
        chunk.append_record(b"a", b"xyz").unwrap();
        chunk.seal();
        storage.write(&chunk).unwrap();

        let restored = storage.read(chunk.id(), false).unwrap().unwrap();
        assert_eq!(restored.size(), chunk.size());
        assert_eq!(restored.record_at(0).unwrap().value, b"xyz");
        assert_eq!(restored.status(), ChunkStatus::Sealed);

        assert!(storage.read(chunk.id(), true).unwrap().is_none());
        assert!(storage.contains(chunk.id(), false));
    }

    #[test]
    fn test_evicted_chunk_cannot_be_written() {
        let storage = MemoryStorage::new();
        let mut chunk = Chunk::new(ChunkId::new(0, 0, 0), 16, false);
        chunk.evict();
        assert!(storage.write(&chunk).is_err());
        assert!(storage.is_empty());
    }
}

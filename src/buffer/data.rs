use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::chunk::record;
use crate::chunk::{ByteDelta, Chunk, ChunkId, KeyLocation, SealRecord, SharedChunk};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::index::KeyIndex;

/// A chunk frozen by the buffer, ready for the seal fan-out and persistence.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub id: ChunkId,
    pub chunk: SharedChunk,
    /// Snapshot of the used arena at seal time.
    pub bytes: Vec<u8>,
    pub records: Vec<SealRecord>,
}

#[derive(Debug)]
pub struct SetOutcome {
    pub location: KeyLocation,
    /// Chunks sealed while placing the record, in seal order.
    pub sealed: Vec<SealedChunk>,
    /// Set when the record landed in an already sealed (re-inserted) chunk,
    /// whose parity must be patched like an update.
    pub parity_delta: Option<ByteDelta>,
}

/// Result of an in-place UPDATE or a DELETE.
#[derive(Debug)]
pub struct Modification {
    pub location: KeyLocation,
    pub delta: ByteDelta,
    /// Whether the touched chunk was sealed, i.e. parity must be patched.
    pub sealed: bool,
}

#[derive(Debug, Default)]
struct BufferState {
    /// Sealed chunks that regained space through compaction.
    reinserted: Vec<SharedChunk>,
    /// Largest free space among `reinserted`, and which chunk holds it.
    max_reinserted_free: u32,
    max_holder: Option<ChunkId>,
}

#[derive(Debug)]
struct Slot {
    chunk: SharedChunk,
}

/// Open chunks of one `(list, data chunk)` position.
///
/// Locking is coarse to fine: the buffer-level [`BufferGuard`] must be held
/// to obtain a [`SlotGuard`], and both are taken before any key index lock.
#[derive(Debug)]
pub struct DataChunkBuffer {
    list_id: u32,
    chunk_id: u32,
    capacity: u32,
    flush_threshold: u32,
    next_stripe_id: AtomicU32,
    state: Mutex<BufferState>,
    slots: Vec<Mutex<Slot>>,
}

pub struct BufferGuard<'a> {
    buffer: &'a DataChunkBuffer,
    state: MutexGuard<'a, BufferState>,
}

pub struct SlotGuard<'g> {
    buffer: &'g DataChunkBuffer,
    slot: MutexGuard<'g, Slot>,
}

impl DataChunkBuffer {
    /// Opens `config.open_slots` chunks on stripes `0..open_slots` and
    /// registers them with the index.
    pub fn new(list_id: u32, chunk_id: u32, config: &EngineConfig, index: &KeyIndex) -> Self {
        let slots = (0..config.open_slots as u32)
            .map(|stripe_id| {
                let chunk = Chunk::new(
                    ChunkId::new(list_id, stripe_id, chunk_id),
                    config.chunk_size,
                    false,
                )
                .into_shared();
                index.insert_chunk(chunk.clone());
                Mutex::new(Slot { chunk })
            })
            .collect();

        Self {
            list_id,
            chunk_id,
            capacity: config.chunk_size,
            flush_threshold: config.flush_threshold,
            next_stripe_id: AtomicU32::new(config.open_slots as u32),
            state: Mutex::new(BufferState::default()),
            slots,
        }
    }

    pub fn list_id(&self) -> u32 {
        self.list_id
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id
    }

    pub fn lock(&self) -> BufferGuard<'_> {
        BufferGuard {
            buffer: self,
            state: self.state.lock(),
        }
    }

    /// Places a new record, sealing chunks as needed.
    pub fn set(&self, index: &KeyIndex, key: &str, value: &[u8]) -> Result<SetOutcome> {
        let size = record::record_size(key.len(), value.len());
        if size > self.capacity as usize {
            return Err(EngineError::RecordTooLarge {
                size,
                capacity: self.capacity as usize,
            });
        }

        let mut guard = self.lock();
        if index.contains_key(key) {
            return Err(EngineError::KeyExists(key.to_string()));
        }
        if let Some(outcome) = guard.set_reinserted(index, key, value, size as u32)? {
            return Ok(outcome);
        }

        let mut sealed = Vec::new();
        let slot_index = match guard.select(size as u32) {
            Some(slot_index) => slot_index,
            None => {
                let fullest = guard.fullest();
                sealed.push(guard.slot(fullest).seal_and_replace(index)?);
                fullest
            }
        };

        let mut slot = guard.slot(slot_index);
        let location = index.insert_key(key, &slot.chunk(), value)?;
        if slot.needs_flush() {
            sealed.push(slot.seal_and_replace(index)?);
        }
        Ok(SetOutcome {
            location,
            sealed,
            parity_delta: None,
        })
    }

    pub fn update(
        &self,
        index: &KeyIndex,
        key: &str,
        value_offset: u32,
        bytes: &[u8],
    ) -> Result<Modification> {
        let _guard = self.lock();
        let (location, delta) = index.update_value(key, value_offset, bytes)?;
        let sealed = index.is_sealed(&location.chunk());
        Ok(Modification {
            location,
            delta,
            sealed,
        })
    }

    /// Deletes a record. A sealed chunk that regains space is re-inserted
    /// as a candidate for later writes.
    pub fn delete(&self, index: &KeyIndex, key: &str) -> Result<Modification> {
        let mut guard = self.lock();
        let (location, delta) = index.delete_key(key)?;
        let sealed = index.is_sealed(&location.chunk());
        if sealed && let Some(chunk) = index.find_chunk_by_id(&location.chunk()) {
            guard.reinsert(chunk);
        }
        Ok(Modification {
            location,
            delta,
            sealed,
        })
    }

    /// Seals every open chunk, in slot order. Empty chunks seal too so the
    /// parity of their stripes stops waiting on them.
    pub fn seal_open_chunks(&self, index: &KeyIndex) -> Result<Vec<SealedChunk>> {
        let guard = self.lock();
        let mut sealed = Vec::with_capacity(self.slots.len());
        for slot_index in 0..self.slots.len() {
            sealed.push(guard.slot(slot_index).seal_and_replace(index)?);
        }
        Ok(sealed)
    }

    /// Ids of the currently open chunks, in slot order.
    pub fn open_chunk_ids(&self) -> Vec<ChunkId> {
        let guard = self.lock();
        (0..self.slots.len())
            .map(|slot_index| guard.slot(slot_index).chunk().read().id())
            .collect()
    }

    pub fn reinserted_ids(&self) -> Vec<ChunkId> {
        self.lock()
            .state
            .reinserted
            .iter()
            .map(|chunk| chunk.read().id())
            .collect()
    }
}

impl<'a> BufferGuard<'a> {
    /// The slot guard borrows the buffer guard, so it can never outlive it.
    pub fn slot(&self, slot_index: usize) -> SlotGuard<'_> {
        SlotGuard {
            buffer: self.buffer,
            slot: self.buffer.slots[slot_index].lock(),
        }
    }

    /// Slot with the most free space that still fits `size`, lowest stripe on ties.
    fn select(&self, size: u32) -> Option<usize> {
        let mut best: Option<(usize, u32, u32)> = None;
        for slot_index in 0..self.buffer.slots.len() {
            let (free, stripe_id) = self.slot(slot_index).free_and_stripe();
            if free < size {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_free, best_stripe)) => {
                    free > best_free || (free == best_free && stripe_id < best_stripe)
                }
            };
            if better {
                best = Some((slot_index, free, stripe_id));
            }
        }
        best.map(|(slot_index, _, _)| slot_index)
    }

    /// Slot with the least free space, lowest stripe on ties.
    fn fullest(&self) -> usize {
        (0..self.buffer.slots.len())
            .map(|slot_index| {
                let (free, stripe_id) = self.slot(slot_index).free_and_stripe();
                (free, stripe_id, slot_index)
            })
            .min()
            .map(|(_, _, slot_index)| slot_index)
            .unwrap_or(0)
    }

    fn reinsert(&mut self, chunk: SharedChunk) {
        let (id, free) = {
            let guard = chunk.read();
            (guard.id(), guard.free_space())
        };
        let known = self
            .state
            .reinserted
            .iter()
            .any(|existing| existing.read().id() == id);
        if !known {
            tracing::debug!("Re-inserting sealed chunk {} with {} free bytes", id, free);
            self.state.reinserted.push(chunk);
        }
        if free > self.state.max_reinserted_free || self.state.max_holder == Some(id) {
            self.recompute_reinserted();
        }
    }

    fn recompute_reinserted(&mut self) {
        let min_record = record::record_size(1, 0) as u32;
        self.state.reinserted.retain(|chunk| {
            let guard = chunk.read();
            guard.is_resident() && guard.free_space() >= min_record
        });
        let best = self
            .state
            .reinserted
            .iter()
            .map(|chunk| {
                let guard = chunk.read();
                (guard.free_space(), guard.id())
            })
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        self.state.max_reinserted_free = best.map(|(free, _)| free).unwrap_or(0);
        self.state.max_holder = best.map(|(_, id)| id);
    }

    /// Places the record into the re-inserted chunk with the most free space
    /// when the cached maximum says it fits.
    fn set_reinserted(
        &mut self,
        index: &KeyIndex,
        key: &str,
        value: &[u8],
        size: u32,
    ) -> Result<Option<SetOutcome>> {
        if size > self.state.max_reinserted_free {
            return Ok(None);
        }
        let holder = self.state.max_holder.and_then(|id| {
            self.state
                .reinserted
                .iter()
                .find(|chunk| chunk.read().id() == id)
                .cloned()
        });
        let Some(holder) = holder else {
            self.recompute_reinserted();
            return Ok(None);
        };

        let location = match index.insert_key(key, &holder, value) {
            Ok(location) => location,
            Err(EngineError::ChunkNotResident(_)) => {
                self.recompute_reinserted();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let start = location.offset as usize;
        let bytes = holder.read().data()?[start..start + location.length as usize].to_vec();
        self.recompute_reinserted();

        Ok(Some(SetOutcome {
            location,
            sealed: Vec::new(),
            parity_delta: Some(ByteDelta {
                offset: location.offset,
                bytes,
            }),
        }))
    }
}

impl SlotGuard<'_> {
    pub fn chunk(&self) -> SharedChunk {
        self.slot.chunk.clone()
    }

    fn free_and_stripe(&self) -> (u32, u32) {
        let chunk = self.slot.chunk.read();
        (chunk.free_space(), chunk.id().stripe_id)
    }

    fn needs_flush(&self) -> bool {
        self.slot.chunk.read().size() > self.buffer.capacity - self.buffer.flush_threshold
    }

    /// Seals the slot's chunk and opens a fresh one on the next stripe id.
    fn seal_and_replace(&mut self, index: &KeyIndex) -> Result<SealedChunk> {
        let sealed = self.slot.chunk.clone();
        let (id, bytes, records) = {
            let mut chunk = sealed.write();
            chunk.seal();
            let size = chunk.size() as usize;
            (chunk.id(), chunk.data()?[..size].to_vec(), chunk.seal_records()?)
        };

        let stripe_id = self.buffer.next_stripe_id.fetch_add(1, Ordering::Relaxed);
        let fresh = Chunk::new(
            ChunkId::new(self.buffer.list_id, stripe_id, self.buffer.chunk_id),
            self.buffer.capacity,
            false,
        )
        .into_shared();
        index.insert_chunk(fresh.clone());
        self.slot.chunk = fresh;

        tracing::debug!(
            "Sealed chunk {} ({} bytes, {} keys), opened stripe {}",
            id,
            bytes.len(),
            records.len(),
            stripe_id
        );
        Ok(SealedChunk {
            id,
            chunk: sealed,
            bytes,
            records,
        })
    }
}

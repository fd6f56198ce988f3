use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkId, ChunkStatus, SealRecord};
use crate::coding::CodingEngine;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pending::ReplyTo;

/// An update that reached the parity holder before the data chunk's seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredUpdate {
    pub reply_to: ReplyTo,
    pub key: String,
    pub data_chunk: u32,
    pub offset: u32,
    pub delta: Vec<u8>,
}

/// A write to a key of a data chunk that has not sealed yet, mirrored on
/// the parity holders so the key survives the loss of its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaOp {
    Set(Vec<u8>),
    Update { offset: u32, value: Vec<u8> },
    Delete,
}

/// What a parity holder contributes to the reconstruction of one data chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParitySnapshot {
    pub bytes: Vec<u8>,
    pub pending: Vec<bool>,
    /// Replicated records of the requested data chunk, sorted by key.
    pub replicas: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityApply {
    /// Folded into parity; the requester can be answered now.
    Applied,
    /// Parked until the data chunk seals; answered on replay.
    Deferred,
}

/// Parity accumulation state of one stripe.
#[derive(Debug)]
pub struct ParityChunkWrapper {
    pub chunk: Chunk,
    /// `pending[i]` is true until data chunk `i` sealed into this parity.
    pub pending: Vec<bool>,
    /// Records announced by each data chunk's seal.
    pub records: Vec<Vec<SealRecord>>,
    deferred: HashMap<(u32, String), DeferredUpdate>,
    /// Keys written to each data chunk before its seal arrived.
    replicas: Vec<BTreeMap<String, Vec<u8>>>,
}

impl ParityChunkWrapper {
    fn new(id: ChunkId, capacity: u32, data_chunks: usize) -> Self {
        let mut chunk = Chunk::new(id, capacity, true);
        chunk.set_status(ChunkStatus::Dirty);
        Self {
            chunk,
            pending: vec![true; data_chunks],
            records: vec![Vec::new(); data_chunks],
            deferred: HashMap::new(),
            replicas: vec![BTreeMap::new(); data_chunks],
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.pending.iter().all(|pending| !pending)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

/// Parity chunks held for one `(list, parity slot)` position, one wrapper per stripe.
///
/// Seal and update notifications from the data holders arrive in any order.
/// An update for a data chunk that has not sealed here yet is deferred by key
/// and replayed at its carried offset once the seal arrives.
#[derive(Debug)]
pub struct ParityChunkBuffer {
    list_id: u32,
    parity_index: usize,
    capacity: u32,
    coding: Arc<CodingEngine>,
    wrappers: Mutex<BTreeMap<u32, Arc<Mutex<ParityChunkWrapper>>>>,
}

impl ParityChunkBuffer {
    pub fn new(
        list_id: u32,
        parity_index: usize,
        config: &EngineConfig,
        coding: Arc<CodingEngine>,
    ) -> Self {
        Self {
            list_id,
            parity_index,
            capacity: config.chunk_size,
            coding,
            wrappers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn list_id(&self) -> u32 {
        self.list_id
    }

    /// Stripe slot of this parity chunk (`k + parity_index`).
    pub fn chunk_id(&self) -> u32 {
        (self.coding.data_chunks() + self.parity_index) as u32
    }

    fn wrapper(&self, stripe_id: u32) -> Arc<Mutex<ParityChunkWrapper>> {
        let mut wrappers = self.wrappers.lock();
        wrappers
            .entry(stripe_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ParityChunkWrapper::new(
                    ChunkId::new(self.list_id, stripe_id, self.chunk_id()),
                    self.capacity,
                    self.coding.data_chunks(),
                )))
            })
            .clone()
    }

    fn existing(&self, stripe_id: u32) -> Option<Arc<Mutex<ParityChunkWrapper>>> {
        self.wrappers.lock().get(&stripe_id).cloned()
    }

    fn check_data_chunk(&self, data_chunk: u32) -> Result<()> {
        if data_chunk as usize >= self.coding.data_chunks() {
            return Err(EngineError::OutOfRange {
                offset: data_chunk as usize,
                end: data_chunk as usize + 1,
                capacity: self.coding.data_chunks(),
            });
        }
        Ok(())
    }

    /// Folds a sealed data chunk into the stripe's parity and replays every
    /// update deferred on it. Returns the replayed updates so their
    /// requesters can be answered.
    pub fn seal(
        &self,
        stripe_id: u32,
        data_chunk: u32,
        bytes: &[u8],
        records: Vec<SealRecord>,
    ) -> Result<Vec<DeferredUpdate>> {
        self.check_data_chunk(data_chunk)?;
        let wrapper = self.wrapper(stripe_id);
        let mut wrapper = wrapper.lock();
        let index = data_chunk as usize;
        if !wrapper.pending[index] {
            tracing::warn!(
                "Duplicate seal of data chunk {} for parity {}, ignoring",
                data_chunk,
                wrapper.chunk.id()
            );
            return Ok(Vec::new());
        }

        self.coding.fold(
            wrapper.chunk.data_mut()?,
            self.parity_index,
            index,
            0,
            bytes,
        )?;
        wrapper.pending[index] = false;
        wrapper.records[index] = records;
        let dropped = std::mem::take(&mut wrapper.replicas[index]).len();

        let keys: Vec<(u32, String)> = wrapper
            .deferred
            .keys()
            .filter(|(chunk, _)| *chunk == data_chunk)
            .cloned()
            .collect();
        let mut replayed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(update) = wrapper.deferred.remove(&key) else {
                continue;
            };
            self.coding.fold(
                wrapper.chunk.data_mut()?,
                self.parity_index,
                index,
                update.offset as usize,
                &update.delta,
            )?;
            replayed.push(update);
        }
        if wrapper.is_resolved() {
            wrapper.chunk.set_status(ChunkStatus::Sealed);
        }

        tracing::debug!(
            "Parity {} folded seal of data chunk {} ({} bytes, {} deferred replayed, {} replicas dropped)",
            wrapper.chunk.id(),
            data_chunk,
            bytes.len(),
            replayed.len(),
            dropped
        );
        Ok(replayed)
    }

    /// Applies a mirrored write to an unsealed key. Once the data chunk has
    /// sealed here the seal already carried the record, so the write is
    /// dropped.
    pub fn replicate(&self, stripe_id: u32, data_chunk: u32, key: &str, op: &ReplicaOp) -> Result<()> {
        self.check_data_chunk(data_chunk)?;
        let wrapper = self.wrapper(stripe_id);
        let mut wrapper = wrapper.lock();
        let index = data_chunk as usize;
        if !wrapper.pending[index] {
            tracing::debug!(
                "Data chunk {} of stripe {} already sealed, dropping replica of {:?}",
                data_chunk,
                stripe_id,
                key
            );
            return Ok(());
        }

        let replicas = &mut wrapper.replicas[index];
        match op {
            ReplicaOp::Set(value) => {
                if replicas.contains_key(key) {
                    return Err(EngineError::KeyExists(key.to_string()));
                }
                replicas.insert(key.to_string(), value.clone());
            }
            ReplicaOp::Update { offset, value } => {
                let stored = replicas
                    .get_mut(key)
                    .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
                let start = *offset as usize;
                let end = start + value.len();
                if end > stored.len() {
                    return Err(EngineError::OutOfRange {
                        offset: start,
                        end,
                        capacity: stored.len(),
                    });
                }
                stored[start..end].copy_from_slice(value);
            }
            ReplicaOp::Delete => {
                replicas
                    .remove(key)
                    .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
            }
        }
        Ok(())
    }

    /// Folds an UPDATE/DELETE delta, or defers it when the data chunk has not
    /// sealed here yet. A second deferral for the same key is rejected.
    pub fn update(
        &self,
        stripe_id: u32,
        data_chunk: u32,
        key: &str,
        offset: u32,
        delta: &[u8],
        reply_to: ReplyTo,
    ) -> Result<ParityApply> {
        self.check_data_chunk(data_chunk)?;
        let wrapper = self.wrapper(stripe_id);
        let mut wrapper = wrapper.lock();
        let index = data_chunk as usize;

        if !wrapper.pending[index] {
            self.coding.fold(
                wrapper.chunk.data_mut()?,
                self.parity_index,
                index,
                offset as usize,
                delta,
            )?;
            return Ok(ParityApply::Applied);
        }

        let end = offset as usize + delta.len();
        if end > self.capacity as usize {
            return Err(EngineError::OutOfRange {
                offset: offset as usize,
                end,
                capacity: self.capacity as usize,
            });
        }
        let slot = (data_chunk, key.to_string());
        if wrapper.deferred.contains_key(&slot) {
            let chunk = ChunkId::new(self.list_id, stripe_id, data_chunk);
            tracing::error!(
                "Second deferred update for key {:?} in {} before its seal arrived",
                key,
                chunk
            );
            return Err(EngineError::PoisonedDeferredUpdate {
                key: key.to_string(),
                chunk,
            });
        }
        wrapper.deferred.insert(
            slot,
            DeferredUpdate {
                reply_to,
                key: key.to_string(),
                data_chunk,
                offset,
                delta: delta.to_vec(),
            },
        );
        tracing::debug!(
            "Deferred update for key {:?} until data chunk {} of stripe {} seals",
            key,
            data_chunk,
            stripe_id
        );
        Ok(ParityApply::Deferred)
    }

    /// Parity bytes and pending bitmap of a stripe, if any contribution arrived.
    pub fn get_chunk(&self, stripe_id: u32) -> Option<(Vec<u8>, Vec<bool>)> {
        let wrapper = self.existing(stripe_id)?;
        let wrapper = wrapper.lock();
        let bytes = wrapper.chunk.data().ok()?.to_vec();
        Some((bytes, wrapper.pending.clone()))
    }

    /// Parity bytes, pending bitmap and the replicas of `data_chunk`, read
    /// under one lock.
    pub fn snapshot(&self, stripe_id: u32, data_chunk: u32) -> Option<ParitySnapshot> {
        let wrapper = self.existing(stripe_id)?;
        let wrapper = wrapper.lock();
        let replicas = wrapper
            .replicas
            .get(data_chunk as usize)
            .map(|replicas| {
                replicas
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Some(ParitySnapshot {
            bytes: wrapper.chunk.data().ok()?.to_vec(),
            pending: wrapper.pending.clone(),
            replicas,
        })
    }

    pub fn replicas(&self, stripe_id: u32, data_chunk: u32) -> Vec<(String, Vec<u8>)> {
        self.snapshot(stripe_id, data_chunk)
            .map(|snapshot| snapshot.replicas)
            .unwrap_or_default()
    }

    pub fn pending(&self, stripe_id: u32) -> Option<Vec<bool>> {
        Some(self.existing(stripe_id)?.lock().pending.clone())
    }

    pub fn deferred_len(&self, stripe_id: u32) -> usize {
        self.existing(stripe_id)
            .map(|wrapper| wrapper.lock().deferred_len())
            .unwrap_or(0)
    }

    /// Replaces a stripe's parity with bytes rebuilt elsewhere.
    pub fn install(&self, stripe_id: u32, bytes: &[u8]) -> Result<()> {
        let id = ChunkId::new(self.list_id, stripe_id, self.chunk_id());
        let chunk = Chunk::from_bytes(id, self.capacity, true, bytes, ChunkStatus::Sealed)?;
        let wrapper = self.wrapper(stripe_id);
        let mut wrapper = wrapper.lock();
        wrapper.chunk = chunk;
        wrapper.pending.iter_mut().for_each(|pending| *pending = false);
        wrapper.replicas.iter_mut().for_each(BTreeMap::clear);
        Ok(())
    }

    pub fn stripe_ids(&self) -> Vec<u32> {
        self.wrappers.lock().keys().copied().collect()
    }
}

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::types::{DegradedOp, DegradedState, SlotContent};
use crate::chunk::{Chunk, ChunkId, SharedChunk};
use crate::cluster::types::NodeId;
use crate::error::Result;
use crate::index::KeyIndex;

#[derive(Debug)]
struct Reconstruction {
    state: DegradedState,
    request_id: u64,
    /// Collected stripe slots, `k` data followed by `m` parity.
    slots: Vec<Option<SlotContent>>,
    asked: usize,
    responded: usize,
    failed: usize,
    waiters: Vec<DegradedOp>,
}

#[derive(Debug)]
pub enum Begin {
    /// The chunk is already reconstructed; serve the op right away.
    Cached(DegradedOp),
    /// Joined an in-flight reconstruction as a waiter.
    Appended,
    /// First request for this chunk; the caller must fan out chunk requests.
    Started,
}

#[derive(Debug)]
pub enum ChunkProgress {
    Waiting,
    /// Every asked peer settled and at least `k` answered.
    Ready(Vec<Option<SlotContent>>),
    /// Too many peers failed to answer.
    Failed { available: usize, required: usize },
    /// No reconstruction is in flight for the chunk.
    Unknown,
}

/// Chunks being reconstructed or already reconstructed on this node.
///
/// N concurrent operations on the same lost chunk trigger exactly one
/// reconstruction fan-out; later ones wait in the entry created by the first.
#[derive(Debug)]
pub struct DegradedMap {
    data_chunks: usize,
    stripe_width: usize,
    in_flight: Mutex<HashMap<ChunkId, Reconstruction>>,
    /// Reconstructed chunks with their keys.
    index: KeyIndex,
    /// Reconstructed chunks per lost node, flushed on release.
    lost: Mutex<HashMap<NodeId, BTreeSet<ChunkId>>>,
}

impl DegradedMap {
    pub fn new(data_chunks: usize, parity_chunks: usize) -> Self {
        Self {
            data_chunks,
            stripe_width: data_chunks + parity_chunks,
            in_flight: Mutex::new(HashMap::new()),
            index: KeyIndex::new(),
            lost: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    pub fn state(&self, chunk: &ChunkId) -> DegradedState {
        if let Some(reconstruction) = self.in_flight.lock().get(chunk) {
            return reconstruction.state;
        }
        if self.index.find_chunk_by_id(chunk).is_some() {
            DegradedState::Resolved
        } else {
            DegradedState::Normal
        }
    }

    pub fn is_reconstructed(&self, chunk: &ChunkId) -> bool {
        self.index.find_chunk_by_id(chunk).is_some()
    }

    /// Registers a degraded operation, deduplicating concurrent reconstructions.
    pub fn begin(&self, op: DegradedOp, request_id: u64) -> Begin {
        let chunk = op.chunk();
        let mut in_flight = self.in_flight.lock();
        if let Some(reconstruction) = in_flight.get_mut(&chunk) {
            tracing::debug!("Reconstruction of {} already in flight, queueing {:?}", chunk, op.key);
            reconstruction.waiters.push(op);
            return Begin::Appended;
        }
        if self.index.find_chunk_by_id(&chunk).is_some() {
            return Begin::Cached(op);
        }

        tracing::info!("Starting reconstruction of {}", chunk);
        in_flight.insert(
            chunk,
            Reconstruction {
                state: DegradedState::AwaitingChunks,
                request_id,
                slots: vec![None; self.stripe_width],
                asked: 0,
                responded: 0,
                failed: 0,
                waiters: vec![op],
            },
        );
        Begin::Started
    }

    /// Request id of the chunk fan-out for `chunk`.
    pub fn request_id(&self, chunk: &ChunkId) -> Option<u64> {
        self.in_flight.lock().get(chunk).map(|r| r.request_id)
    }

    /// Number of peers the fan-out reached (including this node's own slot).
    pub fn set_asked(&self, chunk: &ChunkId, asked: usize) -> ChunkProgress {
        let mut in_flight = self.in_flight.lock();
        let Some(reconstruction) = in_flight.get_mut(chunk) else {
            return ChunkProgress::Unknown;
        };
        reconstruction.asked = asked;
        self.progress(reconstruction)
    }

    /// Records the answer of stripe slot `slot`; `None` when the peer could not
    /// provide its chunk.
    pub fn record_chunk(&self, chunk: &ChunkId, slot: u32, content: Option<SlotContent>) -> ChunkProgress {
        let mut in_flight = self.in_flight.lock();
        let Some(reconstruction) = in_flight.get_mut(chunk) else {
            return ChunkProgress::Unknown;
        };
        if reconstruction.state != DegradedState::AwaitingChunks {
            return ChunkProgress::Waiting;
        }
        match (reconstruction.slots.get_mut(slot as usize), content) {
            (Some(entry), Some(content)) if entry.is_none() => {
                *entry = Some(content);
                reconstruction.responded += 1;
            }
            (Some(_), None) => reconstruction.failed += 1,
            _ => return ChunkProgress::Waiting,
        }
        self.progress(reconstruction)
    }

    fn progress(&self, reconstruction: &mut Reconstruction) -> ChunkProgress {
        if reconstruction.state != DegradedState::AwaitingChunks {
            return ChunkProgress::Waiting;
        }
        let outstanding = reconstruction
            .asked
            .saturating_sub(reconstruction.responded + reconstruction.failed);
        if reconstruction.asked > 0 && reconstruction.responded + outstanding < self.data_chunks {
            return ChunkProgress::Failed {
                available: reconstruction.responded + outstanding,
                required: self.data_chunks,
            };
        }
        // Parity may lag its data chunks, so every answer counts.
        if reconstruction.asked > 0 && outstanding == 0 {
            reconstruction.state = DegradedState::Reconstructing;
            return ChunkProgress::Ready(std::mem::take(&mut reconstruction.slots));
        }
        ChunkProgress::Waiting
    }

    /// Installs a reconstructed chunk and hands back every waiting operation.
    pub fn install(&self, chunk: Chunk, lost_node: &NodeId) -> Result<Vec<DegradedOp>> {
        let id = chunk.id();
        let mut in_flight = self.in_flight.lock();
        self.index.install_chunk(chunk)?;
        self.lost
            .lock()
            .entry(lost_node.clone())
            .or_default()
            .insert(id);
        let waiters = in_flight
            .remove(&id)
            .map(|reconstruction| reconstruction.waiters)
            .unwrap_or_default();
        tracing::info!(
            "Reconstructed {} for {:?}, replaying {} waiting ops",
            id,
            lost_node,
            waiters.len()
        );
        Ok(waiters)
    }

    /// Abandons a reconstruction and hands back its waiters for failure replies.
    pub fn fail(&self, chunk: &ChunkId) -> Vec<DegradedOp> {
        self.in_flight
            .lock()
            .remove(chunk)
            .map(|reconstruction| reconstruction.waiters)
            .unwrap_or_default()
    }

    /// Removes every chunk reconstructed on behalf of `node`.
    pub fn drain_for_node(&self, node: &NodeId) -> Vec<SharedChunk> {
        let ids = self.lost.lock().remove(node).unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.index.remove_chunk(id))
            .collect()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

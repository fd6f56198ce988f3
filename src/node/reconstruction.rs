//! Degraded-mode serving on the reconstructor side.
//!
//! The first degraded operation on a lost chunk asks every reachable stripe
//! peer for its chunk at the same coordinate; the node's own slot is read
//! locally. Once every peer settled, the chunk is decoded (or rebuilt from
//! parity replicas when it never sealed), cached in the degraded map, and
//! every waiting operation is replayed against it.

use super::protocol::{ChunkReply, Envelope, Message};
use super::server::{ChunkLeg, ParityChange, ParityReply, ServerNode};
use crate::buffer::ReplicaOp;
use crate::chunk::{Chunk, ChunkId, ChunkStatus};
use crate::cluster::Placement;
use crate::cluster::types::NodeId;
use crate::degraded::{
    Begin, ChunkProgress, DegradedOp, DegradedOpKind, Rebuild, SlotContent, plan_rebuild,
};
use crate::error::{EngineError, ErrorCode, Result};
use crate::pending::{PendingIdentifier, ReplyTo};

impl ServerNode {
    /// Returns true when the operation is parked in the degraded map or
    /// waiting on parity legs.
    pub(super) fn handle_degraded(&self, envelope: Envelope) -> bool {
        let Envelope { from, message } = envelope;
        let Message::Degraded {
            request_id,
            lost,
            location,
            key,
            op,
        } = message
        else {
            return false;
        };

        let chunk = location.chunk();
        let op = DegradedOp {
            list_id: chunk.list_id,
            stripe_id: chunk.stripe_id,
            lost_chunk_id: chunk.chunk_id,
            key,
            op,
            reply: ReplyTo {
                origin: self.ctx.handle_for(&from),
                request_id,
            },
        };
        let fan_out_id = self.ctx.next_request_id();
        match self.degraded.begin(op, fan_out_id) {
            Begin::Cached(op) => self.serve_degraded(op),
            Begin::Appended => true,
            Begin::Started => {
                self.start_reconstruction(chunk, &lost, fan_out_id);
                true
            }
        }
    }

    fn start_reconstruction(&self, chunk: ChunkId, lost: &NodeId, request_id: u64) {
        let k = self.coding.data_chunks();
        let Some(list) = self.ctx.placement.list(chunk.list_id) else {
            self.fail_reconstruction(&chunk, ErrorCode::NotOwner);
            return;
        };

        let mut own_slot = None;
        let mut remote = Vec::new();
        for (slot, peer) in list.slots() {
            if slot == chunk.chunk_id {
                continue;
            }
            if *peer == self.ctx.id {
                own_slot = Some(slot);
            } else if self.ctx.view.is_normal(peer) {
                remote.push((slot, peer.clone()));
            } else {
                tracing::debug!("Skipping unavailable stripe peer {:?}", peer);
            }
        }

        let reachable = remote.len() + usize::from(own_slot.is_some());
        if reachable < k {
            tracing::warn!(
                "Cannot reconstruct {}: {} of {} required peers reachable",
                chunk,
                reachable,
                k
            );
            self.fail_reconstruction(
                &chunk,
                EngineError::InsufficientChunks {
                    available: reachable,
                    required: k,
                }
                .into(),
            );
            return;
        }

        let mut legs = Vec::new();
        for (slot, peer) in remote {
            let origin = self.ctx.handle_for(&peer);
            let leg = ChunkLeg {
                chunk,
                slot,
                lost: lost.clone(),
            };
            match self
                .chunk_get
                .try_insert(PendingIdentifier::new(request_id, request_id, origin), leg)
            {
                Ok(()) => legs.push((slot, peer, origin)),
                Err(e) => tracing::error!("{}", e),
            }
        }
        let asked = legs.len() + usize::from(own_slot.is_some());
        let progress = self.degraded.set_asked(&chunk, asked);
        self.handle_progress(&chunk, lost, progress);

        for (slot, peer, origin) in legs {
            let message = Message::GetChunk {
                request_id,
                list_id: chunk.list_id,
                stripe_id: chunk.stripe_id,
                chunk_id: slot,
                lost_chunk_id: chunk.chunk_id,
            };
            if let Err(e) = self.ctx.send(&peer, message) {
                tracing::warn!("Failed to ask {:?} for slot {}: {}", peer, slot, e);
                if let Ok(entry) = self.chunk_get.erase(request_id, Some(origin)) {
                    self.chunk_leg_failed(entry.payload);
                }
            }
        }

        if let Some(slot) = own_slot {
            let reply = self.chunk_reply(chunk.with_slot(slot), chunk.chunk_id);
            let progress = self
                .degraded
                .record_chunk(&chunk, slot, self.slot_content(slot, reply));
            self.handle_progress(&chunk, lost, progress);
        }
    }

    pub(super) fn handle_chunk_response(&self, from: &NodeId, request_id: u64, reply: ChunkReply) {
        let origin = self.ctx.handle_for(from);
        let leg = match self.chunk_get.erase(request_id, Some(origin)) {
            Ok(entry) => entry.payload,
            Err(e) => {
                tracing::debug!("{}", e);
                return;
            }
        };
        let progress = self
            .degraded
            .record_chunk(&leg.chunk, leg.slot, self.slot_content(leg.slot, reply));
        self.handle_progress(&leg.chunk, &leg.lost, progress);
    }

    pub(super) fn chunk_leg_failed(&self, leg: ChunkLeg) {
        let progress = self.degraded.record_chunk(&leg.chunk, leg.slot, None);
        self.handle_progress(&leg.chunk, &leg.lost, progress);
    }

    /// A slot with nothing sealed yet contributes a zero chunk, and a parity
    /// holder with nothing folded yet a parity still waiting on every slot.
    fn slot_content(&self, slot: u32, reply: ChunkReply) -> Option<SlotContent> {
        let size = self.ctx.config.chunk_size as usize;
        let k = self.coding.data_chunks();
        match reply {
            ChunkReply::Sealed(bytes) => Some(SlotContent::Data(bytes)),
            ChunkReply::Parity {
                bytes,
                pending,
                replicas,
            } => Some(SlotContent::Parity {
                bytes,
                pending,
                replicas,
            }),
            ChunkReply::Empty if (slot as usize) < k => Some(SlotContent::Data(vec![0; size])),
            ChunkReply::Empty => Some(SlotContent::Parity {
                bytes: vec![0; size],
                pending: vec![true; k],
                replicas: Vec::new(),
            }),
            ChunkReply::Unavailable => None,
        }
    }

    fn handle_progress(&self, chunk: &ChunkId, lost: &NodeId, progress: ChunkProgress) {
        match progress {
            ChunkProgress::Waiting | ChunkProgress::Unknown => {}
            ChunkProgress::Ready(slots) => match self.rebuild(chunk, lost, slots) {
                Ok(waiters) => {
                    for op in waiters {
                        let exclusive = op.op != DegradedOpKind::Get;
                        let key = op.key.clone();
                        if !self.serve_degraded(op) && exclusive {
                            self.release_key(&key);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Reconstruction of {} failed: {}", chunk, e);
                    self.fail_reconstruction(chunk, e.into());
                }
            },
            ChunkProgress::Failed {
                available,
                required,
            } => {
                let error = EngineError::InsufficientChunks {
                    available,
                    required,
                };
                tracing::warn!("Reconstruction of {} failed: {}", chunk, error);
                self.fail_reconstruction(chunk, error.into());
            }
        }
    }

    fn rebuild(
        &self,
        chunk: &ChunkId,
        lost: &NodeId,
        slots: Vec<Option<SlotContent>>,
    ) -> Result<Vec<DegradedOp>> {
        let k = self.coding.data_chunks();
        let size = self.ctx.config.chunk_size;
        let rebuilt = match plan_rebuild(slots, chunk.chunk_id as usize, k)? {
            Rebuild::Decode(mut slots) => {
                self.coding.decode(&mut slots)?;
                let bytes = slots
                    .get_mut(chunk.chunk_id as usize)
                    .and_then(Option::take)
                    .ok_or(EngineError::InsufficientChunks {
                        available: 0,
                        required: k,
                    })?;
                Chunk::from_bytes(*chunk, size, false, &bytes, ChunkStatus::Reconstructed)?
            }
            Rebuild::Replicas(records) => {
                tracing::info!(
                    "{} never reached parity, rebuilding {} keys from replicas",
                    chunk,
                    records.len()
                );
                let mut rebuilt = Chunk::new(*chunk, size, false);
                for (key, value) in &records {
                    rebuilt.append_record(key.as_bytes(), value)?;
                }
                // Still open: later writes go to the replicas, not the parity.
                rebuilt.set_status(ChunkStatus::Dirty);
                rebuilt
            }
        };
        self.degraded.install(rebuilt, lost)
    }

    /// Runs one operation against a reconstructed chunk. Returns true when
    /// parity legs now hold the key.
    fn serve_degraded(&self, op: DegradedOp) -> bool {
        let index = self.degraded.index();
        let DegradedOp { key, op, reply, .. } = op;
        match op {
            DegradedOpKind::Get => {
                let result = index
                    .find_value_by_key(&key)
                    .map(|(_, value)| value)
                    .map_err(ErrorCode::from);
                self.ctx.reply(
                    reply.origin,
                    Message::GetResponse {
                        request_id: reply.request_id,
                        key,
                        result,
                    },
                );
                false
            }
            DegradedOpKind::Update { offset, value } => {
                let modification = index.update_value(&key, offset, &value).map(|(location, delta)| {
                    let sealed = index.is_sealed(&location.chunk());
                    let replica = ReplicaOp::Update { offset, value };
                    (location, ParityChange::for_write(sealed, delta, replica))
                });
                self.finish_modification(reply, key, ParityReply::Update, modification)
            }
            DegradedOpKind::Delete => {
                let modification = index.delete_key(&key).map(|(location, delta)| {
                    let sealed = index.is_sealed(&location.chunk());
                    (location, ParityChange::for_write(sealed, delta, ReplicaOp::Delete))
                });
                self.finish_modification(reply, key, ParityReply::Delete, modification)
            }
        }
    }

    fn fail_reconstruction(&self, chunk: &ChunkId, code: ErrorCode) {
        for op in self.degraded.fail(chunk) {
            let DegradedOp { key, op, reply, .. } = op;
            match op {
                DegradedOpKind::Get => self.ctx.reply(
                    reply.origin,
                    Message::GetResponse {
                        request_id: reply.request_id,
                        key,
                        result: Err(code),
                    },
                ),
                DegradedOpKind::Update { .. } => {
                    self.answer_upstream(&key, reply, &ParityReply::Update, Some(code));
                    self.release_key(&key);
                }
                DegradedOpKind::Delete => {
                    self.answer_upstream(&key, reply, &ParityReply::Delete, Some(code));
                    self.release_key(&key);
                }
            }
        }
    }
}

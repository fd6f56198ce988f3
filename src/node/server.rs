use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use super::context::NodeContext;
use super::protocol::{ChunkReply, Envelope, Message};
use super::types::NodeEvent;
use crate::buffer::{DataChunkBuffer, ParityApply, ParityChunkBuffer, ReplicaOp, SealedChunk};
use crate::chunk::{ByteDelta, Chunk, ChunkId, ChunkStatus, KeyLocation, SealRecord, record};
use crate::cluster::types::{NodeId, NodeStatus};
use crate::cluster::Placement;
use crate::coding::CodingEngine;
use crate::degraded::{DegradedMap, DegradedOpKind};
use crate::error::{EngineError, ErrorCode, Result};
use crate::event::EventHandler;
use crate::index::KeyIndex;
use crate::pending::{PendingIdentifier, PendingTable, PendingType, ReplyTo, Settled};
use crate::persistence::Persistence;

/// What to answer upstream once every parity leg of a write returned.
#[derive(Debug, Clone)]
pub(super) enum ParityReply {
    Set(KeyLocation),
    Update,
    Delete,
}

/// What a write tells the parity holders: a byte delta once its chunk is
/// sealed, the write itself while the chunk is open.
#[derive(Debug, Clone)]
pub(super) enum ParityChange {
    Delta(ByteDelta),
    Replica(ReplicaOp),
}

impl ParityChange {
    /// `None` when the write left the chunk bytes unchanged.
    pub(super) fn for_write(sealed: bool, delta: ByteDelta, replica: ReplicaOp) -> Option<Self> {
        if delta.is_noop() {
            return None;
        }
        Some(if sealed {
            ParityChange::Delta(delta)
        } else {
            ParityChange::Replica(replica)
        })
    }
}

#[derive(Debug, Clone)]
pub(super) struct ParityLeg {
    pub key: String,
    pub upstream: ReplyTo,
    pub reply: ParityReply,
}

/// One `GetChunk` request of a reconstruction fan-out.
#[derive(Debug, Clone)]
pub(super) struct ChunkLeg {
    /// The lost chunk being rebuilt.
    pub chunk: ChunkId,
    /// Stripe slot the peer answers for.
    pub slot: u32,
    pub lost: NodeId,
}

/// One `SetChunk` of a release.
#[derive(Debug, Clone)]
pub(super) struct TransferLeg {
    pub upstream: ReplyTo,
    pub total: usize,
}

/// Storage node: data chunk buffers for the lists where it holds a data slot,
/// parity buffers where it holds a parity slot, and the degraded map for the
/// chunks it reconstructs on behalf of unavailable peers.
pub struct ServerNode {
    pub(super) ctx: NodeContext,
    pub(super) coding: Arc<CodingEngine>,
    pub(super) index: KeyIndex,
    data_buffers: HashMap<(u32, u32), DataChunkBuffer>,
    parity_buffers: HashMap<u32, ParityChunkBuffer>,
    pub(super) degraded: DegradedMap,
    persistence: Arc<dyn Persistence>,
    parity_legs: PendingTable<ParityLeg>,
    seal_legs: PendingTable<ChunkId>,
    pub(super) chunk_get: PendingTable<ChunkLeg>,
    pub(super) chunk_set: PendingTable<TransferLeg>,
    /// First failure seen per parity fan-out, reported once the last leg settles.
    failed_fanouts: Mutex<HashMap<u64, ErrorCode>>,
    /// Keys with a write in progress, and the writes parked behind it.
    key_locks: Mutex<HashMap<String, VecDeque<Envelope>>>,
    /// State-changing requests already admitted, by `(request_id, sender)`.
    delivered: PendingTable<&'static str>,
}

impl ServerNode {
    pub fn new(ctx: NodeContext, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let config = ctx.config.clone();
        let coding = Arc::new(CodingEngine::from_config(&config)?);
        let index = KeyIndex::new();
        let k = config.data_chunks as u32;

        let mut data_buffers = HashMap::new();
        let mut parity_buffers = HashMap::new();
        for (list_id, chunk_id) in ctx.placement.lists_for(&ctx.id) {
            if chunk_id < k {
                data_buffers.insert(
                    (list_id, chunk_id),
                    DataChunkBuffer::new(list_id, chunk_id, &config, &index),
                );
            } else {
                parity_buffers.insert(
                    list_id,
                    ParityChunkBuffer::new(
                        list_id,
                        (chunk_id - k) as usize,
                        &config,
                        coding.clone(),
                    ),
                );
            }
        }
        tracing::info!(
            "Server {:?} holds {} data and {} parity positions",
            ctx.id,
            data_buffers.len(),
            parity_buffers.len()
        );

        let lease = config.pending_lease();
        Ok(Self {
            coding,
            index,
            data_buffers,
            parity_buffers,
            degraded: DegradedMap::new(config.data_chunks, config.parity_chunks),
            persistence,
            parity_legs: PendingTable::new(PendingType::ParityUpdate, lease),
            seal_legs: PendingTable::new(PendingType::Seal, lease),
            chunk_get: PendingTable::new(PendingType::ChunkGet, lease),
            chunk_set: PendingTable::new(PendingType::ChunkSet, lease),
            failed_fanouts: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            delivered: PendingTable::new(PendingType::Delivery, lease),
            ctx,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.id
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    pub fn degraded(&self) -> &DegradedMap {
        &self.degraded
    }

    pub fn parity_buffer(&self, list_id: u32) -> Option<&ParityChunkBuffer> {
        self.parity_buffers.get(&list_id)
    }

    /// Outstanding entries across the server's pending tables.
    pub fn pending_len(&self) -> usize {
        self.parity_legs.len() + self.seal_legs.len() + self.chunk_get.len() + self.chunk_set.len()
    }

    pub fn heartbeat(&self) {
        self.ctx.notify(&self.ctx.coordinator, Message::Heartbeat);
    }

    /// Seals every open chunk and announces the seals, empty ones included.
    /// Used on graceful shutdown.
    pub fn seal_open_chunks(&self) -> Result<usize> {
        let mut sealed = 0;
        for buffer in self.data_buffers.values() {
            for chunk in buffer.seal_open_chunks(&self.index)? {
                self.seal_chunk(chunk);
                sealed += 1;
            }
        }
        tracing::info!("Sealed {} open chunks", sealed);
        Ok(sealed)
    }

    /// Writes a sealed chunk to persistence and drops its resident bytes.
    pub fn evict_chunk(&self, id: ChunkId) -> Result<()> {
        let chunk = self
            .index
            .find_chunk_by_id(&id)
            .ok_or(EngineError::ChunkNotResident(id))?;
        let mut guard = chunk.write();
        if !guard.is_sealed() {
            return Err(EngineError::InvalidConfig(format!(
                "chunk {} is still open",
                id
            )));
        }
        self.persistence.write(&guard)?;
        guard.evict();
        tracing::debug!("Evicted chunk {}", id);
        Ok(())
    }

    fn handle_peer(&self, envelope: Envelope) {
        if !self.admit(&envelope) {
            self.fail_request(envelope, ErrorCode::DuplicateRequest);
            return;
        }
        self.dispatch(envelope);
    }

    /// Records a state-changing request on first delivery. A second delivery
    /// of the same `(request_id, sender)` within the lease is refused.
    fn admit(&self, envelope: &Envelope) -> bool {
        let request_id = match &envelope.message {
            Message::Set { request_id, .. }
            | Message::Update { request_id, .. }
            | Message::Delete { request_id, .. }
            | Message::Degraded { request_id, .. }
            | Message::ParityUpdate { request_id, .. }
            | Message::Replicate { request_id, .. }
            | Message::SetChunk { request_id, .. } => *request_id,
            _ => return true,
        };
        let origin = self.ctx.handle_for(&envelope.from);
        let kind = envelope.message.kind();
        match self
            .delivered
            .try_insert(PendingIdentifier::new(request_id, request_id, origin), kind)
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Refusing {} from {:?}: {}", kind, envelope.from, e);
                false
            }
        }
    }

    /// Answers a request without running it.
    fn fail_request(&self, envelope: Envelope, code: ErrorCode) {
        let Envelope { from, message } = envelope;
        let response = match message {
            Message::Set {
                request_id, key, ..
            } => Message::SetResponse {
                request_id,
                key,
                result: Err(code),
            },
            Message::Update {
                request_id, key, ..
            }
            | Message::Degraded {
                request_id,
                key,
                op: DegradedOpKind::Update { .. },
                ..
            } => Message::UpdateResponse {
                request_id,
                key,
                result: Err(code),
            },
            Message::Delete { request_id, key }
            | Message::Degraded {
                request_id,
                key,
                op: DegradedOpKind::Delete,
                ..
            } => Message::DeleteResponse {
                request_id,
                key,
                result: Err(code),
            },
            Message::Degraded {
                request_id,
                key,
                op: DegradedOpKind::Get,
                ..
            } => Message::GetResponse {
                request_id,
                key,
                result: Err(code),
            },
            Message::ParityUpdate { request_id, .. } => Message::ParityUpdateResponse {
                request_id,
                result: Err(code),
            },
            Message::Replicate { request_id, .. } => Message::ReplicateResponse {
                request_id,
                result: Err(code),
            },
            Message::SetChunk { request_id, .. } => Message::SetChunkResponse {
                request_id,
                result: Err(code),
            },
            other => {
                tracing::warn!("No failure response for {}", other.kind());
                return;
            }
        };
        self.ctx.notify(&from, response);
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            Message::Get { request_id, key } => self.handle_get(&from, request_id, key),
            message @ (Message::Set { .. }
            | Message::Update { .. }
            | Message::Delete { .. }
            | Message::Degraded { .. }) => self.handle_keyed(Envelope { from, message }),
            Message::Seal {
                request_id,
                list_id,
                stripe_id,
                chunk_id,
                bytes,
                records,
            } => self.handle_seal(
                &from,
                request_id,
                ChunkId::new(list_id, stripe_id, chunk_id),
                &bytes,
                records,
            ),
            Message::SealResponse { request_id, result } => {
                let origin = self.ctx.handle_for(&from);
                match self.seal_legs.erase(request_id, Some(origin)) {
                    Ok(entry) => {
                        if let Err(code) = result {
                            tracing::warn!(
                                "Seal of {} rejected by {:?}: {}",
                                entry.payload,
                                from,
                                code
                            );
                        }
                    }
                    Err(e) => tracing::debug!("{}", e),
                }
            }
            Message::ParityUpdate {
                request_id,
                list_id,
                stripe_id,
                chunk_id,
                key,
                offset,
                delta,
            } => self.handle_parity_update(
                &from,
                request_id,
                ChunkId::new(list_id, stripe_id, chunk_id),
                &key,
                offset,
                &delta,
            ),
            Message::Replicate {
                request_id,
                list_id,
                stripe_id,
                chunk_id,
                key,
                op,
            } => {
                let result = self
                    .handle_replicate(ChunkId::new(list_id, stripe_id, chunk_id), &key, &op)
                    .map_err(ErrorCode::from);
                self.ctx
                    .notify(&from, Message::ReplicateResponse { request_id, result });
            }
            Message::ParityUpdateResponse { request_id, result }
            | Message::ReplicateResponse { request_id, result } => {
                let origin = self.ctx.handle_for(&from);
                match self.parity_legs.erase_leg(request_id, origin) {
                    Ok(settled) => self.settle_parity(settled, result),
                    Err(e) => tracing::debug!("{}", e),
                }
            }
            Message::GetChunk {
                request_id,
                list_id,
                stripe_id,
                chunk_id,
                lost_chunk_id,
            } => {
                let reply =
                    self.chunk_reply(ChunkId::new(list_id, stripe_id, chunk_id), lost_chunk_id);
                self.ctx
                    .notify(&from, Message::GetChunkResponse { request_id, reply });
            }
            Message::GetChunkResponse { request_id, reply } => {
                self.handle_chunk_response(&from, request_id, reply)
            }
            Message::SetChunk { request_id, chunks } => {
                let result = self.install_transferred(chunks).map_err(ErrorCode::from);
                self.ctx
                    .notify(&from, Message::SetChunkResponse { request_id, result });
            }
            Message::SetChunkResponse { request_id, result } => {
                self.handle_transfer_response(&from, request_id, result)
            }
            Message::ReleaseDegraded { request_id, node } => {
                self.release_degraded(&from, request_id, &node)
            }
            Message::NodeStatus {
                node,
                status,
                incarnation,
            } => {
                if self.ctx.view.apply(&node, status, incarnation)
                    && status == NodeStatus::Unavailable
                {
                    self.peer_lost(&node);
                }
            }
            other => tracing::warn!("Server ignoring unexpected {}", other.kind()),
        }
    }

    // --- Normal operations ---

    fn handle_get(&self, from: &NodeId, request_id: u64, key: String) {
        let result = self
            .resident(|| self.index.find_value_by_key(&key))
            .map(|(_, value)| value)
            .map_err(ErrorCode::from);
        self.ctx.notify(
            from,
            Message::GetResponse {
                request_id,
                key,
                result,
            },
        );
    }

    /// Writes to one key are serialised: while a write holds the key, later
    /// ones are parked and resumed once it completes.
    fn handle_keyed(&self, envelope: Envelope) {
        let (key, exclusive) = match &envelope.message {
            Message::Set { key, .. } | Message::Update { key, .. } | Message::Delete { key, .. } => {
                (key.clone(), true)
            }
            Message::Degraded { key, op, .. } => (key.clone(), *op != DegradedOpKind::Get),
            _ => return,
        };
        if !exclusive {
            self.handle_degraded(envelope);
            return;
        }
        if !self.claim_key(&key, &envelope) {
            tracing::debug!("Parking {} on busy key {:?}", envelope.message.kind(), key);
            return;
        }

        let held = match envelope.message {
            Message::Degraded { .. } => self.handle_degraded(envelope),
            _ => self.handle_write(&envelope.from, envelope.message),
        };
        if !held {
            self.release_key(&key);
        }
    }

    /// Runs a SET/UPDATE/DELETE. Returns true when parity legs now hold the key.
    fn handle_write(&self, from: &NodeId, message: Message) -> bool {
        let origin = self.ctx.handle_for(from);
        match message {
            Message::Set {
                request_id,
                key,
                value,
            } => {
                let upstream = ReplyTo { origin, request_id };
                let outcome = self
                    .data_buffer_for(&key)
                    .and_then(|buffer| buffer.set(&self.index, &key, &value));
                match outcome {
                    Ok(outcome) => {
                        let location = outcome.location;
                        let sealed_now = outcome
                            .sealed
                            .iter()
                            .any(|sealed| sealed.id == location.chunk());
                        for sealed in outcome.sealed {
                            self.seal_chunk(sealed);
                        }
                        let change = match outcome.parity_delta {
                            Some(delta) => Some(ParityChange::Delta(delta)),
                            // The seal carried the record.
                            None if sealed_now => None,
                            None => Some(ParityChange::Replica(ReplicaOp::Set(value))),
                        };
                        if let Some(change) = change {
                            return self.fan_out_parity(
                                location,
                                &key,
                                change,
                                upstream,
                                ParityReply::Set(location),
                            );
                        }
                        self.ctx.reply(
                            origin,
                            Message::SetResponse {
                                request_id,
                                key,
                                result: Ok(location),
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!("SET {:?} failed: {}", key, e);
                        self.ctx.reply(
                            origin,
                            Message::SetResponse {
                                request_id,
                                key,
                                result: Err(e.into()),
                            },
                        );
                    }
                }
                false
            }
            Message::Update {
                request_id,
                key,
                offset,
                value,
            } => {
                let modification = self.data_buffer_for(&key).and_then(|buffer| {
                    self.resident(|| buffer.update(&self.index, &key, offset, &value))
                });
                let modification = modification.map(|m| {
                    let replica = ReplicaOp::Update { offset, value };
                    (m.location, ParityChange::for_write(m.sealed, m.delta, replica))
                });
                self.finish_modification(
                    ReplyTo { origin, request_id },
                    key,
                    ParityReply::Update,
                    modification,
                )
            }
            Message::Delete { request_id, key } => {
                let modification = self
                    .data_buffer_for(&key)
                    .and_then(|buffer| self.resident(|| buffer.delete(&self.index, &key)));
                self.finish_modification(
                    ReplyTo { origin, request_id },
                    key,
                    ParityReply::Delete,
                    modification.map(|m| {
                        (m.location, ParityChange::for_write(m.sealed, m.delta, ReplicaOp::Delete))
                    }),
                )
            }
            other => {
                tracing::warn!("Not a write: {}", other.kind());
                false
            }
        }
    }

    /// Answers an UPDATE/DELETE, or fans its parity change out first.
    pub(super) fn finish_modification(
        &self,
        upstream: ReplyTo,
        key: String,
        reply: ParityReply,
        modification: Result<(KeyLocation, Option<ParityChange>)>,
    ) -> bool {
        match modification {
            Ok((location, Some(change))) => {
                self.fan_out_parity(location, &key, change, upstream, reply)
            }
            Ok((_, None)) => {
                self.answer_upstream(&key, upstream, &reply, None);
                false
            }
            Err(e) => {
                tracing::warn!("Modification of {:?} failed: {}", key, e);
                self.answer_upstream(&key, upstream, &reply, Some(e.into()));
                false
            }
        }
    }

    fn data_buffer_for(&self, key: &str) -> Result<&DataChunkBuffer> {
        let placement = self.ctx.placement.place(key);
        self.data_buffers
            .get(&(placement.list_id, placement.chunk_id))
            .ok_or_else(|| self.ctx.not_owner(format!("key {:?}", key)))
    }

    /// Runs `op`, faulting the chunk back in from persistence once if it was evicted.
    fn resident<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        match op() {
            Err(EngineError::ChunkNotResident(id)) => {
                self.fault_in(id)?;
                op()
            }
            result => result,
        }
    }

    fn fault_in(&self, id: ChunkId) -> Result<()> {
        let chunk = self
            .index
            .find_chunk_by_id(&id)
            .ok_or(EngineError::ChunkNotResident(id))?;
        let image = self
            .persistence
            .read(id, false)?
            .ok_or_else(|| EngineError::Persistence(format!("chunk {} was never persisted", id)))?;
        let mut guard = chunk.write();
        if !guard.is_resident() {
            guard.load(image.data()?)?;
            tracing::info!("Faulted in chunk {} from persistence", id);
        }
        Ok(())
    }

    fn claim_key(&self, key: &str, envelope: &Envelope) -> bool {
        let mut locks = self.key_locks.lock();
        match locks.get_mut(key) {
            Some(parked) => {
                parked.push_back(envelope.clone());
                false
            }
            None => {
                locks.insert(key.to_string(), VecDeque::new());
                true
            }
        }
    }

    pub(super) fn release_key(&self, key: &str) {
        let parked = self.key_locks.lock().remove(key).unwrap_or_default();
        for envelope in parked {
            if let Err(e) = self.ctx.resume(envelope.clone()) {
                tracing::error!(
                    "Failed to resume parked {} on {:?}: {}",
                    envelope.message.kind(),
                    key,
                    e
                );
                self.fail_request(envelope, e.into());
            }
        }
    }

    // --- Seal and parity fan-out ---

    fn seal_chunk(&self, sealed: SealedChunk) {
        let id = sealed.id;
        if let Err(e) = self.persistence.write(&sealed.chunk.read()) {
            tracing::error!("Failed to persist sealed chunk {}: {}", id, e);
        }
        let Some(list) = self.ctx.placement.list(id.list_id) else {
            return;
        };
        for peer in &list.parity_peers {
            if !self.ctx.view.is_normal(peer) {
                tracing::warn!("Parity holder {:?} unavailable, seal of {} not delivered", peer, id);
                continue;
            }
            let request_id = self.ctx.next_request_id();
            let origin = self.ctx.handle_for(peer);
            if let Err(e) = self
                .seal_legs
                .try_insert(PendingIdentifier::new(request_id, request_id, origin), id)
            {
                tracing::error!("{}", e);
                continue;
            }
            let message = Message::Seal {
                request_id,
                list_id: id.list_id,
                stripe_id: id.stripe_id,
                chunk_id: id.chunk_id,
                bytes: sealed.bytes.clone(),
                records: sealed.records.clone(),
            };
            if let Err(e) = self.ctx.send(peer, message) {
                tracing::warn!("Failed to send seal of {} to {:?}: {}", id, peer, e);
                if let Err(e) = self.seal_legs.erase(request_id, Some(origin)) {
                    tracing::debug!("{}", e);
                }
            }
        }
    }

    /// Sends the change to every healthy parity holder of the list. Returns
    /// true when legs are in flight; the last one to settle answers upstream.
    pub(super) fn fan_out_parity(
        &self,
        location: KeyLocation,
        key: &str,
        change: ParityChange,
        upstream: ReplyTo,
        reply: ParityReply,
    ) -> bool {
        let peers = self
            .ctx
            .placement
            .list(location.list_id)
            .map(|list| list.parity_peers)
            .unwrap_or_default();
        let request_id = self.ctx.next_request_id();

        let mut legs = Vec::new();
        for peer in peers {
            if !self.ctx.view.is_normal(&peer) {
                tracing::warn!(
                    "Parity holder {:?} unavailable, update of {:?} not propagated",
                    peer,
                    key
                );
                continue;
            }
            let origin = self.ctx.handle_for(&peer);
            let leg = ParityLeg {
                key: key.to_string(),
                upstream,
                reply: reply.clone(),
            };
            let id = PendingIdentifier::new(request_id, upstream.request_id, origin);
            if self.parity_legs.try_insert(id, leg).is_err() {
                let error = EngineError::PendingMapInsertFailure {
                    kind: PendingType::ParityUpdate,
                    request_id,
                };
                tracing::error!("{}", error);
                self.record_failure(request_id, error.into());
                continue;
            }
            legs.push((peer, origin));
        }

        if legs.is_empty() {
            let failure = self.failed_fanouts.lock().remove(&request_id);
            self.answer_upstream(key, upstream, &reply, failure);
            return false;
        }

        for (peer, origin) in legs {
            let message = match &change {
                ParityChange::Delta(delta) => Message::ParityUpdate {
                    request_id,
                    list_id: location.list_id,
                    stripe_id: location.stripe_id,
                    chunk_id: location.chunk_id,
                    key: key.to_string(),
                    offset: delta.offset,
                    delta: delta.bytes.clone(),
                },
                ParityChange::Replica(op) => Message::Replicate {
                    request_id,
                    list_id: location.list_id,
                    stripe_id: location.stripe_id,
                    chunk_id: location.chunk_id,
                    key: key.to_string(),
                    op: op.clone(),
                },
            };
            if let Err(e) = self.ctx.send(&peer, message) {
                tracing::warn!("Failed to send parity change to {:?}: {}", peer, e);
                if let Ok(settled) = self.parity_legs.erase_leg(request_id, origin) {
                    self.settle_parity(settled, Err(e.into()));
                }
            }
        }
        true
    }

    fn record_failure(&self, request_id: u64, code: ErrorCode) {
        self.failed_fanouts.lock().entry(request_id).or_insert(code);
    }

    fn settle_parity(&self, settled: Settled<ParityLeg>, result: std::result::Result<(), ErrorCode>) {
        let request_id = settled.entry.id.request_id;
        match result {
            // A redelivery; the first copy was applied.
            Err(ErrorCode::DuplicateRequest) | Ok(()) => {}
            Err(code) => self.record_failure(request_id, code),
        }
        if !settled.is_last() {
            return;
        }
        let failure = self.failed_fanouts.lock().remove(&request_id);
        let leg = settled.entry.payload;
        self.answer_upstream(&leg.key, leg.upstream, &leg.reply, failure);
        self.release_key(&leg.key);
    }

    pub(super) fn answer_upstream(
        &self,
        key: &str,
        upstream: ReplyTo,
        reply: &ParityReply,
        failure: Option<ErrorCode>,
    ) {
        let request_id = upstream.request_id;
        let key = key.to_string();
        let message = match reply {
            ParityReply::Set(location) => Message::SetResponse {
                request_id,
                key,
                result: failure.map_or(Ok(*location), Err),
            },
            ParityReply::Update => Message::UpdateResponse {
                request_id,
                key,
                result: failure.map_or(Ok(()), Err),
            },
            ParityReply::Delete => Message::DeleteResponse {
                request_id,
                key,
                result: failure.map_or(Ok(()), Err),
            },
        };
        self.ctx.reply(upstream.origin, message);
    }

    // --- Parity holder ---

    fn handle_seal(
        &self,
        from: &NodeId,
        request_id: u64,
        chunk: ChunkId,
        bytes: &[u8],
        records: Vec<SealRecord>,
    ) {
        let result = match self.parity_buffers.get(&chunk.list_id) {
            Some(buffer) => buffer.seal(chunk.stripe_id, chunk.chunk_id, bytes, records),
            None => Err(self.ctx.not_owner(format!("parity of list {}", chunk.list_id))),
        };
        match result {
            Ok(replayed) => {
                self.ctx
                    .notify(from, Message::SealResponse { request_id, result: Ok(()) });
                for update in replayed {
                    self.ctx.reply(
                        update.reply_to.origin,
                        Message::ParityUpdateResponse {
                            request_id: update.reply_to.request_id,
                            result: Ok(()),
                        },
                    );
                }
            }
            Err(e) => {
                tracing::warn!("Seal of {} failed: {}", chunk, e);
                self.ctx.notify(
                    from,
                    Message::SealResponse {
                        request_id,
                        result: Err(e.into()),
                    },
                );
            }
        }
    }

    fn handle_parity_update(
        &self,
        from: &NodeId,
        request_id: u64,
        chunk: ChunkId,
        key: &str,
        offset: u32,
        delta: &[u8],
    ) {
        let origin = self.ctx.handle_for(from);
        let result = match self.parity_buffers.get(&chunk.list_id) {
            Some(buffer) => buffer.update(
                chunk.stripe_id,
                chunk.chunk_id,
                key,
                offset,
                delta,
                ReplyTo { origin, request_id },
            ),
            None => Err(self.ctx.not_owner(format!("parity of list {}", chunk.list_id))),
        };
        let result = match result {
            Ok(ParityApply::Deferred) => return,
            Ok(ParityApply::Applied) => Ok(()),
            Err(e) => Err(ErrorCode::from(e)),
        };
        self.ctx
            .notify(from, Message::ParityUpdateResponse { request_id, result });
    }

    fn handle_replicate(&self, chunk: ChunkId, key: &str, op: &ReplicaOp) -> Result<()> {
        let buffer = self
            .parity_buffers
            .get(&chunk.list_id)
            .ok_or_else(|| self.ctx.not_owner(format!("parity of list {}", chunk.list_id)))?;
        buffer.replicate(chunk.stripe_id, chunk.chunk_id, key, op)
    }

    /// What this node holds at a stripe coordinate. Open data chunks have not
    /// reached parity yet, so they count as zero. A parity holder attaches
    /// its replicas of data chunk `lost`.
    pub(super) fn chunk_reply(&self, id: ChunkId, lost: u32) -> ChunkReply {
        if (id.chunk_id as usize) >= self.coding.data_chunks() {
            return match self.parity_buffers.get(&id.list_id) {
                Some(buffer) => match buffer.snapshot(id.stripe_id, lost) {
                    Some(snapshot) => ChunkReply::Parity {
                        bytes: snapshot.bytes,
                        pending: snapshot.pending,
                        replicas: snapshot.replicas,
                    },
                    None => ChunkReply::Empty,
                },
                None => ChunkReply::Unavailable,
            };
        }

        let Some(chunk) = self.index.find_chunk_by_id(&id) else {
            return ChunkReply::Empty;
        };
        if !chunk.read().is_sealed() {
            return ChunkReply::Empty;
        }
        match self.resident(|| Ok(chunk.read().data()?.to_vec())) {
            Ok(bytes) => ChunkReply::Sealed(bytes),
            Err(e) => {
                tracing::error!("Cannot read chunk {} for reconstruction: {}", id, e);
                ChunkReply::Unavailable
            }
        }
    }

    // --- Release and chunk transfer ---

    /// Hands every chunk reconstructed for `node` back to it in one transfer.
    fn release_degraded(&self, from: &NodeId, request_id: u64, node: &NodeId) {
        let origin = self.ctx.handle_for(from);
        let upstream = ReplyTo { origin, request_id };
        let mut chunks = Vec::new();
        for chunk in self.degraded.drain_for_node(node) {
            let guard = chunk.read();
            match guard.data() {
                Ok(bytes) => chunks.push((guard.id(), bytes.to_vec())),
                Err(e) => tracing::error!("Reconstructed chunk {} unreadable: {}", guard.id(), e),
            }
        }
        if chunks.is_empty() {
            self.answer_release(TransferLeg { upstream, total: 0 }, 0);
            return;
        }

        tracing::info!("Releasing {} reconstructed chunks to {:?}", chunks.len(), node);
        let target = self.ctx.handle_for(node);
        let leg_id = self.ctx.next_request_id();
        let leg = TransferLeg {
            upstream,
            total: chunks.len(),
        };
        if let Err(e) = self
            .chunk_set
            .try_insert(PendingIdentifier::new(leg_id, request_id, target), leg.clone())
        {
            tracing::error!("{}", e);
            self.answer_release(leg, 0);
            return;
        }
        let message = Message::SetChunk {
            request_id: leg_id,
            chunks,
        };
        if let Err(e) = self.ctx.send(node, message) {
            tracing::error!("Failed to hand chunks back to {:?}: {}", node, e);
            if let Ok(entry) = self.chunk_set.erase(leg_id, Some(target)) {
                self.answer_release(entry.payload, 0);
            }
        }
    }

    fn handle_transfer_response(
        &self,
        from: &NodeId,
        request_id: u64,
        result: std::result::Result<usize, ErrorCode>,
    ) {
        if result == Err(ErrorCode::DuplicateRequest) {
            tracing::debug!("{:?} already received transfer {}", from, request_id);
            return;
        }
        let origin = self.ctx.handle_for(from);
        match self.chunk_set.erase(request_id, Some(origin)) {
            Ok(entry) => {
                let installed = match result {
                    Ok(installed) => installed,
                    Err(code) => {
                        tracing::error!("{:?} rejected transferred chunks: {}", from, code);
                        0
                    }
                };
                self.answer_release(entry.payload, installed);
            }
            Err(e) => tracing::debug!("{}", e),
        }
    }

    fn answer_release(&self, leg: TransferLeg, installed: usize) {
        if installed < leg.total {
            tracing::warn!(
                "Release handed back {} of {} reconstructed chunks",
                installed,
                leg.total
            );
        }
        self.ctx.reply(
            leg.upstream.origin,
            Message::ReleaseDegradedResponse {
                request_id: leg.upstream.request_id,
                count: installed,
            },
        );
    }

    /// Installs chunks handed back after this node recovered. An open local
    /// chunk stays open and takes over the writes made to the image.
    fn install_transferred(&self, chunks: Vec<(ChunkId, Vec<u8>)>) -> Result<usize> {
        let mut installed = 0;
        for (id, bytes) in chunks {
            let Some(buffer) = self.data_buffers.get(&(id.list_id, id.chunk_id)) else {
                return Err(self.ctx.not_owner(format!("chunk {}", id)));
            };
            if let Some(local) = self.index.find_chunk_by_id(&id)
                && !local.read().is_sealed()
            {
                self.reconcile_open(buffer, id, &bytes)?;
                installed += 1;
                continue;
            }
            let chunk = Chunk::from_bytes(
                id,
                self.ctx.config.chunk_size,
                false,
                &bytes,
                ChunkStatus::Sealed,
            )?;
            let shared = self.index.install_chunk(chunk)?;
            self.persistence.write(&shared.read())?;
            tracing::info!("Installed transferred chunk {}", id);
            installed += 1;
        }
        Ok(installed)
    }

    /// Applies to an open local chunk what happened to its keys while it was
    /// served from replicas: deleted keys go, updated values are copied over.
    fn reconcile_open(&self, buffer: &DataChunkBuffer, id: ChunkId, image: &[u8]) -> Result<()> {
        let rebuilt: HashMap<String, Vec<u8>> = record::records(image)
            .map(|(_, record)| {
                (
                    String::from_utf8_lossy(record.key).into_owned(),
                    record.value.to_vec(),
                )
            })
            .collect();
        let local = self
            .index
            .find_chunk_by_id(&id)
            .ok_or(EngineError::ChunkNotResident(id))?;
        let records = local.read().seal_records()?;

        let (mut deleted, mut updated) = (0, 0);
        for record in &records {
            match rebuilt.get(&record.key) {
                None => {
                    buffer.delete(&self.index, &record.key)?;
                    deleted += 1;
                }
                Some(value) => {
                    let (_, current) = self.index.find_value_by_key(&record.key)?;
                    if current != *value {
                        buffer.update(&self.index, &record.key, 0, value)?;
                        updated += 1;
                    }
                }
            }
        }
        let unknown = rebuilt
            .keys()
            .filter(|key| !records.iter().any(|record| &record.key == *key))
            .count();
        if unknown > 0 {
            tracing::warn!("{} keys in the image of {} are unknown locally", unknown, id);
        }
        tracing::info!(
            "Reconciled open chunk {}: {} deleted, {} updated",
            id,
            deleted,
            updated
        );
        Ok(())
    }

    // --- Failure handling ---

    /// A peer went down: every leg waiting on it fails now.
    fn peer_lost(&self, node: &NodeId) {
        let origin = self.ctx.forget(node);
        for settled in self.parity_legs.drain_origin(origin) {
            self.settle_parity(settled, Err(ErrorCode::NodeUnavailable));
        }
        let seals = self.seal_legs.drain_origin(origin);
        if !seals.is_empty() {
            tracing::warn!("{} seals to {:?} left unacknowledged", seals.len(), node);
        }
        for settled in self.chunk_get.drain_origin(origin) {
            self.chunk_leg_failed(settled.entry.payload);
        }
        for settled in self.chunk_set.drain_origin(origin) {
            self.answer_release(settled.entry.payload, 0);
        }
    }

    fn reap(&self, now: Instant) {
        for settled in self.parity_legs.reap_expired(now) {
            self.settle_parity(settled, Err(ErrorCode::Timeout));
        }
        self.seal_legs.reap_expired(now);
        for settled in self.chunk_get.reap_expired(now) {
            self.chunk_leg_failed(settled.entry.payload);
        }
        for settled in self.chunk_set.reap_expired(now) {
            self.answer_release(settled.entry.payload, 0);
        }
        self.delivered.reap_expired(now);
    }
}

impl EventHandler<NodeEvent> for ServerNode {
    fn handle(&self, event: NodeEvent) {
        match event {
            NodeEvent::Client { reply, .. } => {
                let _ = reply.send(Err(ErrorCode::NotOwner));
            }
            NodeEvent::Peer(envelope) => self.handle_peer(envelope),
            NodeEvent::Resumed(envelope) => self.dispatch(envelope),
            NodeEvent::Reap => self.reap(Instant::now()),
        }
    }
}

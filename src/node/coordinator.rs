use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

use super::context::NodeContext;
use super::protocol::{Envelope, Message};
use super::types::NodeEvent;
use crate::chunk::{ChunkId, KeyLocation};
use crate::cluster::Placement;
use crate::cluster::types::{NodeId, NodeStatus};
use crate::degraded::DegradedLockResult;
use crate::error::{ErrorCode, Result};
use crate::event::EventHandler;
use crate::pending::{PendingIdentifier, PendingTable, PendingType, Settled};

/// Who rebuilds a lost chunk, and for which node.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DegradedLock {
    reconstructor: NodeId,
    lost: NodeId,
}

/// Membership authority and degraded-lock service.
///
/// The first degraded request for a chunk coordinate picks a healthy peer of
/// the stripe as its reconstructor; every later request for the same chunk
/// is sent to that peer until the lost node recovers and the chunk is handed
/// back.
pub struct CoordinatorNode {
    ctx: NodeContext,
    locks: Mutex<HashMap<ChunkId, DegradedLock>>,
    /// Chunks already handed back, and the node now holding them.
    remapped: Mutex<HashMap<ChunkId, NodeId>>,
    /// One `ReleaseDegraded` leg per reconstructor; payload is the recovering node.
    releases: PendingTable<NodeId>,
}

impl CoordinatorNode {
    pub fn new(ctx: NodeContext) -> Self {
        let lease = ctx.config.pending_lease();
        Self {
            ctx,
            locks: Mutex::new(HashMap::new()),
            remapped: Mutex::new(HashMap::new()),
            releases: PendingTable::new(PendingType::Release, lease),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.id
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Resolves a degraded request for the chunk behind `location`.
    pub fn acquire(&self, location: &KeyLocation, lost: &NodeId) -> DegradedLockResult {
        let chunk = location.chunk();
        let Some(peers) = self.ctx.placement.list(chunk.list_id) else {
            return DegradedLockResult::NotExist;
        };
        if self.ctx.view.is_normal(lost) {
            return match self.remapped.lock().get(&chunk) {
                Some(target) => DegradedLockResult::Remapped {
                    target: target.clone(),
                },
                None => DegradedLockResult::NotLocked,
            };
        }

        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(&chunk) {
            return DegradedLockResult::WasLocked {
                reconstructor: lock.reconstructor.clone(),
            };
        }
        let candidate = peers
            .slots()
            .find(|(slot, peer)| {
                *slot != chunk.chunk_id && *peer != lost && self.ctx.view.is_normal(peer)
            })
            .map(|(_, peer)| peer.clone());
        let Some(reconstructor) = candidate else {
            tracing::warn!("No healthy peer left to reconstruct {}", chunk);
            return DegradedLockResult::NotExist;
        };
        tracing::info!(
            "Degraded lock on {} for {:?} granted to {:?}",
            chunk,
            lost,
            reconstructor
        );
        locks.insert(
            chunk,
            DegradedLock {
                reconstructor: reconstructor.clone(),
                lost: lost.clone(),
            },
        );
        DegradedLockResult::IsLocked { reconstructor }
    }

    pub fn fail_node(&self, node: &NodeId) -> Result<()> {
        self.change_status(node, NodeStatus::Unavailable)
    }

    pub fn overload_node(&self, node: &NodeId) -> Result<()> {
        self.change_status(node, NodeStatus::Overloaded)
    }

    /// Starts handing reconstructed chunks back to `node`. The node turns
    /// `Normal` once every reconstructor acknowledged its release.
    pub fn recover_node(&self, node: &NodeId) -> Result<()> {
        let reconstructors: Vec<NodeId> = {
            let locks = self.locks.lock();
            let mut holders: Vec<NodeId> = locks
                .values()
                .filter(|lock| &lock.lost == node)
                .map(|lock| lock.reconstructor.clone())
                .collect();
            holders.sort();
            holders.dedup();
            holders
        };
        if reconstructors.is_empty() {
            self.restore(node);
            return Ok(());
        }

        let request_id = self.ctx.next_request_id();
        tracing::info!(
            "Releasing degraded chunks of {:?} from {} reconstructors",
            node,
            reconstructors.len()
        );
        for reconstructor in &reconstructors {
            let origin = self.ctx.handle_for(reconstructor);
            self.releases.try_insert(
                PendingIdentifier::new(request_id, request_id, origin),
                node.clone(),
            )?;
        }
        for reconstructor in &reconstructors {
            let message = Message::ReleaseDegraded {
                request_id,
                node: node.clone(),
            };
            if let Err(e) = self.ctx.send(reconstructor, message) {
                tracing::warn!("Release to {:?} failed: {}", reconstructor, e);
                let origin = self.ctx.handle_for(reconstructor);
                if let Ok(settled) = self.releases.erase_leg(request_id, origin) {
                    self.settle_release(settled);
                }
            }
        }
        Ok(())
    }

    fn change_status(&self, node: &NodeId, status: NodeStatus) -> Result<()> {
        let incarnation = self
            .ctx
            .view
            .set_status(node, status)
            .ok_or_else(|| self.ctx.not_owner(format!("member {:?}", node)))?;
        self.remapped.lock().retain(|_, target| target != node);
        self.broadcast(node, status, incarnation);
        Ok(())
    }

    fn broadcast(&self, node: &NodeId, status: NodeStatus, incarnation: u64) {
        for member in self.ctx.view.members() {
            if member.id == self.ctx.id {
                continue;
            }
            self.ctx.notify(
                &member.id,
                Message::NodeStatus {
                    node: node.clone(),
                    status,
                    incarnation,
                },
            );
        }
    }

    fn settle_release(&self, settled: Settled<NodeId>) {
        if settled.is_last() {
            self.restore(&settled.entry.payload);
        }
    }

    /// Marks the node normal again and drops its locks, remembering that
    /// its chunks now live on it.
    fn restore(&self, node: &NodeId) {
        if let Err(e) = self.change_status(node, NodeStatus::Normal) {
            tracing::error!("Failed to restore {:?}: {}", node, e);
            return;
        }
        let mut locks = self.locks.lock();
        let mut remapped = self.remapped.lock();
        locks.retain(|chunk, lock| {
            if &lock.lost != node {
                return true;
            }
            remapped.insert(*chunk, node.clone());
            false
        });
    }

    fn handle_peer(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        self.ctx.view.touch(&from, Instant::now());
        match message {
            Message::DegradedLock {
                request_id,
                location,
                key,
                lost,
            } => {
                let result = self.acquire(&location, &lost);
                tracing::debug!("Degraded lock for {:?}: {:?}", key, result);
                self.ctx
                    .notify(&from, Message::DegradedLockResponse { request_id, result });
            }
            Message::ReleaseDegradedResponse { request_id, count } => {
                let origin = self.ctx.handle_for(&from);
                match self.releases.erase_leg(request_id, origin) {
                    Ok(settled) => {
                        tracing::info!(
                            "{:?} handed back {} chunks of {:?}",
                            from,
                            count,
                            settled.entry.payload
                        );
                        self.settle_release(settled);
                    }
                    Err(e) => tracing::debug!("{}", e),
                }
            }
            Message::Heartbeat => {}
            other => tracing::warn!("Coordinator ignoring unexpected {}", other.kind()),
        }
    }

    fn reap(&self, now: Instant) {
        for settled in self.releases.reap_expired(now) {
            tracing::warn!("Release of {:?} timed out", settled.entry.payload);
            self.settle_release(settled);
        }
        let timeout = self.ctx.config.failure_timeout();
        for (node, incarnation) in self.ctx.view.expire(now, timeout) {
            self.remapped.lock().retain(|_, target| target != &node);
            self.broadcast(&node, NodeStatus::Unavailable, incarnation);
        }
    }
}

impl EventHandler<NodeEvent> for CoordinatorNode {
    fn handle(&self, event: NodeEvent) {
        match event {
            NodeEvent::Client { reply, .. } => {
                let _ = reply.send(Err(ErrorCode::NotOwner));
            }
            NodeEvent::Peer(envelope) | NodeEvent::Resumed(envelope) => self.handle_peer(envelope),
            NodeEvent::Reap => self.reap(Instant::now()),
        }
    }
}

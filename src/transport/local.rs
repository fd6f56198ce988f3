use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Transport, deliver};
use crate::cluster::types::NodeId;
use crate::error::{EngineError, Result};
use crate::event::EventQueue;
use crate::node::protocol::{Envelope, Message};
use crate::node::types::NodeEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: &'static str,
}

/// Routes messages between nodes living in the same process.
///
/// Every send is appended to a log so callers can count fan-outs. A node
/// switched down neither receives nor sends.
#[derive(Default)]
pub struct LocalTransport {
    queues: DashMap<NodeId, Arc<EventQueue<NodeEvent>>>,
    down: DashSet<NodeId>,
    log: Mutex<Vec<SentMessage>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, node: NodeId, queue: Arc<EventQueue<NodeEvent>>) {
        self.queues.insert(node, queue);
    }

    pub fn set_down(&self, node: &NodeId, down: bool) {
        if down {
            self.down.insert(node.clone());
        } else {
            self.down.remove(node);
        }
    }

    pub fn is_down(&self, node: &NodeId) -> bool {
        self.down.contains(node)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.log.lock().clone()
    }

    /// Messages of `kind` sent so far.
    pub fn count(&self, kind: &str) -> usize {
        self.log.lock().iter().filter(|m| m.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl Transport for LocalTransport {
    fn send(&self, from: &NodeId, to: &NodeId, message: Message) -> Result<()> {
        if self.is_down(from) || self.is_down(to) {
            tracing::debug!("Dropping {} from {:?} to {:?}: node down", message.kind(), from, to);
            return Err(EngineError::NodeUnavailable(to.clone()));
        }
        let queue = self
            .queues
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::NodeUnavailable(to.clone()))?;

        self.log.lock().push(SentMessage {
            from: from.clone(),
            to: to.clone(),
            kind: message.kind(),
        });
        deliver(
            &queue,
            Envelope {
                from: from.clone(),
                message,
            },
        )
    }
}

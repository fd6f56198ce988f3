use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::types::{Node, NodeId, NodeRole, NodeStatus};

/// Concurrent member table shared by every component of a node.
#[derive(Debug, Default)]
pub struct ClusterView {
    members: DashMap<NodeId, Node>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let view = Self::new();
        for node in nodes {
            view.register(node);
        }
        view
    }

    pub fn register(&self, node: Node) {
        tracing::debug!("Registering {:?} as {:?}", node.id, node.role);
        self.members.insert(node.id.clone(), node);
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.members.get(id).map(|entry| entry.value().status)
    }

    pub fn is_normal(&self, id: &NodeId) -> bool {
        self.status(id) == Some(NodeStatus::Normal)
    }

    /// Local status change. Returns the new incarnation to broadcast.
    pub fn set_status(&self, id: &NodeId, status: NodeStatus) -> Option<u64> {
        let mut entry = self.members.get_mut(id)?;
        let node = entry.value_mut();
        node.incarnation += 1;
        if node.status != status {
            tracing::info!("Node {:?}: {:?} -> {:?}", id, node.status, status);
            node.status = status;
        }
        Some(node.incarnation)
    }

    /// Applies a broadcast status change if it is newer than what we know.
    pub fn apply(&self, id: &NodeId, status: NodeStatus, incarnation: u64) -> bool {
        let Some(mut entry) = self.members.get_mut(id) else {
            return false;
        };
        let node = entry.value_mut();
        if incarnation <= node.incarnation {
            return false;
        }
        if node.status != status {
            tracing::info!("Node {:?}: {:?} -> {:?}", id, node.status, status);
        }
        node.status = status;
        node.incarnation = incarnation;
        true
    }

    pub fn touch(&self, id: &NodeId, now: Instant) {
        if let Some(mut entry) = self.members.get_mut(id) {
            entry.value_mut().last_seen = Some(now);
        }
    }

    /// Marks every normal server not heard from within `timeout` as unavailable.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<(NodeId, u64)> {
        let mut expired = Vec::new();
        for mut entry in self.members.iter_mut() {
            let node = entry.value_mut();
            if node.role != NodeRole::Server || node.status != NodeStatus::Normal {
                continue;
            }
            let silent = node
                .last_seen
                .map(|seen| now.saturating_duration_since(seen) > timeout)
                .unwrap_or(true);
            if silent {
                tracing::warn!("Node {:?} missed heartbeats, marking unavailable", node.id);
                node.status = NodeStatus::Unavailable;
                node.incarnation += 1;
                expired.push((node.id.clone(), node.incarnation));
            }
        }
        expired
    }

    /// Members with `role`, ordered by id.
    pub fn members_with_role(&self, role: NodeRole) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| entry.value().role == role)
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn members(&self) -> Vec<Node> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

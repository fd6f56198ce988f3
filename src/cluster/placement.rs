use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::types::NodeId;
use crate::error::{EngineError, Result};

/// Data and parity holders of one stripe list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListPeers {
    pub data_peers: Vec<NodeId>,
    pub parity_peers: Vec<NodeId>,
}

impl ListPeers {
    /// Holder of stripe slot `chunk_id` (data slots first, then parity).
    pub fn peer(&self, chunk_id: u32) -> Option<&NodeId> {
        let index = chunk_id as usize;
        self.data_peers
            .get(index)
            .or_else(|| self.parity_peers.get(index.checked_sub(self.data_peers.len())?))
    }

    /// Every slot holder as `(chunk_id, node)`.
    pub fn slots(&self) -> impl Iterator<Item = (u32, &NodeId)> {
        self.data_peers
            .iter()
            .chain(self.parity_peers.iter())
            .enumerate()
            .map(|(i, node)| (i as u32, node))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPlacement {
    pub list_id: u32,
    /// Data slot the key is stored in.
    pub chunk_id: u32,
    pub data_peers: Vec<NodeId>,
    pub parity_peers: Vec<NodeId>,
}

impl KeyPlacement {
    pub fn data_peer(&self) -> &NodeId {
        &self.data_peers[self.chunk_id as usize]
    }
}

/// Maps keys onto stripe lists. Deterministic for a given membership.
pub trait Placement: Send + Sync {
    fn place(&self, key: &str) -> KeyPlacement;
    fn list(&self, list_id: u32) -> Option<ListPeers>;
}

/// Stripe lists built as rotations over the sorted server set.
///
/// List `l` puts server `(l + i) mod n` in slot `i`, so every server carries
/// data and parity roles across the lists.
#[derive(Debug, Clone)]
pub struct StripeList {
    data_chunks: usize,
    lists: Vec<ListPeers>,
}

impl StripeList {
    pub fn new(
        mut servers: Vec<NodeId>,
        list_count: usize,
        data_chunks: usize,
        parity_chunks: usize,
    ) -> Result<Self> {
        let width = data_chunks + parity_chunks;
        if servers.len() < width {
            return Err(EngineError::InvalidConfig(format!(
                "{} servers cannot hold a stripe of {}",
                servers.len(),
                width
            )));
        }
        if list_count == 0 {
            return Err(EngineError::InvalidConfig(
                "list_count must be greater than 0".into(),
            ));
        }
        servers.sort();

        let n = servers.len();
        let lists = (0..list_count)
            .map(|l| {
                let mut slots = (0..width).map(|i| servers[(l + i) % n].clone());
                ListPeers {
                    data_peers: slots.by_ref().take(data_chunks).collect(),
                    parity_peers: slots.collect(),
                }
            })
            .collect();

        Ok(Self { data_chunks, lists })
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    /// Slot `node` holds in `list_id`.
    pub fn position(&self, list_id: u32, node: &NodeId) -> Option<u32> {
        self.lists
            .get(list_id as usize)?
            .slots()
            .find(|(_, peer)| *peer == node)
            .map(|(chunk_id, _)| chunk_id)
    }

    /// Every `(list_id, chunk_id)` held by `node`.
    pub fn lists_for(&self, node: &NodeId) -> Vec<(u32, u32)> {
        (0..self.lists.len() as u32)
            .filter_map(|list_id| Some((list_id, self.position(list_id, node)?)))
            .collect()
    }
}

impl Placement for StripeList {
    fn place(&self, key: &str) -> KeyPlacement {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();

        let list_id = (hash % self.lists.len() as u64) as u32;
        let chunk_id = ((hash / self.lists.len() as u64) % self.data_chunks as u64) as u32;
        let peers = &self.lists[list_id as usize];
        KeyPlacement {
            list_id,
            chunk_id,
            data_peers: peers.data_peers.clone(),
            parity_peers: peers.parity_peers.clone(),
        }
    }

    fn list(&self, list_id: u32) -> Option<ListPeers> {
        self.lists.get(list_id as usize).cloned()
    }
}

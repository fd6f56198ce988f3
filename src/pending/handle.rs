use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cluster::types::NodeId;

/// Arena index plus generation counter.
///
/// A slot's generation is bumped every time its value is removed, so a handle
/// kept across an asynchronous hop never resolves to whatever reused the slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const MIN: Handle = Handle {
        index: 0,
        generation: 0,
    };
    pub const MAX: Handle = Handle {
        index: u32::MAX,
        generation: u32::MAX,
    };

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct HandleArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Stable handles for remote peers.
///
/// Forgetting a peer (its connection was torn down) invalidates every handle
/// issued for it; the next message from that peer gets a fresh one.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    arena: HandleArena<NodeId>,
    by_node: HashMap<NodeId, Handle>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_for(&mut self, node: &NodeId) -> Handle {
        if let Some(handle) = self.by_node.get(node) {
            return *handle;
        }
        let handle = self.arena.insert(node.clone());
        self.by_node.insert(node.clone(), handle);
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Option<NodeId> {
        self.arena.get(handle).cloned()
    }

    pub fn forget(&mut self, node: &NodeId) -> bool {
        match self.by_node.remove(node) {
            Some(handle) => self.arena.remove(handle).is_some(),
            None => false,
        }
    }
}

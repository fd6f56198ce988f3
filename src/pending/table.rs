use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::handle::Handle;
use super::types::{PendingEntry, PendingIdentifier, PendingType, Settled};
use crate::error::{EngineError, Result};

/// One lock-protected association table from `(request_id, origin)` to a payload.
///
/// Entries carry a lease; [`PendingTable::reap_expired`] hands back every entry
/// whose lease ran out so the owner can fail it explicitly.
#[derive(Debug)]
pub struct PendingTable<T> {
    kind: PendingType,
    lease: Duration,
    entries: Mutex<Entries<T>>,
}

impl<T> PendingTable<T> {
    pub fn new(kind: PendingType, lease: Duration) -> Self {
        Self {
            kind,
            lease,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> PendingType {
        self.kind
    }

    /// Records an in-flight request. A second insert for the same
    /// `(request_id, origin)` fails with `DuplicateRequest`.
    pub fn try_insert(&self, id: PendingIdentifier, payload: T) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id.key()) {
            return Err(EngineError::DuplicateRequest {
                kind: self.kind,
                request_id: id.request_id,
            });
        }
        entries.insert(
            id.key(),
            PendingEntry {
                id,
                payload,
                expires_at: Instant::now() + self.lease,
            },
        );
        Ok(())
    }

    /// Removes the entry for `(request_id, origin)`. Without an origin, the
    /// lowest-keyed entry for `request_id` is removed.
    pub fn erase(&self, request_id: u64, origin: Option<Handle>) -> Result<PendingEntry<T>> {
        let mut entries = self.entries.lock();
        let key = match origin {
            Some(origin) => (request_id, origin),
            None => entries
                .range((request_id, Handle::MIN)..=(request_id, Handle::MAX))
                .next()
                .map(|(key, _)| *key)
                .ok_or(EngineError::CorrelationMiss {
                    kind: self.kind,
                    request_id,
                })?,
        };
        entries.remove(&key).ok_or(EngineError::CorrelationMiss {
            kind: self.kind,
            request_id,
        })
    }

    /// Outstanding entries sharing `request_id`.
    pub fn count(&self, request_id: u64) -> usize {
        siblings(&self.entries.lock(), request_id)
    }

    /// Erases one leg of a fan-out and reports how many legs are left, both
    /// under the same lock: exactly one erase observes zero.
    pub fn erase_leg(&self, request_id: u64, origin: Handle) -> Result<Settled<T>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .remove(&(request_id, origin))
            .ok_or(EngineError::CorrelationMiss {
                kind: self.kind,
                request_id,
            })?;
        let remaining = siblings(&entries, request_id);
        Ok(Settled { entry, remaining })
    }

    pub fn contains(&self, request_id: u64, origin: Handle) -> bool {
        self.entries.lock().contains_key(&(request_id, origin))
    }

    /// Runs `f` on the entry without removing it.
    pub fn with_entry_mut<R>(
        &self,
        request_id: u64,
        origin: Option<Handle>,
        f: impl FnOnce(&mut PendingEntry<T>) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.lock();
        let entry = match origin {
            Some(origin) => entries.get_mut(&(request_id, origin)),
            None => entries
                .range_mut((request_id, Handle::MIN)..=(request_id, Handle::MAX))
                .next()
                .map(|(_, entry)| entry),
        }?;
        Some(f(entry))
    }

    /// Removes every entry whose lease expired before `now`.
    pub fn reap_expired(&self, now: Instant) -> Vec<Settled<T>> {
        let mut entries = self.entries.lock();
        let expired: Vec<(u64, Handle)> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();
        let reaped = remove_all(&mut entries, &expired);
        if !reaped.is_empty() {
            tracing::warn!("Reaped {} expired {} entries", reaped.len(), self.kind);
        }
        reaped
    }

    /// Removes every entry whose origin is `origin`, e.g. when that peer's
    /// handle is invalidated.
    pub fn drain_origin(&self, origin: Handle) -> Vec<Settled<T>> {
        let mut entries = self.entries.lock();
        let keys: Vec<(u64, Handle)> = entries
            .keys()
            .filter(|(_, handle)| *handle == origin)
            .copied()
            .collect();
        remove_all(&mut entries, &keys)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

type Entries<T> = BTreeMap<(u64, Handle), PendingEntry<T>>;

fn siblings<T>(entries: &Entries<T>, request_id: u64) -> usize {
    entries
        .range((request_id, Handle::MIN)..=(request_id, Handle::MAX))
        .count()
}

/// Removes `keys` one at a time, recording the sibling count left after each.
fn remove_all<T>(entries: &mut Entries<T>, keys: &[(u64, Handle)]) -> Vec<Settled<T>> {
    keys.iter()
        .filter_map(|key| {
            let entry = entries.remove(key)?;
            let remaining = siblings(entries, key.0);
            Some(Settled { entry, remaining })
        })
        .collect()
}

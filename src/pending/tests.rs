#[cfg(test)]
mod tests {
    use crate::cluster::types::NodeId;
    use crate::error::EngineError;
    use crate::pending::*;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    fn table() -> PendingTable<&'static str> {
        PendingTable::new(PendingType::ParityUpdate, Duration::from_secs(10))
    }

    fn handles(n: usize) -> Vec<Handle> {
        let mut arena = HandleArena::new();
        (0..n).map(|i| arena.insert(i)).collect()
    }

    // ===== HANDLE ARENA =====

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut arena = HandleArena::new();
        let first = arena.insert("a");
        assert_eq!(arena.remove(first), Some("a"));

        let reused = arena.insert("b");
        assert_eq!(reused.index(), first.index());
        assert_ne!(reused.generation(), first.generation());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(reused), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_peer_registry_forget_invalidates_handle() {
        let mut peers = PeerRegistry::new();
        let node = NodeId::from("s1");
        let handle = peers.handle_for(&node);
        assert_eq!(peers.handle_for(&node), handle);
        assert_eq!(peers.resolve(handle), Some(node.clone()));

        assert!(peers.forget(&node));
        assert_eq!(peers.resolve(handle), None);
        let fresh = peers.handle_for(&node);
        assert_ne!(fresh, handle);
        assert_eq!(peers.resolve(fresh), Some(node));
    }

    // ===== INSERT / ERASE =====

    #[test]
    fn test_duplicate_insert_is_rejected_until_erased() {
        let table = table();
        let origin = handles(1)[0];
        let id = PendingIdentifier::new(7, 1, origin);

        assert!(table.try_insert(id, "first").is_ok());
        assert!(matches!(
            table.try_insert(id, "second"),
            Err(EngineError::DuplicateRequest { request_id: 7, .. })
        ));

        let entry = table.erase(7, Some(origin)).unwrap();
        assert_eq!(entry.payload, "first");
        assert!(table.try_insert(id, "third").is_ok());
    }

    #[test]
    fn test_erase_without_origin_takes_lowest_key() {
        let table = table();
        let origins = handles(3);
        for origin in origins.iter().rev() {
            table
                .try_insert(PendingIdentifier::new(5, 0, *origin), "leg")
                .unwrap();
        }
        table
            .try_insert(PendingIdentifier::new(6, 0, origins[0]), "other")
            .unwrap();

        let entry = table.erase(5, None).unwrap();
        assert_eq!(entry.id.origin, origins[0]);
        assert_eq!(table.count(5), 2);
        assert_eq!(table.count(6), 1);
    }

    #[test]
    fn test_erase_unknown_is_correlation_miss() {
        let table = table();
        assert!(matches!(
            table.erase(42, None),
            Err(EngineError::CorrelationMiss { request_id: 42, .. })
        ));
        assert!(matches!(
            table.erase(42, Some(Handle::MIN)),
            Err(EngineError::CorrelationMiss { .. })
        ));
    }

    #[test]
    fn test_fan_out_collapses_on_last_leg() {
        let table = table();
        let legs = handles(4);
        for leg in &legs {
            table
                .try_insert(PendingIdentifier::new(9, 3, *leg), "leg")
                .unwrap();
        }

        let mut upstream_responses = 0;
        for (i, leg) in legs.iter().enumerate() {
            let entry = table.erase(9, Some(*leg)).unwrap();
            assert_eq!(entry.id.parent_request_id, 3);
            let remaining = table.count(9);
            assert_eq!(remaining, legs.len() - i - 1);
            if remaining == 0 {
                upstream_responses += 1;
            }
        }
        assert_eq!(upstream_responses, 1);
    }

    #[test]
    fn test_erase_leg_reports_last_leg_once() {
        let table = table();
        let legs = handles(3);
        for leg in &legs {
            table
                .try_insert(PendingIdentifier::new(11, 2, *leg), "leg")
                .unwrap();
        }

        let settled: Vec<bool> = legs
            .iter()
            .map(|leg| table.erase_leg(11, *leg).unwrap().is_last())
            .collect();
        assert_eq!(settled, vec![false, false, true]);
        assert!(matches!(
            table.erase_leg(11, legs[0]),
            Err(EngineError::CorrelationMiss { .. })
        ));
    }

    #[test]
    fn test_drain_origin_settles_each_fan_out() {
        let table = table();
        let origins = handles(2);
        table.try_insert(PendingIdentifier::new(1, 0, origins[0]), "a").unwrap();
        table.try_insert(PendingIdentifier::new(1, 0, origins[1]), "b").unwrap();
        table.try_insert(PendingIdentifier::new(2, 0, origins[0]), "c").unwrap();

        let drained = table.drain_origin(origins[0]);
        assert_eq!(drained.len(), 2);
        let by_request: Vec<(u64, bool)> = drained
            .iter()
            .map(|settled| (settled.entry.id.request_id, settled.is_last()))
            .collect();
        assert_eq!(by_request, vec![(1, false), (2, true)]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_with_entry_mut_keeps_entry() {
        let table: PendingTable<u32> = PendingTable::new(PendingType::ChunkGet, Duration::from_secs(1));
        let origin = handles(1)[0];
        table.try_insert(PendingIdentifier::new(1, 0, origin), 0).unwrap();

        let updated = table.with_entry_mut(1, None, |entry| {
            entry.payload += 1;
            entry.payload
        });
        assert_eq!(updated, Some(1));
        assert!(table.contains(1, origin));
        assert!(table.with_entry_mut(2, None, |_| ()).is_none());
    }

    // ===== LEASES =====

    #[test]
    fn test_reap_returns_only_expired_entries() {
        let table: PendingTable<&str> = PendingTable::new(PendingType::Seal, Duration::from_millis(50));
        let origins = handles(2);
        table.try_insert(PendingIdentifier::new(1, 0, origins[0]), "old").unwrap();

        assert!(table.reap_expired(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(1);
        let reaped = table.reap_expired(later);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].entry.payload, "old");
        assert!(reaped[0].is_last());
        assert!(table.is_empty());
    }

    proptest! {
        #[test]
        fn proptest_insert_erase_pairs(ops in prop::collection::vec((0u64..8, 0usize..3, any::<bool>()), 1..64)) {
            let table = table();
            let origins = handles(3);
            let mut model = std::collections::BTreeSet::new();

            for (request_id, origin, insert) in ops {
                let origin = origins[origin];
                if insert {
                    let result = table.try_insert(PendingIdentifier::new(request_id, 0, origin), "x");
                    prop_assert_eq!(result.is_ok(), model.insert((request_id, origin)));
                } else {
                    let result = table.erase(request_id, Some(origin));
                    prop_assert_eq!(result.is_ok(), model.remove(&(request_id, origin)));
                }
                prop_assert_eq!(table.len(), model.len());
            }
        }
    }
}

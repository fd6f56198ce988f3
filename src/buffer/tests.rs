#[cfg(test)]
mod tests {
    use crate::buffer::*;
    use crate::chunk::{ChunkId, KeyLocation};
    use crate::coding::CodingEngine;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::index::KeyIndex;
    use crate::pending::{Handle, ReplyTo};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn config(k: usize, m: usize, chunk_size: u32, flush_threshold: u32, open_slots: usize) -> EngineConfig {
        EngineConfig {
            chunk_size,
            flush_threshold,
            open_slots,
            ..EngineConfig::new(k, m)
        }
    }

    fn reply(request_id: u64) -> ReplyTo {
        ReplyTo {
            origin: Handle::MIN,
            request_id,
        }
    }

    fn forward_seals(parity: &[ParityChunkBuffer], sealed: &[SealedChunk]) {
        for chunk in sealed {
            for holder in parity {
                holder
                    .seal(chunk.id.stripe_id, chunk.id.chunk_id, &chunk.bytes, chunk.records.clone())
                    .unwrap();
            }
        }
    }

    fn forward_delta(parity: &[ParityChunkBuffer], location: &KeyLocation, key: &str, offset: u32, delta: &[u8]) {
        for holder in parity {
            let applied = holder
                .update(location.stripe_id, location.chunk_id, key, offset, delta, reply(0))
                .unwrap();
            assert_eq!(applied, ParityApply::Applied);
        }
    }

    // ===== DATA BUFFER: SLOT SELECTION =====

    #[test]
    fn test_set_picks_slot_with_most_free_space() {
        let config = config(3, 1, 64, 8, 2);
        let index = KeyIndex::new();
        let buffer = DataChunkBuffer::new(0, 1, &config, &index);

        let a = buffer.set(&index, "a", b"1234").unwrap();
        assert_eq!(a.location.stripe_id, 0, "ties go to the lowest stripe");
        assert_eq!(a.location.offset, 0);

        let b = buffer.set(&index, "b", b"12").unwrap();
        assert_eq!(b.location.stripe_id, 1, "the emptier slot wins");

        let c = buffer.set(&index, "c", b"").unwrap();
        assert_eq!(c.location.stripe_id, 1);
        assert_eq!(c.location.offset, 7);
        assert!(a.sealed.is_empty() && b.sealed.is_empty() && c.sealed.is_empty());
    }

    #[test]
    fn test_set_seals_fullest_slot_when_nothing_fits() {
        let config = config(3, 1, 64, 8, 2);
        let index = KeyIndex::new();
        let buffer = DataChunkBuffer::new(0, 0, &config, &index);

        buffer.set(&index, "a", &[1u8; 36]).unwrap();
        buffer.set(&index, "b", &[2u8; 30]).unwrap();
        let outcome = buffer.set(&index, "c", &[3u8; 30]).unwrap();

        assert_eq!(outcome.sealed.len(), 1);
        assert_eq!(outcome.sealed[0].id, ChunkId::new(0, 0, 0));
        assert_eq!(outcome.sealed[0].records[0].key, "a");
        assert_eq!(outcome.location.stripe_id, 2);
        assert_eq!(
            buffer.open_chunk_ids(),
            vec![ChunkId::new(0, 2, 0), ChunkId::new(0, 1, 0)]
        );
        assert!(index.find_chunk_by_id(&ChunkId::new(0, 0, 0)).unwrap().read().is_sealed());
    }

    #[test]
    fn test_set_seals_proactively_past_flush_threshold() {
        let config = config(3, 1, 64, 8, 1);
        let index = KeyIndex::new();
        let buffer = DataChunkBuffer::new(0, 0, &config, &index);

        let outcome = buffer.set(&index, "big", &[9u8; 52]).unwrap();
        assert_eq!(outcome.location.stripe_id, 0);
        assert_eq!(outcome.sealed.len(), 1);
        assert_eq!(outcome.sealed[0].bytes.len(), 59);
        assert_eq!(buffer.open_chunk_ids(), vec![ChunkId::new(0, 1, 0)]);

        // The sealed record stays readable through the index.
        assert_eq!(index.find_value_by_key("big").unwrap().1, vec![9u8; 52]);
    }

    #[test]
    fn test_set_rejects_oversized_and_existing_keys() {
        let config = config(3, 1, 64, 8, 1);
        let index = KeyIndex::new();
        let buffer = DataChunkBuffer::new(0, 0, &config, &index);

        assert!(matches!(
            buffer.set(&index, "k", &[0u8; 64]),
            Err(EngineError::RecordTooLarge { .. })
        ));
        buffer.set(&index, "k", b"v").unwrap();
        assert!(matches!(
            buffer.set(&index, "k", b"w"),
            Err(EngineError::KeyExists(_))
        ));
    }

    // ===== DATA BUFFER: UPDATE / DELETE / REINSERT =====

    #[test]
    fn test_update_reports_sealed_state() {
        let config = config(3, 1, 64, 8, 1);
        let index = KeyIndex::new();
        let buffer = DataChunkBuffer::new(0, 0, &config, &index);
        buffer.set(&index, "a", b"1234").unwrap();

        let open = buffer.update(&index, "a", 0, b"x").unwrap();
        assert!(!open.sealed);

        buffer.seal_open_chunks(&index).unwrap();
        let sealed = buffer.update(&index, "a", 1, b"y").unwrap();
        assert!(sealed.sealed);
        assert_eq!(sealed.delta.offset, 6);
        assert_eq!(index.find_value_by_key("a").unwrap().1, b"xy34");
    }

    #[test]
    fn test_deleted_space_in_sealed_chunk_is_reused() {
        let config = config(3, 1, 64, 8, 1);
        let index = KeyIndex::new();
        let buffer = DataChunkBuffer::new(0, 0, &config, &index);
        buffer.set(&index, "a", &[1u8; 20]).unwrap();
        buffer.set(&index, "b", &[2u8; 20]).unwrap();
        buffer.seal_open_chunks(&index).unwrap();

        let deleted = buffer.delete(&index, "a").unwrap();
        assert!(deleted.sealed);
        assert_eq!(buffer.reinserted_ids(), vec![ChunkId::new(0, 0, 0)]);

        let outcome = buffer.set(&index, "c", &[3u8; 10]).unwrap();
        assert_eq!(outcome.location.chunk(), ChunkId::new(0, 0, 0));
        assert_eq!(outcome.location.offset, 25);
        let delta = outcome.parity_delta.unwrap();
        assert_eq!(delta.offset, 25);
        assert_eq!(delta.bytes.len(), 15);

        // Large records skip the re-inserted chunk.
        let other = buffer.set(&index, "d", &[4u8; 30]).unwrap();
        assert_eq!(other.location.stripe_id, 1);
        assert!(other.parity_delta.is_none());
    }

    // ===== PARITY BUFFER =====

    #[test]
    fn test_single_key_seal_scenario() {
        let config = config(3, 1, 64, 8, 4);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let index = KeyIndex::new();
        let data = DataChunkBuffer::new(0, 0, &config, &index);
        let parity = ParityChunkBuffer::new(0, 0, &config, coding);

        let outcome = data.set(&index, "a", b"wxyz").unwrap();
        assert_eq!(outcome.location.offset, 0);
        let sealed = data.seal_open_chunks(&index).unwrap();
        assert_eq!(sealed.len(), 4);
        assert_eq!(sealed[0].id, ChunkId::new(0, 0, 0));
        assert!(sealed[1..].iter().all(|chunk| chunk.bytes.is_empty()));

        parity
            .seal(0, 0, &sealed[0].bytes, sealed[0].records.clone())
            .unwrap();
        assert_eq!(parity.pending(0), Some(vec![false, true, true]));

        // The other data chunks of the stripe seal empty.
        for chunk_id in 1..3 {
            let other_index = KeyIndex::new();
            let other = DataChunkBuffer::new(0, chunk_id, &config, &other_index);
            let empty = other.seal_open_chunks(&other_index).unwrap().remove(0);
            assert_eq!(empty.id, ChunkId::new(0, 0, chunk_id));
            parity
                .seal(0, chunk_id, &empty.bytes, empty.records)
                .unwrap();
        }
        assert_eq!(parity.pending(0), Some(vec![false, false, false]));

        let (bytes, _) = parity.get_chunk(0).unwrap();
        let chunk = index.find_chunk_by_id(&ChunkId::new(0, 0, 0)).unwrap();
        assert_eq!(bytes, chunk.read().data().unwrap());
    }

    #[test]
    fn test_replicas_follow_writes_until_seal() {
        let config = config(3, 1, 64, 8, 1);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let parity = ParityChunkBuffer::new(0, 0, &config, coding);

        parity.replicate(0, 1, "b", &ReplicaOp::Set(b"bravo".to_vec())).unwrap();
        parity.replicate(0, 1, "a", &ReplicaOp::Set(b"alpha".to_vec())).unwrap();
        parity
            .replicate(
                0,
                1,
                "a",
                &ReplicaOp::Update {
                    offset: 0,
                    value: b"A".to_vec(),
                },
            )
            .unwrap();
        parity.replicate(0, 2, "c", &ReplicaOp::Set(b"charlie".to_vec())).unwrap();
        parity.replicate(0, 2, "c", &ReplicaOp::Delete).unwrap();

        assert_eq!(
            parity.replicas(0, 1),
            vec![
                ("a".to_string(), b"Alpha".to_vec()),
                ("b".to_string(), b"bravo".to_vec()),
            ]
        );
        assert!(parity.replicas(0, 2).is_empty());

        let snapshot = parity.snapshot(0, 1).unwrap();
        assert_eq!(snapshot.pending, vec![true, true, true]);
        assert_eq!(snapshot.replicas.len(), 2);
        assert!(snapshot.bytes.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_replicas_dropped_on_seal_and_ignored_after() {
        let config = config(3, 1, 64, 8, 1);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let parity = ParityChunkBuffer::new(0, 0, &config, coding);
        parity.replicate(0, 0, "a", &ReplicaOp::Set(b"alpha".to_vec())).unwrap();

        parity.seal(0, 0, &[], Vec::new()).unwrap();
        assert!(parity.replicas(0, 0).is_empty());

        // A replica overtaken by the seal changes nothing.
        parity.replicate(0, 0, "a", &ReplicaOp::Delete).unwrap();
        parity.replicate(0, 0, "z", &ReplicaOp::Set(b"late".to_vec())).unwrap();
        assert!(parity.replicas(0, 0).is_empty());
    }

    #[test]
    fn test_replica_errors() {
        let config = config(3, 1, 64, 8, 1);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let parity = ParityChunkBuffer::new(0, 0, &config, coding);
        parity.replicate(0, 0, "a", &ReplicaOp::Set(b"abc".to_vec())).unwrap();

        assert!(matches!(
            parity.replicate(0, 0, "a", &ReplicaOp::Set(b"again".to_vec())),
            Err(EngineError::KeyExists(_))
        ));
        assert!(matches!(
            parity.replicate(0, 0, "missing", &ReplicaOp::Delete),
            Err(EngineError::KeyNotFound(_))
        ));
        assert!(matches!(
            parity.replicate(
                0,
                0,
                "a",
                &ReplicaOp::Update {
                    offset: 2,
                    value: b"xy".to_vec(),
                },
            ),
            Err(EngineError::OutOfRange { .. })
        ));
        assert_eq!(parity.replicas(0, 0), vec![("a".to_string(), b"abc".to_vec())]);
    }

    #[test]
    fn test_update_before_seal_is_replayed() {
        let config = config(3, 2, 64, 8, 1);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let index = KeyIndex::new();
        let data = DataChunkBuffer::new(0, 1, &config, &index);
        data.set(&index, "k", b"original").unwrap();
        let sealed = data.seal_open_chunks(&index).unwrap().remove(0);
        let modification = data.update(&index, "k", 2, b"NEW").unwrap();
        let delta = &modification.delta;

        for parity_index in 0..2 {
            let in_order = ParityChunkBuffer::new(0, parity_index, &config, coding.clone());
            in_order.seal(0, 1, &sealed.bytes, sealed.records.clone()).unwrap();
            let applied = in_order
                .update(0, 1, "k", delta.offset, &delta.bytes, reply(1))
                .unwrap();
            assert_eq!(applied, ParityApply::Applied);

            let reordered = ParityChunkBuffer::new(0, parity_index, &config, coding.clone());
            let deferred = reordered
                .update(0, 1, "k", delta.offset, &delta.bytes, reply(1))
                .unwrap();
            assert_eq!(deferred, ParityApply::Deferred);
            assert_eq!(reordered.deferred_len(0), 1);

            let replayed = reordered.seal(0, 1, &sealed.bytes, sealed.records.clone()).unwrap();
            assert_eq!(replayed.len(), 1);
            assert_eq!(replayed[0].reply_to, reply(1));
            assert_eq!(reordered.deferred_len(0), 0);

            assert_eq!(in_order.get_chunk(0).unwrap().0, reordered.get_chunk(0).unwrap().0);
        }
    }

    #[test]
    fn test_second_deferred_update_for_key_is_poisoned() {
        let config = config(3, 1, 64, 8, 1);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let parity = ParityChunkBuffer::new(0, 0, &config, coding);

        parity.update(0, 2, "k", 0, &[1, 2], reply(1)).unwrap();
        let second = parity.update(0, 2, "k", 0, &[3, 4], reply(2));
        assert!(matches!(
            second,
            Err(EngineError::PoisonedDeferredUpdate { ref key, chunk }) if key == "k" && chunk == ChunkId::new(0, 0, 2)
        ));

        // Other keys and other data chunks are unaffected.
        parity.update(0, 2, "j", 0, &[1], reply(3)).unwrap();
        parity.update(0, 1, "k", 0, &[1], reply(4)).unwrap();
        assert_eq!(parity.deferred_len(0), 3);
    }

    #[test]
    fn test_duplicate_seal_is_not_folded_twice() {
        let config = config(3, 1, 64, 8, 1);
        let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
        let parity = ParityChunkBuffer::new(0, 0, &config, coding);

        parity.seal(3, 0, &[5, 6, 7], Vec::new()).unwrap();
        parity.seal(3, 0, &[5, 6, 7], Vec::new()).unwrap();
        assert_eq!(&parity.get_chunk(3).unwrap().0[..3], &[5, 6, 7]);
        assert!(parity.seal(3, 3, &[1], Vec::new()).is_err());
    }

    // ===== PARITY INVARIANT =====

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, usize),
        Update(u8, u8),
        Delete(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..24, 0usize..40).prop_map(|(key, len)| Op::Set(key, len)),
            1 => (0u8..24, any::<u8>()).prop_map(|(key, byte)| Op::Update(key, byte)),
            1 => (0u8..24).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn proptest_parity_matches_encoded_data(ops in prop::collection::vec(op_strategy(), 1..80)) {
            let config = config(3, 2, 128, 16, 2);
            let coding = Arc::new(CodingEngine::from_config(&config).unwrap());
            let index = KeyIndex::new();
            let data: Vec<DataChunkBuffer> = (0..3)
                .map(|chunk_id| DataChunkBuffer::new(0, chunk_id, &config, &index))
                .collect();
            let parity: Vec<ParityChunkBuffer> = (0..2)
                .map(|parity_index| ParityChunkBuffer::new(0, parity_index, &config, coding.clone()))
                .collect();
            let mut lengths: HashMap<String, usize> = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(key, len) => {
                        let name = format!("key-{}", key);
                        if lengths.contains_key(&name) {
                            continue;
                        }
                        let buffer = &data[key as usize % 3];
                        let outcome = buffer.set(&index, &name, &vec![key; len]).unwrap();
                        forward_seals(&parity, &outcome.sealed);
                        if let Some(delta) = outcome.parity_delta {
                            forward_delta(&parity, &outcome.location, &name, delta.offset, &delta.bytes);
                        }
                        lengths.insert(name, len);
                    }
                    Op::Update(key, byte) => {
                        let name = format!("key-{}", key);
                        let Some(len) = lengths.get(&name).copied() else { continue };
                        if len == 0 {
                            continue;
                        }
                        let buffer = &data[key as usize % 3];
                        let modification = buffer.update(&index, &name, (len / 2) as u32, &[byte]).unwrap();
                        if modification.sealed {
                            forward_delta(&parity, &modification.location, &name, modification.delta.offset, &modification.delta.bytes);
                        }
                    }
                    Op::Delete(key) => {
                        let name = format!("key-{}", key);
                        if lengths.remove(&name).is_none() {
                            continue;
                        }
                        let buffer = &data[key as usize % 3];
                        let modification = buffer.delete(&index, &name).unwrap();
                        if modification.sealed {
                            forward_delta(&parity, &modification.location, &name, modification.delta.offset, &modification.delta.bytes);
                        }
                    }
                }
            }
            for buffer in &data {
                let sealed = buffer.seal_open_chunks(&index).unwrap();
                forward_seals(&parity, &sealed);
            }

            for (parity_index, holder) in parity.iter().enumerate() {
                for stripe_id in holder.stripe_ids() {
                    let chunks: Vec<Option<Vec<u8>>> = (0..3)
                        .map(|chunk_id| {
                            index
                                .find_chunk_by_id(&ChunkId::new(0, stripe_id, chunk_id))
                                .filter(|chunk| chunk.read().is_sealed())
                                .map(|chunk| chunk.read().data().unwrap().to_vec())
                        })
                        .collect();
                    let refs: Vec<Option<&[u8]>> = chunks.iter().map(|c| c.as_deref()).collect();
                    let mut expected = vec![0u8; 128];
                    coding.encode(&refs, &mut expected, parity_index, 0..128).unwrap();
                    prop_assert_eq!(holder.get_chunk(stripe_id).unwrap().0, expected);
                }
            }
        }
    }
}

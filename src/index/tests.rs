#[cfg(test)]
mod tests {
    use crate::chunk::{Chunk, ChunkId, ChunkStatus};
    use crate::error::EngineError;
    use crate::index::KeyIndex;
    use std::sync::Arc;
    use std::thread;

    fn setup() -> (KeyIndex, crate::chunk::SharedChunk) {
        let index = KeyIndex::new();
        let chunk = Chunk::new(ChunkId::new(0, 0, 1), 128, false).into_shared();
        index.insert_chunk(chunk.clone());
        (index, chunk)
    }

    // ===== INSERT / FIND =====

    #[test]
    fn test_insert_and_find_value() {
        let (index, chunk) = setup();
        let location = index.insert_key("a", &chunk, b"1234").unwrap();
        assert_eq!(location.offset, 0);
        assert_eq!(location.length, 9);
        assert_eq!(location.chunk(), ChunkId::new(0, 0, 1));

        let (found, value) = index.find_value_by_key("a").unwrap();
        assert_eq!(found, location);
        assert_eq!(value, b"1234");
    }

    #[test]
    fn test_insert_existing_key_fails() {
        let (index, chunk) = setup();
        index.insert_key("a", &chunk, b"1").unwrap();
        assert!(matches!(
            index.insert_key("a", &chunk, b"2"),
            Err(EngineError::KeyExists(_))
        ));
        assert_eq!(chunk.read().size(), 6);
    }

    #[test]
    fn test_missing_key_and_evicted_chunk() {
        let (index, chunk) = setup();
        assert!(matches!(
            index.find_value_by_key("nope"),
            Err(EngineError::KeyNotFound(_))
        ));

        index.insert_key("a", &chunk, b"1").unwrap();
        chunk.write().seal();
        chunk.write().evict();
        assert!(matches!(
            index.find_value_by_key("a"),
            Err(EngineError::ChunkNotResident(_))
        ));
    }

    // ===== UPDATE / DELETE =====

    #[test]
    fn test_update_value_in_place() {
        let (index, chunk) = setup();
        index.insert_key("a", &chunk, b"hello").unwrap();
        let (_, delta) = index.update_value("a", 0, b"J").unwrap();
        assert_eq!(delta.bytes, vec![b'h' ^ b'J']);
        assert_eq!(index.find_value_by_key("a").unwrap().1, b"Jello");
    }

    #[test]
    fn test_delete_adjusts_shifted_offsets() {
        let (index, chunk) = setup();
        index.insert_key("a", &chunk, b"11").unwrap();
        index.insert_key("b", &chunk, b"2222").unwrap();
        let c_before = index.insert_key("c", &chunk, b"333").unwrap();

        let (deleted, _) = index.delete_key("a").unwrap();
        assert_eq!(deleted.length, 7);
        assert!(!index.contains_key("a"));

        let b = index.find_location("b").unwrap();
        let c = index.find_location("c").unwrap();
        assert_eq!(b.offset, 0);
        assert_eq!(c.offset, c_before.offset - 7);
        assert_eq!(index.find_value_by_key("c").unwrap().1, b"333");
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_install_chunk_reindexes_records() {
        let (index, chunk) = setup();
        index.insert_key("a", &chunk, b"old").unwrap();

        let mut replacement = Chunk::new(ChunkId::new(0, 0, 1), 128, false);
        replacement.append_record(b"x", b"1").unwrap();
        replacement.append_record(b"y", b"22").unwrap();
        replacement.set_status(ChunkStatus::Reconstructed);

        let shared = index.install_chunk(replacement).unwrap();
        assert!(Arc::ptr_eq(&shared, &chunk));
        assert!(!index.contains_key("a"));
        assert_eq!(index.find_value_by_key("y").unwrap().1, b"22");
        assert_eq!(chunk.read().status(), ChunkStatus::Reconstructed);
    }

    #[test]
    fn test_remove_chunk_drops_its_keys() {
        let (index, chunk) = setup();
        index.insert_key("a", &chunk, b"1").unwrap();
        assert!(index.remove_chunk(&ChunkId::new(0, 0, 1)).is_some());
        assert!(index.is_empty());
        assert!(index.find_chunk_by_id(&ChunkId::new(0, 0, 1)).is_none());
    }

    // ===== CONCURRENCY =====

    #[test]
    fn test_reads_never_observe_compacted_bytes() {
        let index = Arc::new(KeyIndex::new());
        let chunk = Chunk::new(ChunkId::new(0, 0, 0), 4096, false).into_shared();
        index.insert_chunk(chunk.clone());
        for i in 0..100 {
            index
                .insert_key(&format!("k{:03}", i), &chunk, format!("value-{:03}", i).as_bytes())
                .unwrap();
        }

        let deleter = {
            let index = index.clone();
            thread::spawn(move || {
                for i in (0..100).step_by(2) {
                    index.delete_key(&format!("k{:03}", i)).unwrap();
                }
            })
        };
        let reader = {
            let index = index.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in (1..100).step_by(2) {
                        let (_, value) = index.find_value_by_key(&format!("k{:03}", i)).unwrap();
                        assert_eq!(value, format!("value-{:03}", i).as_bytes());
                    }
                }
            })
        };
        deleter.join().unwrap();
        reader.join().unwrap();
        assert_eq!(index.len(), 50);
    }
}

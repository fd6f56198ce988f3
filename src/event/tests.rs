#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::event::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    // ===== QUEUE =====

    #[tokio::test]
    async fn test_priority_events_are_extracted_first() {
        let queue = EventQueue::new(8, 8);
        queue.insert(1).unwrap();
        queue.insert(2).unwrap();
        queue.prioritized_insert(100).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.extract().await, Some(100));
        assert_eq!(queue.extract().await, Some(1));
        assert_eq!(queue.try_extract(), Some(2));
        assert_eq!(queue.try_extract(), None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_and_priority_falls_back() {
        let queue = EventQueue::new(2, 1);
        queue.insert(1).unwrap();
        queue.prioritized_insert(10).unwrap();
        // Side channel full: lands on the normal channel.
        queue.prioritized_insert(11).unwrap();
        assert!(matches!(queue.insert(3), Err(EngineError::QueueFull)));

        assert_eq!(queue.try_extract(), Some(10));
        assert_eq!(queue.try_extract(), Some(1));
        assert_eq!(queue.try_extract(), Some(11));
    }

    #[tokio::test]
    async fn test_insert_wait_blocks_until_room() {
        let queue = Arc::new(EventQueue::new(1, 1));
        queue.insert(1).unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.insert_wait(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.extract().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.extract().await, Some(2));
    }

    // ===== WORKER POOL =====

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl EventHandler<u32> for Recorder {
        fn handle(&self, event: u32) {
            self.seen.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_shut_down() {
        let queue = Arc::new(EventQueue::new(64, 8));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let pool = WorkerPool::start(queue.clone(), recorder.clone(), 3);
        assert_eq!(pool.worker_count(), 3);

        for i in 0..20 {
            queue.insert(i).unwrap();
        }
        for _ in 0..100 {
            if recorder.seen.lock().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown())
            .await
            .unwrap();
        let mut seen = recorder.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<u32>>());
    }
}

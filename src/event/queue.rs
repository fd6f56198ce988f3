use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

struct Receivers<E> {
    normal: mpsc::Receiver<E>,
    priority: mpsc::Receiver<E>,
}

/// Bounded multi-producer event queue with a high-priority side channel.
///
/// Control messages (seal and lock acknowledgements, status changes) go
/// through [`EventQueue::prioritized_insert`] so a backlog of normal requests
/// cannot starve them. Extraction always drains the priority side first.
pub struct EventQueue<E> {
    normal_tx: mpsc::Sender<E>,
    priority_tx: mpsc::Sender<E>,
    receivers: Mutex<Receivers<E>>,
}

impl<E: Send> EventQueue<E> {
    pub fn new(capacity: usize, priority_capacity: usize) -> Self {
        let (normal_tx, normal) = mpsc::channel(capacity);
        let (priority_tx, priority) = mpsc::channel(priority_capacity);
        Self {
            normal_tx,
            priority_tx,
            receivers: Mutex::new(Receivers { normal, priority }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.queue_capacity, config.priority_queue_capacity)
    }

    /// Non-blocking insert; fails with `QueueFull` when the queue is saturated.
    pub fn insert(&self, event: E) -> Result<()> {
        match self.normal_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Event queue full, rejecting event");
                Err(EngineError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::Transport("event queue closed".into())),
        }
    }

    /// Insert that waits for room instead of failing.
    pub async fn insert_wait(&self, event: E) -> Result<()> {
        self.normal_tx
            .send(event)
            .await
            .map_err(|_| EngineError::Transport("event queue closed".into()))
    }

    /// Insert into the priority side channel, falling back to the normal
    /// channel when the side channel is full.
    pub fn prioritized_insert(&self, event: E) -> Result<()> {
        match self.priority_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                tracing::debug!("Priority queue full, falling back to normal queue");
                self.insert(event)
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::Transport("event queue closed".into())),
        }
    }

    /// Waits for the next event, priority side first. `None` once every
    /// sender is gone and the queue is drained.
    pub async fn extract(&self) -> Option<E> {
        let mut receivers = self.receivers.lock().await;
        let Receivers { normal, priority } = &mut *receivers;
        tokio::select! {
            biased;
            Some(event) = priority.recv() => Some(event),
            Some(event) = normal.recv() => Some(event),
            else => None,
        }
    }

    /// Takes the next ready event without waiting.
    pub fn try_extract(&self) -> Option<E> {
        let mut receivers = self.receivers.try_lock().ok()?;
        if let Ok(event) = receivers.priority.try_recv() {
            return Some(event);
        }
        receivers.normal.try_recv().ok()
    }

    /// Events currently queued on both sides.
    pub fn len(&self) -> usize {
        (self.normal_tx.max_capacity() - self.normal_tx.capacity())
            + (self.priority_tx.max_capacity() - self.priority_tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

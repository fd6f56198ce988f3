use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::queue::EventQueue;

/// Runs one event to completion. Handlers never block: anything that must
/// wait on the network is parked in the pending tables and resumed by a
/// later event.
pub trait EventHandler<E>: Send + Sync + 'static {
    fn handle(&self, event: E);
}

/// Fixed pool of workers, each pulling one event at a time.
pub struct WorkerPool {
    shutdown: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start<E, H>(queue: Arc<EventQueue<E>>, handler: Arc<H>, worker_count: usize) -> Self
    where
        E: Send + 'static,
        H: EventHandler<E>,
    {
        tracing::info!("Starting {} event workers", worker_count);
        let shutdown = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let handles = (0..worker_count)
            .map(|worker_id| {
                let queue = queue.clone();
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                let stopped = stopped.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, queue, handler, shutdown, stopped).await;
                })
            })
            .collect();

        Self {
            shutdown,
            stopped,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops every worker after its current event and waits for them.
    pub async fn shutdown(self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Event worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Event workers stopped");
    }
}

async fn worker_loop<E, H>(
    worker_id: usize,
    queue: Arc<EventQueue<E>>,
    handler: Arc<H>,
    shutdown: Arc<Notify>,
    stopped: Arc<AtomicBool>,
) where
    E: Send + 'static,
    H: EventHandler<E>,
{
    tracing::debug!("Worker {} started", worker_id);
    loop {
        let notified = shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = &mut notified => break,
            event = queue.extract() => match event {
                Some(event) => handler.handle(event),
                None => break,
            },
        }
    }
    tracing::debug!("Worker {} stopped", worker_id);
}

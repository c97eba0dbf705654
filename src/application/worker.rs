//! Bounded worker pool draining the delivery backlog.
//!
//! The consumer task feeds deliveries into an internal bounded channel;
//! a fixed number of worker tasks drain it and run the handler. This
//! caps concurrent ffmpeg and file I/O load while workers still suspend
//! independently of one another.

use crate::application::handler::ConversionHandler;
use crate::application::transcoder::TranscodeExecutor;
use crate::ports::queue::{InboundMessage, JobTransport};
use crate::ports::repository::{ErrorLog, ProcessedVideoStore};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// Deliveries buffered ahead of the workers before the consumer stops
/// pulling from the broker.
pub const BACKLOG_CAPACITY: usize = 64;

/// Worker pool processing conversion jobs.
pub struct WorkerPool<T, S, L, X> {
    handler: Arc<ConversionHandler<T, S, L, X>>,
    workers: usize,
}

impl<T, S, L, X> WorkerPool<T, S, L, X>
where
    T: JobTransport + 'static,
    S: ProcessedVideoStore + 'static,
    L: ErrorLog + 'static,
    X: TranscodeExecutor + 'static,
{
    pub fn new(handler: Arc<ConversionHandler<T, S, L, X>>, workers: usize) -> Self {
        Self { handler, workers }
    }

    /// Spawn the worker tasks. Returns the backlog sender the consumer
    /// feeds and the handles of all workers; the workers stop once the
    /// sender is dropped and the backlog runs dry.
    pub fn start(&self) -> (mpsc::Sender<InboundMessage>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(BACKLOG_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..self.workers)
            .map(|id| {
                let backlog = rx.clone();
                let handler = self.handler.clone();
                tokio::spawn(async move {
                    worker_loop(id, backlog, handler).await;
                })
            })
            .collect();

        (tx, handles)
    }
}

async fn worker_loop<T, S, L, X>(
    worker_id: usize,
    backlog: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    handler: Arc<ConversionHandler<T, S, L, X>>,
) where
    T: JobTransport,
    S: ProcessedVideoStore,
    L: ErrorLog,
    X: TranscodeExecutor,
{
    info!(worker_id, "worker started");

    loop {
        let message = backlog.lock().await.recv().await;
        match message {
            Some(message) => handler.handle(message).await,
            // Channel closed: the consumer is gone.
            None => break,
        }
    }

    info!(worker_id, "worker stopped");
}

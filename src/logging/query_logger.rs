//! Asynchronous query logging.
//!
//! Log entries flow through a bounded queue into a fixed pool of worker
//! tasks; the enqueue side never blocks a request handler. When the queue
//! is full the entry is dropped and counted, never waited on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::logging::query_log::QueryLog;
use crate::metrics::recorder;

/// Upper bound on a single storage write. A slow sink loses entries, it
/// never backs up the pipeline.
const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("storage sink failed: {0}")]
    Sink(String),
    #[error("storage sink timed out")]
    Timeout,
}

/// Where drained entries go. Storage internals (schema, batching) are the
/// implementor's business.
#[async_trait]
pub trait QueryLogSink: Send + Sync {
    async fn log_query(&self, entry: QueryLog) -> Result<(), LoggerError>;
}

pub struct QueryLogger {
    tx: std::sync::Mutex<Option<mpsc::Sender<QueryLog>>>,
    rx: Arc<Mutex<mpsc::Receiver<QueryLog>>>,
    sink: Arc<dyn QueryLogSink>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl QueryLogger {
    pub fn new(sink: Arc<dyn QueryLogSink>, capacity: usize, worker_count: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let logger = Arc::new(QueryLogger {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Arc::clone(&rx),
            sink: Arc::clone(&sink),
            workers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity,
        });

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = Arc::clone(&rx);
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move {
                Self::drain_worker(worker_id, rx, sink).await;
            }));
        }

        // Workers were just created, nothing contends for this lock yet.
        if let Ok(mut workers) = logger.workers.try_lock() {
            *workers = handles;
        }

        logger
    }

    pub fn with_defaults(sink: Arc<dyn QueryLogSink>) -> Arc<Self> {
        Self::new(sink, DEFAULT_CAPACITY, DEFAULT_WORKERS)
    }

    async fn drain_worker(
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<QueryLog>>>,
        sink: Arc<dyn QueryLogSink>,
    ) {
        loop {
            // Only the receive itself is serialized; the sink write below
            // runs with the lock released, so workers overlap on storage.
            let entry = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };

            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };

            Self::write_entry(&sink, entry).await;
        }

        debug!(worker_id, "query log worker stopped");
    }

    async fn write_entry(sink: &Arc<dyn QueryLogSink>, entry: QueryLog) {
        match timeout(SINK_WRITE_TIMEOUT, sink.log_query(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "query log write failed"),
            Err(_) => warn!("query log write timed out"),
        }
    }

    /// Non-blocking enqueue. A saturated queue drops the entry and
    /// increments the drop counter; the caller is never delayed.
    pub fn log_async(&self, entry: QueryLog) {
        let sent = {
            let tx = match self.tx.lock() {
                Ok(tx) => tx,
                Err(_) => return,
            };
            match tx.as_ref() {
                Some(tx) => {
                    let result = tx.try_send(entry);
                    recorder::query_log_buffered(self.capacity - tx.capacity());
                    result.is_ok()
                }
                None => false,
            }
        };

        if !sent {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            recorder::query_log_dropped();
        }
    }

    /// Number of entries discarded because the queue was full or closed.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shuts the logger down: closes the queue, waits for the workers,
    /// then drains anything the workers left behind straight to the
    /// sink. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender closes the channel; workers exit once the
        // backlog is empty.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }

        let handles = {
            let mut workers = self.workers.lock().await;
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "query log worker panicked");
            }
        }

        // Fresh drain pass, independent of whatever cancelled the
        // workers' surroundings.
        let mut rx = self.rx.lock().await;
        while let Ok(entry) = rx.try_recv() {
            Self::write_entry(&self.sink, entry).await;
        }
    }
}

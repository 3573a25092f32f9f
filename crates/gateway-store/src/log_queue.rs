//! Audit log queue (§5): multi-producer, single-consumer. Every request
//! path enqueues a `LogEntry`; a background task drains it in batches of
//! 100 or every 5 seconds, whichever comes first, and hands the batch to
//! a `LogSink` collaborator (the real deployment's database, the
//! reference implementation an in-memory buffer for tests).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_types::LogEntry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Backpressure bound: producers that outrun the consumer by this many
/// pending entries drop new entries rather than block the request path.
const CHANNEL_CAPACITY: usize = 10_000;

/// Collaborator seam for wherever audit log batches ultimately land (a
/// database table, a webhook relay, ...).
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, entries: Vec<LogEntry>);
}

/// Reference `LogSink`: keeps everything in memory, useful for tests and
/// for running the gateway standalone without a real log backend.
#[derive(Default)]
pub struct InMemoryLogSink {
    entries: parking_lot::Mutex<Vec<LogEntry>>,
}

impl InMemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogSink for InMemoryLogSink {
    async fn write_batch(&self, mut entries: Vec<LogEntry>) {
        self.entries.lock().append(&mut entries);
    }
}

/// Handle producers enqueue onto; cloning is cheap (an `mpsc::Sender`).
#[derive(Clone)]
pub struct LogQueue {
    sender: mpsc::Sender<LogEntry>,
}

impl LogQueue {
    /// Spawns the consumer task and returns the producer-facing handle
    /// plus a join handle for graceful shutdown (flush-then-stop).
    pub fn spawn(sink: Arc<dyn LogSink>) -> (Self, LogQueueWorker) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = LogQueueWorker { receiver, sink };
        (Self { sender }, worker)
    }

    /// Enqueues one entry. Never blocks the caller: if the channel is
    /// full the entry is dropped and a warning logged, since audit
    /// logging must never back-pressure the hot request path.
    pub fn enqueue(&self, entry: LogEntry) {
        if let Err(err) = self.sender.try_send(entry) {
            warn!(error = %err, "log queue full, dropping audit entry");
        }
    }
}

/// Owns the receiving half and drives the batch/flush loop. Run it with
/// [`LogQueueWorker::run`] on a spawned task.
pub struct LogQueueWorker {
    receiver: mpsc::Receiver<LogEntry>,
    sink: Arc<dyn LogSink>,
}

impl LogQueueWorker {
    /// Runs until the last `LogQueue` sender is dropped, flushing any
    /// partial batch before returning (shutdown sequence §9: "flush log
    /// queue, waiting up to 10s").
    pub fn run(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            loop {
                let flush_deadline = tokio::time::sleep(FLUSH_INTERVAL);
                tokio::pin!(flush_deadline);

                tokio::select! {
                    maybe_entry = self.receiver.recv() => {
                        match maybe_entry {
                            Some(entry) => {
                                batch.push(entry);
                                if batch.len() >= BATCH_SIZE {
                                    Self::flush(&self.sink, &mut batch).await;
                                }
                            }
                            None => {
                                Self::flush(&self.sink, &mut batch).await;
                                return;
                            }
                        }
                    }
                    () = &mut flush_deadline => {
                        Self::flush(&self.sink, &mut batch).await;
                    }
                }
            }
        })
    }

    async fn flush(sink: &Arc<dyn LogSink>, batch: &mut Vec<LogEntry>) {
        if batch.is_empty() {
            return;
        }
        let to_write = std::mem::take(batch);
        sink.write_batch(to_write).await;
    }
}

/// Best-effort bounded flush used during graceful shutdown: waits for the
/// worker task to drain, but gives up after `timeout` rather than hang
/// the shutdown sequence.
pub async fn shutdown_and_flush(queue: LogQueue, worker_handle: JoinHandle<()>, timeout: Duration) {
    drop(queue);
    if tokio::time::timeout(timeout, worker_handle).await.is_err() {
        error!("log queue did not flush within shutdown timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::LogAction;

    fn entry(n: u64) -> LogEntry {
        LogEntry {
            action: LogAction::RequestTool,
            user_id: Some("u1".into()),
            server_id: None,
            session_id: None,
            upstream_request_id: None,
            uniform_request_id: format!("req-{n}"),
            parent_uniform_request_id: None,
            ip: "127.0.0.1".into(),
            user_agent: None,
            token_mask: "abcd1234…abcd1234".into(),
            request_params: None,
            response_result: None,
            error: None,
            duration_ms: 1,
            status_code: 200,
        }
    }

    #[tokio::test]
    async fn flushes_on_batch_size() {
        let sink = Arc::new(InMemoryLogSink::new());
        let (queue, worker) = LogQueue::spawn(sink.clone());
        let handle = worker.run();

        for i in 0..BATCH_SIZE {
            queue.enqueue(entry(i as u64));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.len(), BATCH_SIZE);

        shutdown_and_flush(queue, handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn flushes_partial_batch_on_interval() {
        let sink = Arc::new(InMemoryLogSink::new());
        let (queue, worker) = LogQueue::spawn(sink.clone());
        let handle = worker.run();

        queue.enqueue(entry(1));
        queue.enqueue(entry(2));

        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(200)).await;
        assert_eq!(sink.len(), 2);

        shutdown_and_flush(queue, handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_entries() {
        let sink = Arc::new(InMemoryLogSink::new());
        let (queue, worker) = LogQueue::spawn(sink.clone());
        let handle = worker.run();

        queue.enqueue(entry(1));
        shutdown_and_flush(queue, handle, Duration::from_secs(1)).await;

        assert_eq!(sink.len(), 1);
    }
}

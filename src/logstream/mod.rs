//! Size-bounded, batching log writer streaming step output to the
//! aggregation service.
//!
//! A [`LogWriter`] is the output sink handed to the step executor. It splits
//! incoming chunks into lines, batches them, and flushes batches from one
//! background task on a debounce interval. The pending batch is
//! byte-bounded: once the budget is exceeded the oldest pending records are
//! evicted to restore the bound and live streaming is suspended, while the
//! full history keeps growing for the guaranteed upload on close. Log
//! delivery is best-effort throughout; it never blocks or fails pipeline
//! execution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use uuid::Uuid;

use crate::transport::OutputSink;

mod client;

pub use client::{LogClient, LogFuture, LogRecord, LogServiceError};

/// Default byte budget for the pending batch (5 MiB).
pub const DEFAULT_LIMIT: usize = 5_242_880;

/// Default debounce interval between batch flushes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Severity label applied to captured lines.
const LEVEL_INFO: &str = "info";

#[derive(Debug)]
struct WriterState {
    number: u64,
    size: usize,
    limit: usize,
    interval: Duration,
    pending: VecDeque<LogRecord>,
    history: Vec<LogRecord>,
    stopped: bool,
    closed: bool,
}

impl WriterState {
    fn new() -> Self {
        Self {
            number: 0,
            size: 0,
            limit: DEFAULT_LIMIT,
            interval: DEFAULT_INTERVAL,
            pending: VecDeque::new(),
            history: Vec::new(),
            stopped: false,
            closed: false,
        }
    }
}

struct Inner<C> {
    client: C,
    key: String,
    state: Mutex<WriterState>,
    ready_tx: mpsc::Sender<()>,
    close_tx: watch::Sender<bool>,
}

impl<C> Inner<C> {
    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Streams captured pipeline output to the log service.
///
/// Exactly two actors touch a writer: caller threads invoking
/// [`LogWriter::write`] / [`LogWriter::close`], and the one background flush
/// task spawned at construction. Shared state lives behind a single lock;
/// the pending-data wake is a single-slot mailbox that coalesces bursts.
pub struct LogWriter<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for LogWriter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: LogClient + 'static> LogWriter<C> {
    /// Opens the remote stream for `key` and starts the background flush
    /// task.
    ///
    /// A failed open is logged, not fatal: the writer proceeds in degraded,
    /// local-only mode and later delivery attempts surface their own errors.
    pub async fn open(client: C, key: impl Into<String>) -> Self {
        let key = key.into();
        if let Err(err) = client.open(&key).await {
            tracing::warn!(key = %key, error = %err, "failed to open log stream, continuing local-only");
        }
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            client,
            key,
            state: Mutex::new(WriterState::new()),
            ready_tx,
            close_tx,
        });
        tokio::spawn(flush_loop(Arc::clone(&inner), ready_rx, close_rx));
        Self { inner }
    }

    /// Opens a writer under a freshly generated stream key.
    pub async fn open_generated(client: C) -> Self {
        Self::open(client, Uuid::new_v4().to_string()).await
    }
}

impl<C: LogClient> LogWriter<C> {
    /// Returns the stream key identifying this writer.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Sets the pending-batch byte budget. Call before the first write;
    /// concurrent use afterwards is unsupported.
    pub fn set_limit(&self, limit: usize) {
        self.inner.lock_state().limit = limit;
    }

    /// Sets the flush debounce interval. Call before the first write;
    /// concurrent use afterwards is unsupported.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.lock_state().interval = interval;
    }

    /// Consumes one chunk of step output, returning the number of bytes
    /// accepted (always the full chunk).
    ///
    /// The chunk is echoed through `tracing` for operator visibility, then
    /// split into lines; a trailing line-feed stays attached to its line. A
    /// closed writer accepts and discards everything.
    pub fn write(&self, chunk: &[u8]) -> usize {
        let echoed = String::from_utf8_lossy(chunk);
        tracing::info!(target: "skiff::step_output", output = %echoed);

        let mut state = self.inner.lock_state();
        if state.closed {
            return chunk.len();
        }
        let mut evicted = false;
        for message in split_lines(chunk) {
            let line_len = message.len();
            while state.size + line_len > state.limit {
                // Budget exceeded: restore the bound and suspend streaming.
                // The history keeps every record for the final upload.
                state.stopped = true;
                evicted = true;
                let Some(oldest) = state.pending.pop_front() else {
                    break;
                };
                state.size -= oldest.message.len();
            }
            let record = LogRecord {
                number: state.number,
                message,
                timestamp: Utc::now(),
                level: LEVEL_INFO.to_owned(),
            };
            state.size += line_len;
            state.number += 1;
            if !state.stopped {
                state.pending.push_back(record.clone());
            }
            state.history.push(record);
        }
        drop(state);

        if evicted {
            // The flush task has nothing further to stream.
            self.inner.close_tx.send(true).ok();
        }
        // Coalesce wake-ups: a full mailbox means a flush is already due.
        self.inner.ready_tx.try_send(()).ok();
        chunk.len()
    }

    /// Closes the writer: stops the flush task, flushes any pending batch,
    /// uploads the complete history, and closes the remote stream.
    ///
    /// Only the first call performs work; later calls are no-ops returning
    /// `Ok`. The flush and channel-close legs are best-effort (logged);
    /// only the history upload error is surfaced so callers learn when the
    /// guaranteed full-history delivery failed.
    ///
    /// # Errors
    ///
    /// Returns [`LogServiceError`] when the full-history upload fails.
    pub async fn close(&self) -> Result<(), LogServiceError> {
        let pending: Vec<LogRecord> = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            Vec::from(std::mem::take(&mut state.pending))
        };
        self.inner.close_tx.send(true).ok();

        if !pending.is_empty() {
            if let Err(err) = self.inner.client.batch(&self.inner.key, &pending).await {
                tracing::warn!(key = %self.inner.key, error = %err, "failed to flush final batch");
            }
        }

        let upload_result = self.upload_history().await;
        if let Err(err) = &upload_result {
            tracing::warn!(key = %self.inner.key, error = %err, "failed to upload log history");
        }
        if let Err(err) = self.inner.client.close(&self.inner.key).await {
            tracing::warn!(key = %self.inner.key, error = %err, "failed to close log stream");
        }
        upload_result
    }

    /// Serializes the full history (one JSON record per line) and uploads it.
    async fn upload_history(&self) -> Result<(), LogServiceError> {
        let encoded = {
            let state = self.inner.lock_state();
            encode_history(state.history.iter())?
        };
        self.inner.client.upload(&self.inner.key, &encoded).await
    }
}

impl<C: LogClient> OutputSink for LogWriter<C> {
    fn write_chunk(&self, chunk: &[u8]) {
        self.write(chunk);
    }
}

/// Splits a chunk into lines, keeping each line's trailing line-feed.
///
/// Remote shells may buffer and hand over several source lines in one
/// chunk, so one write call can produce multiple records.
fn split_lines(chunk: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(chunk);
    let mut lines = Vec::new();
    let mut rest: &str = text.as_ref();
    while let Some(pos) = rest.find('\n') {
        let (line, tail) = rest.split_at(pos + 1);
        lines.push(line.to_owned());
        rest = tail;
    }
    if !rest.is_empty() || lines.is_empty() {
        lines.push(rest.to_owned());
    }
    lines
}

fn encode_history<'a>(
    records: impl Iterator<Item = &'a LogRecord>,
) -> Result<Vec<u8>, LogServiceError> {
    let mut encoded = Vec::new();
    for record in records {
        let mut line = serde_json::to_vec(record).map_err(|err| LogServiceError::Encode {
            message: err.to_string(),
        })?;
        line.push(b'\n');
        encoded.extend_from_slice(&line);
    }
    Ok(encoded)
}

/// Background flush task: waits for a pending-data wake, debounces by the
/// configured interval, then delivers the pending batch. Close wins every
/// race so no batch is sent after the close signal.
async fn flush_loop<C: LogClient>(
    inner: Arc<Inner<C>>,
    mut ready_rx: mpsc::Receiver<()>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = close_rx.changed() => return,
            woken = ready_rx.recv() => {
                if woken.is_none() {
                    return;
                }
                let interval = inner.lock_state().interval;
                tokio::select! {
                    biased;
                    _ = close_rx.changed() => return,
                    () = sleep(interval) => flush_pending(&inner).await,
                }
            }
        }
    }
}

/// Delivers the pending batch, logging and discarding any error: log
/// streams are ephemeral and never fail the pipeline.
async fn flush_pending<C: LogClient>(inner: &Inner<C>) {
    let pending = Vec::from(std::mem::take(&mut inner.lock_state().pending));
    if pending.is_empty() {
        return;
    }
    if let Err(err) = inner.client.batch(&inner.key, &pending).await {
        tracing::warn!(key = %inner.key, error = %err, "failed to stream log batch");
    }
}

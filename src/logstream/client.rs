//! Log-aggregation service SPI and the record wire type.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One captured output line.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogRecord {
    /// Sequence number, strictly increasing per writer.
    pub number: u64,
    /// Line text, including any trailing line-feed from the source.
    pub message: String,
    /// Capture time, serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,
    /// Severity label.
    pub level: String,
}

/// Errors raised by the log service or while encoding records for it.
///
/// Deliveries are best-effort: the writer logs and swallows these; only the
/// final upload error is surfaced from close.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LogServiceError {
    /// Raised when a service request fails.
    #[error("log service request failed: {message}")]
    Request {
        /// Underlying failure description.
        message: String,
    },
    /// Raised when a record cannot be encoded for upload.
    #[error("failed to encode log record: {message}")]
    Encode {
        /// Encoder error message.
        message: String,
    },
}

/// Future returned by log service operations.
pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LogServiceError>> + Send + 'a>>;

/// Minimal interface implemented by log-aggregation clients.
///
/// `upload` receives the full history serialized as one JSON-encoded record
/// per line, concatenated.
pub trait LogClient: Send + Sync {
    /// Opens the stream identified by `key`.
    fn open<'a>(&'a self, key: &'a str) -> LogFuture<'a, ()>;

    /// Closes the stream identified by `key`.
    fn close<'a>(&'a self, key: &'a str) -> LogFuture<'a, ()>;

    /// Delivers one batch of live records.
    fn batch<'a>(&'a self, key: &'a str, records: &'a [LogRecord]) -> LogFuture<'a, ()>;

    /// Stores the complete serialized history for the stream.
    fn upload<'a>(&'a self, key: &'a str, history: &'a [u8]) -> LogFuture<'a, ()>;
}

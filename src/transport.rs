//! Remote execution transport SPI.
//!
//! The engine drives remote machines through these traits instead of a
//! concrete secure-shell implementation. A [`Transport`] dials a machine and
//! yields a [`RemoteClient`]; the client opens command sessions and a
//! file-transfer sub-channel over the same connection. Session methods take
//! `&self` so a long-running command can be raced against cancellation while
//! a kill signal is sent on the same handle.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Errors raised by transport operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the remote machine cannot be reached.
    #[error("failed to dial {addr}: {message}")]
    Dial {
        /// Address that was dialled.
        addr: String,
        /// Underlying failure description.
        message: String,
    },
    /// Raised when a command session cannot be opened or fails mid-flight
    /// without a structured exit status.
    #[error("session error: {message}")]
    Session {
        /// Underlying failure description.
        message: String,
    },
    /// Raised when the file-transfer sub-channel fails.
    #[error("file transfer failed for {path}: {message}")]
    FileTransfer {
        /// Remote path being written.
        path: String,
        /// Underlying failure description.
        message: String,
    },
    /// Structured exit status reported for a completed remote command.
    #[error("remote command exited with status {0}")]
    ExitStatus(i32),
    /// Raised when a kill signal cannot be delivered.
    #[error("failed to signal remote process: {message}")]
    Signal {
        /// Underlying failure description.
        message: String,
    },
    /// Raised when the caller's cancellation fired before the operation
    /// completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Connection parameters for one remote machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DialTarget {
    /// Address of the machine.
    pub ip: String,
    /// Login user.
    pub user: String,
    /// Private key authenticating the connection.
    pub private_key: String,
}

impl DialTarget {
    /// Creates a dial target.
    #[must_use]
    pub fn new(
        ip: impl Into<String>,
        user: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            user: user.into(),
            private_key: private_key.into(),
        }
    }
}

/// Signal deliverable to a remote process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
    /// Forceful termination. Many remote-shell servers do not honour this;
    /// delivery is best-effort.
    Kill,
}

/// Sink for remote process output.
///
/// Implementations must be internally synchronized: the transport may call
/// [`OutputSink::write_chunk`] from its own streaming task. A single chunk
/// may bundle several source lines.
pub trait OutputSink: Send + Sync {
    /// Consumes one chunk of combined stdout/stderr output.
    fn write_chunk(&self, chunk: &[u8]);
}

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Dials remote machines.
pub trait Transport: Send + Sync {
    /// Connected client handle produced by a successful dial.
    type Client: RemoteClient;

    /// Establishes a connection to the target. No retry; see
    /// [`dial_with_retry`] for the backoff variant used during setup.
    fn dial<'a>(&'a self, target: &'a DialTarget) -> TransportFuture<'a, Self::Client>;
}

/// A live connection to one remote machine.
pub trait RemoteClient: Send + Sync {
    /// Command session type.
    type Session: CommandSession;
    /// File-transfer sub-channel type.
    type Files: FileTransfer;

    /// Opens a command session over the connection.
    fn open_session(&self) -> TransportFuture<'_, Self::Session>;

    /// Opens the file-transfer sub-channel over the same connection.
    fn open_files(&self) -> TransportFuture<'_, Self::Files>;
}

/// One remote command execution.
pub trait CommandSession: Send + Sync {
    /// Runs `command`, streaming combined stdout and stderr into `output`.
    ///
    /// Resolves `Ok(())` for a zero exit, `Err(TransportError::ExitStatus)`
    /// when the remote process exits nonzero, and any other error when the
    /// transport failed without observing an exit status.
    fn run<'a>(
        &'a self,
        command: &'a str,
        output: &'a dyn OutputSink,
    ) -> TransportFuture<'a, ()>;

    /// Best-effort delivery of a signal to the remote process.
    fn signal(&self, signal: Signal) -> TransportFuture<'_, ()>;
}

/// File and directory staging over the connection.
///
/// `upload` folds the wire-level create, write, and chmod sequence into one
/// operation; `mkdir_all` creates missing parents and applies the mode to the
/// leaf directory.
pub trait FileTransfer: Send + Sync {
    /// Writes `data` to `path` and applies `mode`.
    fn upload<'a>(
        &'a self,
        path: &'a Utf8Path,
        data: &'a [u8],
        mode: u32,
    ) -> TransportFuture<'a, ()>;

    /// Creates `path` (and missing parents) and applies `mode`.
    fn mkdir_all<'a>(&'a self, path: &'a Utf8Path, mode: u32) -> TransportFuture<'a, ()>;
}

/// Backoff policy for [`dial_with_retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of dial attempts.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Dials with backoff until the machine responds, the attempts are
/// exhausted, or the caller's cancellation fires.
///
/// Freshly provisioned machines take a while to accept connections, so each
/// failed attempt is logged at debug level and retried after the policy's
/// backoff.
///
/// # Errors
///
/// Returns the last dial error on exhaustion, or
/// [`TransportError::Cancelled`] when cancellation fires first.
pub async fn dial_with_retry<T: Transport>(
    transport: &T,
    target: &DialTarget,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<T::Client, TransportError> {
    let mut last_error = TransportError::Dial {
        addr: target.ip.clone(),
        message: "no dial attempts were made".to_owned(),
    };
    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match transport.dial(target).await {
            Ok(client) => return Ok(client),
            Err(err) => {
                tracing::debug!(ip = %target.ip, attempt, error = %err, "dial attempt failed");
                last_error = err;
            }
        }
        if attempt < policy.attempts {
            tokio::select! {
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = sleep(policy.backoff) => {}
            }
        }
    }
    Err(last_error)
}

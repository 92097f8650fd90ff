//! Error types for lifecycle and step-execution operations.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the engine, generic over the provider's error type.
///
/// A nonzero step exit is *not* an error: it is captured in
/// [`crate::spec::State::exit_code`] and `run` reports success. Log-delivery
/// and pool-replenishment failures are logged and swallowed, never surfaced
/// here.
#[derive(Debug, Error)]
pub enum EngineError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when provisioning a new instance fails. No instance exists;
    /// there is nothing to clean up.
    #[error("failed to provision instance: {0}")]
    Provision(#[source] E),
    /// Raised when the bound instance cannot be destroyed.
    #[error("failed to destroy instance {instance_id}: {source}")]
    Destroy {
        /// Identifier of the instance that could not be destroyed.
        instance_id: String,
        /// Provider-specific error.
        #[source]
        source: E,
    },
    /// Raised when the remote shell or one of its sub-channels cannot be
    /// established. The instance may be live; destroying it is the caller's
    /// decision.
    #[error("connectivity failure for {addr}: {source}")]
    Connectivity {
        /// Address of the unreachable instance.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when a workspace directory or file cannot be staged. The
    /// instance stays live and half-configured; only an explicit destroy
    /// removes it.
    #[error("failed to stage {path}: {source}")]
    Staging {
        /// Remote path that could not be staged.
        path: Utf8PathBuf,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when the container-network bootstrap command fails. Same
    /// residual-instance risk as staging failures.
    #[error("container network bootstrap failed ({command}): {source}")]
    NetworkBootstrap {
        /// Command that failed on the remote machine.
        command: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Raised when an operation needs a bound instance but setup never
    /// completed for the spec.
    #[error("resource spec has no bound instance")]
    NotBound,
    /// Raised when the caller's cancellation fired before the operation
    /// completed. Step cancellation sends one best-effort remote kill.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> EngineError<E>
where
    E: std::error::Error + 'static,
{
    /// Maps a transport failure for `addr`, routing cancellation to its own
    /// variant.
    pub(crate) fn connectivity(addr: impl Into<String>, source: TransportError) -> Self {
        match source {
            TransportError::Cancelled => Self::Cancelled,
            other => Self::Connectivity {
                addr: addr.into(),
                source: other,
            },
        }
    }

    /// Maps a staging failure for `path`.
    pub(crate) fn staging(path: impl Into<Utf8PathBuf>, source: TransportError) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }
}

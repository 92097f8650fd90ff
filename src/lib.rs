//! Core library for the Skiff pipeline runner.
//!
//! The crate exposes an engine that owns the lifecycle of ephemeral remote
//! compute for CI pipelines (provision or reserve → stage → execute steps →
//! destroy), a pool coordinator that keeps warm instances ready, and a
//! batching log writer that streams step output to an aggregation service.
//! Cloud providers and the remote-shell transport plug in behind traits.

pub mod config;
pub mod engine;
pub mod logstream;
pub mod pool;
pub mod provider;
pub mod spec;
pub mod test_support;
pub mod transport;

pub use config::{ConfigError, RunnerConfig};
pub use engine::{Engine, EngineError, EngineOptions};
pub use logstream::{LogClient, LogRecord, LogServiceError, LogWriter};
pub use pool::{Pool, PoolCoordinator};
pub use provider::{Credentials, Instance, ProvisionArgs, Provisioner};
pub use spec::{
    FileEntry, ResourceSpec, ResourceSpecBuilder, Secret, SecretValue, SpecError, State, StepSpec,
};
pub use transport::{
    CommandSession, DialTarget, FileTransfer, OutputSink, RemoteClient, RetryPolicy, Signal,
    Transport, TransportError,
};

//! Test support: scripted fakes for the provider, transport, and log
//! service seams, shared across unit and integration tests.
//!
//! Fakes return pre-seeded outcomes in FIFO order and record every
//! invocation so tests can assert on call sequences without touching a
//! network.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::logstream::{LogClient, LogFuture, LogRecord, LogServiceError};
use crate::provider::{Credentials, Instance, ProviderFuture, ProvisionArgs, Provisioner};
use crate::transport::{
    CommandSession, DialTarget, FileTransfer, OutputSink, RemoteClient, Signal, Transport,
    TransportError, TransportFuture,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error type returned by [`FakeProvisioner`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct FakeProviderError(pub String);

#[derive(Debug, Default)]
struct FakeProvisionerState {
    reservations: VecDeque<Result<Option<Instance>, String>>,
    create_results: VecDeque<Result<Instance, String>>,
    destroy_results: VecDeque<Result<(), String>>,
    ping_results: VecDeque<Result<(), String>>,
    count_results: VecDeque<Result<usize, String>>,
    free_counts: BTreeMap<String, usize>,
    created: Vec<ProvisionArgs>,
    destroyed: Vec<Instance>,
    pings: usize,
    create_sequence: usize,
}

/// Scripted compute provider.
///
/// Unscripted calls fall back to benign defaults: reservations find
/// nothing, creates mint sequentially numbered instances, destroys and
/// pings succeed, and free counts come from
/// [`FakeProvisioner::set_free_count`].
#[derive(Clone, Debug, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<FakeProvisionerState>>,
}

impl FakeProvisioner {
    /// Creates a provider with no scripted outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reservation outcome.
    pub fn push_reservation(&self, found: Option<Instance>) {
        lock(&self.state).reservations.push_back(Ok(found));
    }

    /// Queues a reservation failure.
    pub fn push_reservation_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .reservations
            .push_back(Err(message.into()));
    }

    /// Queues a successful create returning `instance`.
    pub fn push_create(&self, instance: Instance) {
        lock(&self.state).create_results.push_back(Ok(instance));
    }

    /// Queues a create failure.
    pub fn push_create_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .create_results
            .push_back(Err(message.into()));
    }

    /// Queues a destroy failure.
    pub fn push_destroy_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .destroy_results
            .push_back(Err(message.into()));
    }

    /// Queues a ping failure.
    pub fn push_ping_error(&self, message: impl Into<String>) {
        lock(&self.state).ping_results.push_back(Err(message.into()));
    }

    /// Queues a free-count failure.
    pub fn push_count_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .count_results
            .push_back(Err(message.into()));
    }

    /// Sets the free count reported for `pool_name`.
    pub fn set_free_count(&self, pool_name: impl Into<String>, count: usize) {
        lock(&self.state).free_counts.insert(pool_name.into(), count);
    }

    /// Returns every provisioning argument set passed to create.
    #[must_use]
    pub fn created(&self) -> Vec<ProvisionArgs> {
        lock(&self.state).created.clone()
    }

    /// Returns every instance passed to destroy.
    #[must_use]
    pub fn destroyed(&self) -> Vec<Instance> {
        lock(&self.state).destroyed.clone()
    }

    /// Returns how many health probes were made.
    #[must_use]
    pub fn ping_calls(&self) -> usize {
        lock(&self.state).pings
    }
}

impl Provisioner for FakeProvisioner {
    type Error = FakeProviderError;

    fn create<'a>(
        &'a self,
        _creds: &'a Credentials,
        args: &'a ProvisionArgs,
    ) -> ProviderFuture<'a, Instance, Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.created.push(args.clone());
            match state.create_results.pop_front() {
                Some(Ok(instance)) => Ok(instance),
                Some(Err(message)) => Err(FakeProviderError(message)),
                None => {
                    state.create_sequence += 1;
                    let n = state.create_sequence;
                    Ok(Instance::new(format!("i-fake-{n}"), format!("10.0.0.{n}")))
                }
            }
        })
    }

    fn destroy<'a>(
        &'a self,
        _creds: &'a Credentials,
        instance: &'a Instance,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.destroyed.push(instance.clone());
            match state.destroy_results.pop_front() {
                Some(Err(message)) => Err(FakeProviderError(message)),
                _ => Ok(()),
            }
        })
    }

    fn ping<'a>(&'a self, _creds: &'a Credentials) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.pings += 1;
            match state.ping_results.pop_front() {
                Some(Err(message)) => Err(FakeProviderError(message)),
                _ => Ok(()),
            }
        })
    }

    fn try_reserve<'a>(
        &'a self,
        _creds: &'a Credentials,
        _pool_name: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, Self::Error> {
        Box::pin(async move {
            match lock(&self.state).reservations.pop_front() {
                Some(Ok(found)) => Ok(found),
                Some(Err(message)) => Err(FakeProviderError(message)),
                None => Ok(None),
            }
        })
    }

    fn count_free<'a>(
        &'a self,
        _creds: &'a Credentials,
        pool_name: &'a str,
    ) -> ProviderFuture<'a, usize, Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            match state.count_results.pop_front() {
                Some(Ok(count)) => Ok(count),
                Some(Err(message)) => Err(FakeProviderError(message)),
                None => Ok(state.free_counts.get(pool_name).copied().unwrap_or(0)),
            }
        })
    }
}

/// Scripted outcome for one remote command session.
#[derive(Clone, Debug)]
pub enum SessionScript {
    /// Command completes with the given exit code (zero resolves `Ok`).
    Exit(i32),
    /// Command fails without a structured exit status.
    Fail(String),
    /// Command streams the given chunks into the sink, then exits.
    Output {
        /// Chunks delivered to the output sink in order.
        chunks: Vec<Vec<u8>>,
        /// Exit code reported afterwards.
        exit: i32,
    },
    /// Command never completes; exercises cancellation races.
    Pending,
}

/// One recorded file upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadRecord {
    /// Remote path written.
    pub path: Utf8PathBuf,
    /// Bytes written.
    pub data: Vec<u8>,
    /// Permission mode applied.
    pub mode: u32,
}

#[derive(Debug, Default)]
struct FakeTransportState {
    dial_results: VecDeque<Result<(), String>>,
    session_open_results: VecDeque<Result<(), String>>,
    files_open_results: VecDeque<Result<(), String>>,
    session_scripts: VecDeque<SessionScript>,
    upload_results: VecDeque<Result<(), String>>,
    mkdir_results: VecDeque<Result<(), String>>,
    dialed: Vec<DialTarget>,
    commands: Vec<String>,
    signals: Vec<Signal>,
    uploads: Vec<UploadRecord>,
    mkdirs: Vec<(Utf8PathBuf, u32)>,
}

/// Scripted remote-shell transport.
///
/// Unscripted dials, channel opens, uploads, and directory creations
/// succeed; unscripted command runs exit zero.
#[derive(Clone, Debug, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FakeTransport {
    /// Creates a transport with no scripted outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a dial failure.
    pub fn push_dial_error(&self, message: impl Into<String>) {
        lock(&self.state).dial_results.push_back(Err(message.into()));
    }

    /// Queues a dial success.
    pub fn push_dial_success(&self) {
        lock(&self.state).dial_results.push_back(Ok(()));
    }

    /// Queues a session-open failure.
    pub fn push_session_open_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .session_open_results
            .push_back(Err(message.into()));
    }

    /// Queues a file-channel-open failure.
    pub fn push_files_open_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .files_open_results
            .push_back(Err(message.into()));
    }

    /// Queues the outcome of the next command run.
    pub fn push_session(&self, script: SessionScript) {
        lock(&self.state).session_scripts.push_back(script);
    }

    /// Queues an upload failure.
    pub fn push_upload_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .upload_results
            .push_back(Err(message.into()));
    }

    /// Queues an upload success.
    pub fn push_upload_success(&self) {
        lock(&self.state).upload_results.push_back(Ok(()));
    }

    /// Queues a directory-creation failure.
    pub fn push_mkdir_error(&self, message: impl Into<String>) {
        lock(&self.state)
            .mkdir_results
            .push_back(Err(message.into()));
    }

    /// Returns every dial target attempted.
    #[must_use]
    pub fn dialed(&self) -> Vec<DialTarget> {
        lock(&self.state).dialed.clone()
    }

    /// Returns every command executed through a session.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Returns every signal sent to a session.
    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        lock(&self.state).signals.clone()
    }

    /// Returns every recorded upload.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadRecord> {
        lock(&self.state).uploads.clone()
    }

    /// Returns every directory created, with its mode.
    #[must_use]
    pub fn mkdirs(&self) -> Vec<(Utf8PathBuf, u32)> {
        lock(&self.state).mkdirs.clone()
    }
}

impl Transport for FakeTransport {
    type Client = FakeClient;

    fn dial<'a>(&'a self, target: &'a DialTarget) -> TransportFuture<'a, Self::Client> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.dialed.push(target.clone());
            match state.dial_results.pop_front() {
                Some(Err(message)) => Err(TransportError::Dial {
                    addr: target.ip.clone(),
                    message,
                }),
                _ => Ok(FakeClient {
                    state: Arc::clone(&self.state),
                }),
            }
        })
    }
}

/// Connected client handle produced by [`FakeTransport`].
#[derive(Clone, Debug)]
pub struct FakeClient {
    state: Arc<Mutex<FakeTransportState>>,
}

impl RemoteClient for FakeClient {
    type Session = FakeSession;
    type Files = FakeFiles;

    fn open_session(&self) -> TransportFuture<'_, Self::Session> {
        Box::pin(async move {
            match lock(&self.state).session_open_results.pop_front() {
                Some(Err(message)) => Err(TransportError::Session { message }),
                _ => Ok(FakeSession {
                    state: Arc::clone(&self.state),
                }),
            }
        })
    }

    fn open_files(&self) -> TransportFuture<'_, Self::Files> {
        Box::pin(async move {
            match lock(&self.state).files_open_results.pop_front() {
                Some(Err(message)) => Err(TransportError::Session { message }),
                _ => Ok(FakeFiles {
                    state: Arc::clone(&self.state),
                }),
            }
        })
    }
}

/// Command session produced by [`FakeClient`].
#[derive(Clone, Debug)]
pub struct FakeSession {
    state: Arc<Mutex<FakeTransportState>>,
}

impl CommandSession for FakeSession {
    fn run<'a>(&'a self, command: &'a str, output: &'a dyn OutputSink) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let script = {
                let mut state = lock(&self.state);
                state.commands.push(command.to_owned());
                state
                    .session_scripts
                    .pop_front()
                    .unwrap_or(SessionScript::Exit(0))
            };
            match script {
                SessionScript::Exit(0) => Ok(()),
                SessionScript::Exit(code) => Err(TransportError::ExitStatus(code)),
                SessionScript::Fail(message) => Err(TransportError::Session { message }),
                SessionScript::Output { chunks, exit } => {
                    for chunk in chunks {
                        output.write_chunk(&chunk);
                    }
                    if exit == 0 {
                        Ok(())
                    } else {
                        Err(TransportError::ExitStatus(exit))
                    }
                }
                SessionScript::Pending => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        })
    }

    fn signal(&self, signal: Signal) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.state).signals.push(signal);
            Ok(())
        })
    }
}

/// File-transfer sub-channel produced by [`FakeClient`].
#[derive(Clone, Debug)]
pub struct FakeFiles {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FileTransfer for FakeFiles {
    fn upload<'a>(
        &'a self,
        path: &'a Utf8Path,
        data: &'a [u8],
        mode: u32,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.uploads.push(UploadRecord {
                path: path.to_owned(),
                data: data.to_vec(),
                mode,
            });
            match state.upload_results.pop_front() {
                Some(Err(message)) => Err(TransportError::FileTransfer {
                    path: path.to_string(),
                    message,
                }),
                _ => Ok(()),
            }
        })
    }

    fn mkdir_all<'a>(&'a self, path: &'a Utf8Path, mode: u32) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.mkdirs.push((path.to_owned(), mode));
            match state.mkdir_results.pop_front() {
                Some(Err(message)) => Err(TransportError::FileTransfer {
                    path: path.to_string(),
                    message,
                }),
                _ => Ok(()),
            }
        })
    }
}

#[derive(Debug, Default)]
struct RecordingLogClientState {
    opens: Vec<String>,
    closes: Vec<String>,
    batches: Vec<Vec<LogRecord>>,
    uploads: Vec<Vec<u8>>,
    open_error: Option<String>,
    close_error: Option<String>,
    batch_error: Option<String>,
    upload_error: Option<String>,
}

/// Log-service client that records every call; individual operations can
/// be scripted to fail persistently.
#[derive(Clone, Debug, Default)]
pub struct RecordingLogClient {
    state: Arc<Mutex<RecordingLogClientState>>,
}

impl RecordingLogClient {
    /// Creates a client that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every open call fail with `message`.
    pub fn fail_open(&self, message: impl Into<String>) {
        lock(&self.state).open_error = Some(message.into());
    }

    /// Makes every close call fail with `message`.
    pub fn fail_close(&self, message: impl Into<String>) {
        lock(&self.state).close_error = Some(message.into());
    }

    /// Makes every batch call fail with `message`.
    pub fn fail_batch(&self, message: impl Into<String>) {
        lock(&self.state).batch_error = Some(message.into());
    }

    /// Makes every upload call fail with `message`.
    pub fn fail_upload(&self, message: impl Into<String>) {
        lock(&self.state).upload_error = Some(message.into());
    }

    /// Returns the keys passed to open.
    #[must_use]
    pub fn opens(&self) -> Vec<String> {
        lock(&self.state).opens.clone()
    }

    /// Returns the keys passed to close.
    #[must_use]
    pub fn closes(&self) -> Vec<String> {
        lock(&self.state).closes.clone()
    }

    /// Returns every delivered batch.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<LogRecord>> {
        lock(&self.state).batches.clone()
    }

    /// Returns every uploaded history payload.
    #[must_use]
    pub fn uploads(&self) -> Vec<Vec<u8>> {
        lock(&self.state).uploads.clone()
    }
}

fn scripted_error(error: Option<&String>) -> Result<(), LogServiceError> {
    error.map_or(Ok(()), |message| {
        Err(LogServiceError::Request {
            message: message.clone(),
        })
    })
}

impl LogClient for RecordingLogClient {
    fn open<'a>(&'a self, key: &'a str) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.opens.push(key.to_owned());
            scripted_error(state.open_error.as_ref())
        })
    }

    fn close<'a>(&'a self, key: &'a str) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.closes.push(key.to_owned());
            scripted_error(state.close_error.as_ref())
        })
    }

    fn batch<'a>(&'a self, _key: &'a str, records: &'a [LogRecord]) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.batches.push(records.to_vec());
            scripted_error(state.batch_error.as_ref())
        })
    }

    fn upload<'a>(&'a self, _key: &'a str, history: &'a [u8]) -> LogFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.uploads.push(history.to_vec());
            scripted_error(state.upload_error.as_ref())
        })
    }
}

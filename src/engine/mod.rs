//! Instance lifecycle manager and remote step executor.
//!
//! The engine owns the full lifecycle of one pipeline's remote machine:
//! [`Engine::setup`] provisions (or reserves from a pool) and stages it,
//! [`Engine::run`] executes steps inside it, and [`Engine::destroy`] tears
//! it down and replenishes the pool when needed. Operations are synchronous
//! from the caller's point of view; the only internal parallelism is the
//! detached pool-replenishment task spawned by destroy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::pool::{Pool, PoolCoordinator};
use crate::provider::{Credentials, Instance, ProvisionArgs, Provisioner};
use crate::spec::{OsFamily, ResourceSpec};
use crate::transport::{
    CommandSession, FileTransfer, OutputSink, RemoteClient, RetryPolicy, Transport,
    dial_with_retry,
};

mod error;
mod run;

pub use error::EngineError;

/// Tag recording which engine provisioned an instance.
pub const TAG_RUNNER: &str = "runner";
/// Tag recording the pool an instance belongs to.
pub const TAG_POOL: &str = "pool";
/// Tag recording the runner deployment that created an instance.
pub const TAG_CREATOR: &str = "creator";
/// Tag marking a pool instance as claimed by an in-flight build.
pub const TAG_STATUS: &str = "status";
/// Value of [`TAG_STATUS`] while a build holds the instance.
pub const STATUS_IN_PROGRESS: &str = "build in progress";
/// Value of [`TAG_RUNNER`] stamped on every provisioned instance.
pub const RUNNER_IDENTITY: &str = "skiff";

/// Default warm-up delay before the container-network bootstrap command.
pub const DEFAULT_WARMUP_DELAY: Duration = Duration::from_secs(80);

/// Engine-wide options shared by every lifecycle operation.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Identity of this runner deployment, stamped into instance tags.
    pub runner_name: String,
    /// Pool definitions keyed by pool name.
    pub pools: BTreeMap<String, Pool>,
    /// Backoff policy for the post-provision dial.
    pub retry: RetryPolicy,
    /// Fixed delay before the container-network command. A known, imprecise
    /// readiness proxy for the remote container runtime.
    pub warmup_delay: Duration,
}

impl EngineOptions {
    /// Creates options with default retry and warm-up settings.
    #[must_use]
    pub fn new(runner_name: impl Into<String>) -> Self {
        Self {
            runner_name: runner_name.into(),
            pools: BTreeMap::new(),
            retry: RetryPolicy::default(),
            warmup_delay: DEFAULT_WARMUP_DELAY,
        }
    }

    /// Registers a pool definition.
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, pool: Pool) -> Self {
        self.pools.insert(name.into(), pool);
        self
    }

    /// Overrides the dial retry policy.
    ///
    /// This is primarily used by tests to keep failure scenarios fast.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the warm-up delay.
    ///
    /// This is primarily used by tests to keep setup scenarios fast.
    #[must_use]
    pub const fn with_warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay = delay;
        self
    }
}

struct EngineInner<P, T> {
    provider: P,
    transport: T,
    coordinator: PoolCoordinator,
    options: EngineOptions,
}

/// Pipeline engine for ephemeral remote compute.
///
/// Cheap to clone; clones share the provider, transport, pool coordinator,
/// and options.
pub struct Engine<P, T> {
    inner: Arc<EngineInner<P, T>>,
}

impl<P, T> Clone for Engine<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, T> Engine<P, T>
where
    P: Provisioner + 'static,
    T: Transport + 'static,
{
    /// Creates an engine over the given provider and transport.
    #[must_use]
    pub fn new(provider: P, transport: T, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                provider,
                transport,
                coordinator: PoolCoordinator::new(),
                options,
            }),
        }
    }

    /// Returns the options the engine was built with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Sets up the pipeline environment described by `spec`, binding the
    /// realized instance into it.
    ///
    /// Pool-backed specs first try to reserve a warm instance; reservation
    /// errors are logged and fall through to ad-hoc provisioning. A freshly
    /// provisioned machine is dialled with retry, staged with the workspace
    /// and spec files, and bootstrapped with a container network.
    ///
    /// Setup performs no rollback: a failure after provisioning leaves a
    /// live, partially configured instance that only an explicit
    /// [`Engine::destroy`] removes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when provisioning, connectivity, staging, or
    /// the network bootstrap fail, or when cancellation fires first.
    pub async fn setup(
        &self,
        spec: &mut ResourceSpec,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError<P::Error>> {
        if spec.use_pool {
            match self
                .inner
                .coordinator
                .try_reserve(&self.inner.provider, &spec.account, &spec.pool_name)
                .await
            {
                Ok(Some(instance)) => {
                    tracing::debug!(
                        image = %spec.image,
                        id = %instance.id,
                        ip = %instance.ip,
                        "using pooled instance"
                    );
                    spec.instance = Some(instance);
                    return Ok(());
                }
                Ok(None) => {
                    tracing::debug!(
                        image = %spec.image,
                        pool = %spec.pool_name,
                        "pool empty, provisioning ad-hoc instance"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        image = %spec.image,
                        pool = %spec.pool_name,
                        error = %err,
                        "pool reservation failed, provisioning ad-hoc instance"
                    );
                }
            }
        }

        self.merge_bookkeeping_tags(spec);
        let args = provision_args(spec);

        tracing::debug!(image = %spec.image, "creating instance");
        let instance = self
            .inner
            .provider
            .create(&spec.account, &args)
            .await
            .map_err(EngineError::Provision)?;
        tracing::info!(id = %instance.id, ip = %instance.ip, "created instance");
        spec.instance = Some(instance.clone());

        let client = self.dial_new_instance(spec, &instance, cancel).await?;
        self.stage_workspace(spec, &instance, &client).await?;
        self.bootstrap_network(spec, &instance, &client).await?;

        tracing::info!(id = %instance.id, ip = %instance.ip, "server configuration complete");
        Ok(())
    }

    /// Destroys the instance bound to `spec` and, for pool-backed specs,
    /// replenishes the pool when it has dropped below its target size.
    ///
    /// Replenishment runs as a detached task using the pool's template spec;
    /// its failures (and free-count errors) are logged only. Destroy reports
    /// success once the provider's destroy call succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotBound`] when setup never bound an instance,
    /// or [`EngineError::Destroy`] when the provider's destroy call fails —
    /// in which case no replenishment is attempted.
    pub async fn destroy(&self, spec: &ResourceSpec) -> Result<(), EngineError<P::Error>> {
        let instance = spec.instance.as_ref().ok_or(EngineError::NotBound)?;
        tracing::debug!(image = %spec.image, id = %instance.id, "destroying instance");
        self.inner
            .provider
            .destroy(&spec.account, instance)
            .await
            .map_err(|source| EngineError::Destroy {
                instance_id: instance.id.clone(),
                source,
            })?;

        if spec.use_pool {
            self.replenish_pool(spec).await;
        }
        Ok(())
    }

    /// Probes provider liveness.
    ///
    /// # Errors
    ///
    /// Returns the provider's error unmodified.
    pub async fn ping(&self, creds: &Credentials) -> Result<(), P::Error> {
        self.inner.provider.ping(creds).await
    }

    /// Merges runner identity, pool membership, and creator tags into the
    /// spec. Pool-backed instances also get the in-progress marker so a
    /// concurrent reservation cannot claim them while this build runs.
    fn merge_bookkeeping_tags(&self, spec: &mut ResourceSpec) {
        spec.tags
            .insert(TAG_RUNNER.to_owned(), RUNNER_IDENTITY.to_owned());
        spec.tags
            .insert(TAG_POOL.to_owned(), spec.pool_name.clone());
        spec.tags
            .insert(TAG_CREATOR.to_owned(), self.inner.options.runner_name.clone());
        if spec.use_pool {
            spec.tags
                .insert(TAG_STATUS.to_owned(), STATUS_IN_PROGRESS.to_owned());
        }
    }

    /// Dials the freshly provisioned machine, retrying with backoff until it
    /// responds or cancellation fires.
    async fn dial_new_instance(
        &self,
        spec: &ResourceSpec,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> Result<T::Client, EngineError<P::Error>> {
        let target = run::dial_target(spec, instance);
        dial_with_retry(&self.inner.transport, &target, &self.inner.options.retry, cancel)
            .await
            .map_err(|source| {
                tracing::error!(ip = %instance.ip, error = %source, "instance never became reachable");
                EngineError::connectivity(instance.ip.clone(), source)
            })
    }

    /// Creates the workspace root, stages directories before files, and
    /// creates a directory per ephemeral volume. Aborts on the first
    /// failure; the instance is left as-is for the caller to destroy.
    async fn stage_workspace(
        &self,
        spec: &ResourceSpec,
        instance: &Instance,
        client: &T::Client,
    ) -> Result<(), EngineError<P::Error>> {
        let files = client.open_files().await.map_err(|source| {
            tracing::error!(ip = %instance.ip, error = %source, "failed to open file channel");
            EngineError::connectivity(instance.ip.clone(), source)
        })?;

        // The workspace isolates everything the pipeline writes.
        files
            .mkdir_all(&spec.root, 0o777)
            .await
            .map_err(|source| EngineError::staging(spec.root.clone(), source))?;

        for entry in spec.files.iter().filter(|entry| entry.is_dir) {
            files
                .mkdir_all(&entry.path, entry.mode)
                .await
                .map_err(|source| EngineError::staging(entry.path.clone(), source))?;
        }
        for entry in spec.files.iter().filter(|entry| !entry.is_dir) {
            files
                .upload(&entry.path, &entry.data, entry.mode)
                .await
                .map_err(|source| EngineError::staging(entry.path.clone(), source))?;
        }
        for volume in &spec.ephemeral_volumes {
            files
                .mkdir_all(volume, 0o777)
                .await
                .map_err(|source| EngineError::staging(volume.clone(), source))?;
        }
        Ok(())
    }

    /// Waits out the warm-up delay, then creates the container network the
    /// pipeline's steps attach to.
    async fn bootstrap_network(
        &self,
        spec: &ResourceSpec,
        instance: &Instance,
        client: &T::Client,
    ) -> Result<(), EngineError<P::Error>> {
        let session = client.open_session().await.map_err(|source| {
            tracing::error!(ip = %instance.ip, error = %source, "failed to open session");
            EngineError::connectivity(instance.ip.clone(), source)
        })?;

        // The container runtime needs time to come up after boot; polling an
        // explicit readiness signal is left to the provider.
        sleep(self.inner.options.warmup_delay).await;

        let command = network_command(spec.os);
        session
            .run(command, &DiscardOutput)
            .await
            .map_err(|source| {
                tracing::error!(
                    ip = %instance.ip,
                    id = %instance.id,
                    command,
                    error = %source,
                    "unable to create container network"
                );
                EngineError::NetworkBootstrap {
                    command: command.to_owned(),
                    source,
                }
            })
    }

    /// Best-effort pool replenishment after a destroy. Free-count errors are
    /// logged and treated as zero; the replacement setup runs detached and
    /// its failure is logged only.
    async fn replenish_pool(&self, spec: &ResourceSpec) {
        let Some(pool) = self.inner.options.pools.get(&spec.pool_name) else {
            tracing::debug!(pool = %spec.pool_name, "no pool definition, skipping replenishment");
            return;
        };
        let free = self
            .inner
            .coordinator
            .count_free(&self.inner.provider, &spec.account, &spec.pool_name)
            .await
            .unwrap_or_else(|err| {
                tracing::error!(pool = %spec.pool_name, error = %err, "failed to count pool");
                0
            });
        if free >= pool.target_size {
            return;
        }

        let engine = self.clone();
        let mut template = pool.template.clone();
        let pool_name = spec.pool_name.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            match engine.setup(&mut template, &cancel).await {
                Ok(()) => tracing::debug!(pool = %pool_name, "added instance back to the pool"),
                Err(err) => {
                    tracing::error!(pool = %pool_name, error = %err, "failed to replenish pool");
                }
            }
        });
    }
}

/// Sink that discards bootstrap command output.
struct DiscardOutput;

impl OutputSink for DiscardOutput {
    fn write_chunk(&self, _chunk: &[u8]) {}
}

/// Returns the container-network-creation command for the target OS.
fn network_command(os: OsFamily) -> &'static str {
    match os {
        OsFamily::Linux => "docker network create skiff",
        OsFamily::Windows => "docker network create --driver nat skiff",
    }
}

/// Translates a resource spec into the provider's creation arguments.
fn provision_args(spec: &ResourceSpec) -> ProvisionArgs {
    ProvisionArgs {
        image: spec.image.clone(),
        iam_profile: spec.iam_profile.clone(),
        name: spec.user.clone(),
        size: spec.instance_type.clone(),
        region: spec.account.region.clone(),
        user_data: spec.user_data.clone(),
        tags: spec.tags.clone(),
        subnet: spec.network.subnet.clone(),
        groups: spec.network.security_groups.clone(),
        device: spec.device_name.clone(),
        private_ip: spec.network.private_ip,
        volume_type: spec.disk.disk_type.clone(),
        volume_size: spec.disk.size_gb,
        volume_iops: spec.disk.iops,
    }
}

#[cfg(test)]
mod tests;

//! Provisioning SPI: the compute-provider seam the engine drives.
//!
//! The engine never talks to a cloud API directly. Implementations of
//! [`Provisioner`] own instance creation, teardown, liveness probing, and the
//! tag-based pool queries. Reservation atomicity is *not* this trait's job:
//! the pool coordinator serializes [`Provisioner::try_reserve`] and
//! [`Provisioner::count_free`] behind its lock.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Account credentials used for provisioning calls.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    /// Access key identifier.
    pub access_key: String,
    /// Secret key.
    pub secret_key: String,
    /// Provider region.
    pub region: String,
}

impl Credentials {
    /// Creates a credentials triple.
    #[must_use]
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }
}

/// Realized machine identity returned by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider-specific instance identifier.
    pub id: String,
    /// Address reachable over the remote shell.
    pub ip: String,
}

impl Instance {
    /// Creates an instance identity.
    #[must_use]
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
        }
    }
}

/// Everything the provider needs to create one machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionArgs {
    /// Machine image identifier.
    pub image: String,
    /// Instance profile or role attached to the machine.
    pub iam_profile: String,
    /// Login name baked into the machine.
    pub name: String,
    /// Instance type or size.
    pub size: String,
    /// Provider region.
    pub region: String,
    /// User-data script executed on first boot.
    pub user_data: String,
    /// Tags applied at creation; pool membership and runner identity live
    /// here.
    pub tags: BTreeMap<String, String>,
    /// Subnet identifier.
    pub subnet: String,
    /// Security groups.
    pub groups: Vec<String>,
    /// Root block device name.
    pub device: String,
    /// Whether to address the machine by its private IP.
    pub private_ip: bool,
    /// Root disk type.
    pub volume_type: String,
    /// Root disk size in gigabytes.
    pub volume_size: i64,
    /// Provisioned IOPS, when applicable.
    pub volume_iops: i64,
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by compute providers.
pub trait Provisioner: Send + Sync {
    /// Provider-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new machine and returns its identity.
    fn create<'a>(
        &'a self,
        creds: &'a Credentials,
        args: &'a ProvisionArgs,
    ) -> ProviderFuture<'a, Instance, Self::Error>;

    /// Destroys the machine, releasing all provider resources.
    fn destroy<'a>(
        &'a self,
        creds: &'a Credentials,
        instance: &'a Instance,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Probes provider liveness; the error is surfaced unmodified.
    fn ping<'a>(&'a self, creds: &'a Credentials) -> ProviderFuture<'a, (), Self::Error>;

    /// Finds an instance tagged for `pool_name` that is not marked
    /// in-progress and marks it in-progress. Returns `Ok(None)` when the
    /// pool has no free instance; absence is not an error.
    ///
    /// Callers must serialize this read-then-mark sequence; the engine does
    /// so through its pool coordinator.
    fn try_reserve<'a>(
        &'a self,
        creds: &'a Credentials,
        pool_name: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, Self::Error>;

    /// Counts instances tagged for `pool_name` that are not marked
    /// in-progress.
    fn count_free<'a>(
        &'a self,
        creds: &'a Credentials,
        pool_name: &'a str,
    ) -> ProviderFuture<'a, usize, Self::Error>;
}

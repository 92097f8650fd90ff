//! Pipeline data model: resource and step specifications plus the execution
//! outcome surfaced to the pipeline runtime.
//!
//! A [`ResourceSpec`] describes the remote machine a pipeline wants and, once
//! bound, records the realized [`Instance`]. A [`StepSpec`] describes one
//! executable unit staged onto that machine. The two are distinct types so
//! lifecycle and execution entry points decode the caller's intent in their
//! signatures rather than through a runtime type check.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::provider::{Credentials, Instance};

/// Operating-system family of the remote machine. Shell preambles and the
/// container network bootstrap command differ between families.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OsFamily {
    /// POSIX shell semantics (`export`, `docker network create`).
    #[default]
    Linux,
    /// PowerShell semantics (`$Env:`, NAT network driver).
    Windows,
}

/// Network placement for a provisioned machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkSpec {
    /// Subnet identifier the instance joins.
    pub subnet: String,
    /// Security groups applied to the instance.
    pub security_groups: Vec<String>,
    /// Whether to address the instance by its private IP.
    pub private_ip: bool,
}

/// Root disk shape for a provisioned machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiskSpec {
    /// Provider disk type (for example `gp2`).
    pub disk_type: String,
    /// Disk size in gigabytes.
    pub size_gb: i64,
    /// Provisioned IOPS, when the disk type supports it.
    pub iops: i64,
}

/// A file or directory staged onto the remote machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileEntry {
    /// Absolute remote path.
    pub path: Utf8PathBuf,
    /// File content; empty for directories.
    pub data: Vec<u8>,
    /// Permission mode applied after creation.
    pub mode: u32,
    /// Whether the entry is a directory rather than a file.
    pub is_dir: bool,
}

impl FileEntry {
    /// Creates a file entry with content and mode.
    #[must_use]
    pub fn file(path: impl Into<Utf8PathBuf>, data: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode,
            is_dir: false,
        }
    }

    /// Creates a directory entry with the given mode.
    #[must_use]
    pub fn directory(path: impl Into<Utf8PathBuf>, mode: u32) -> Self {
        Self {
            path: path.into(),
            data: Vec::new(),
            mode,
            is_dir: true,
        }
    }
}

/// A sensitive value whose `Debug` output is redacted so secrets cannot leak
/// through diagnostics or assertion messages.
#[derive(Clone, Eq, PartialEq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wraps a sensitive value.
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    /// Returns the underlying value for rendering into a shell preamble.
    #[must_use]
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A named secret injected into a step's environment via a generated export
/// directive. The value is rendered but never logged.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Secret {
    /// Environment variable name the secret is exported as.
    pub env: String,
    /// Sensitive value.
    pub value: SecretValue,
}

impl Secret {
    /// Creates a secret binding.
    #[must_use]
    pub fn new(env: impl Into<String>, value: impl Into<SecretValue>) -> Self {
        Self {
            env: env.into(),
            value: value.into(),
        }
    }
}

/// One executable pipeline step.
///
/// Environment variables use a [`BTreeMap`] so export directives render in
/// lexicographic key order, keeping generated preambles deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StepSpec {
    /// Program to execute.
    pub command: String,
    /// Arguments joined with spaces after the command.
    pub args: Vec<String>,
    /// Remote working directory the step runs in.
    pub working_dir: Utf8PathBuf,
    /// Environment variables exported before the step body.
    pub envs: BTreeMap<String, String>,
    /// Secrets exported before the environment variables.
    pub secrets: Vec<Secret>,
    /// Files staged (with a generated preamble) before execution.
    pub files: Vec<FileEntry>,
}

/// Execution outcome of one pipeline step.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct State {
    /// Exit code reported by the remote process.
    pub exit_code: i32,
    /// Whether the process ran to completion.
    pub exited: bool,
    /// Whether the process was killed by the out-of-memory killer. The
    /// remote-shell transport cannot observe this, so it is always `false`.
    pub oom_killed: bool,
}

/// Desired and realized state of one remote machine.
///
/// Built through [`ResourceSpec::builder`]; the lifecycle manager binds
/// `instance` once the machine exists and reads everything else as input.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceSpec {
    /// Account credentials used for provisioning calls.
    pub account: Credentials,
    /// Machine image identifier.
    pub image: String,
    /// Instance type or size.
    pub instance_type: String,
    /// Remote login user.
    pub user: String,
    /// Private key authenticating the remote-shell connection.
    pub private_key: String,
    /// Instance profile or role attached at provisioning time.
    pub iam_profile: String,
    /// User-data script passed to the provisioner.
    pub user_data: String,
    /// Block device name for the root disk.
    pub device_name: String,
    /// Network placement.
    pub network: NetworkSpec,
    /// Root disk shape.
    pub disk: DiskSpec,
    /// Operating-system family of the image.
    pub os: OsFamily,
    /// Bookkeeping tags; the lifecycle manager merges runner identity and
    /// pool membership into this mapping before provisioning.
    pub tags: BTreeMap<String, String>,
    /// Pool this spec belongs to.
    pub pool_name: String,
    /// Whether setup should try to reserve a pooled instance first.
    pub use_pool: bool,
    /// Identity of the bound machine, populated by setup.
    pub instance: Option<Instance>,
    /// Workspace root directory created before any step runs.
    pub root: Utf8PathBuf,
    /// Files and directories staged relative to the workspace.
    pub files: Vec<FileEntry>,
    /// Ephemeral volume identifiers needing directories.
    pub ephemeral_volumes: Vec<Utf8PathBuf>,
}

impl ResourceSpec {
    /// Starts a builder for a [`ResourceSpec`].
    #[must_use]
    pub fn builder() -> ResourceSpecBuilder {
        ResourceSpecBuilder::default()
    }

    /// Validates the spec, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), SpecError> {
        for (value, field) in [
            (&self.image, "image"),
            (&self.instance_type, "instance_type"),
            (&self.account.region, "region"),
            (&self.user, "user"),
        ] {
            if value.trim().is_empty() {
                return Err(SpecError::MissingField(field.to_owned()));
            }
        }
        if self.root.as_str().trim().is_empty() {
            return Err(SpecError::MissingField("root".to_owned()));
        }
        Ok(())
    }
}

/// Errors raised while assembling a [`ResourceSpec`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when a required field is missing or empty.
    #[error("missing or empty field: {0}")]
    MissingField(String),
}

/// Builder for [`ResourceSpec`] that defers validation to construction.
#[derive(Clone, Debug, Default)]
pub struct ResourceSpecBuilder {
    account: Credentials,
    image: String,
    instance_type: String,
    user: String,
    private_key: String,
    iam_profile: String,
    user_data: String,
    device_name: String,
    network: NetworkSpec,
    disk: DiskSpec,
    os: OsFamily,
    tags: BTreeMap<String, String>,
    pool_name: String,
    use_pool: bool,
    root: Utf8PathBuf,
    files: Vec<FileEntry>,
    ephemeral_volumes: Vec<Utf8PathBuf>,
}

impl ResourceSpecBuilder {
    /// Sets the provisioning credentials.
    #[must_use]
    pub fn account(mut self, value: Credentials) -> Self {
        self.account = value;
        self
    }

    /// Sets the machine image identifier.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the remote login user.
    #[must_use]
    pub fn user(mut self, value: impl Into<String>) -> Self {
        self.user = value.into();
        self
    }

    /// Sets the private key for the remote-shell connection.
    #[must_use]
    pub fn private_key(mut self, value: impl Into<String>) -> Self {
        self.private_key = value.into();
        self
    }

    /// Sets the instance profile attached at provisioning time.
    #[must_use]
    pub fn iam_profile(mut self, value: impl Into<String>) -> Self {
        self.iam_profile = value.into();
        self
    }

    /// Sets the provisioning user-data script.
    #[must_use]
    pub fn user_data(mut self, value: impl Into<String>) -> Self {
        self.user_data = value.into();
        self
    }

    /// Sets the root block device name.
    #[must_use]
    pub fn device_name(mut self, value: impl Into<String>) -> Self {
        self.device_name = value.into();
        self
    }

    /// Sets the network placement.
    #[must_use]
    pub fn network(mut self, value: NetworkSpec) -> Self {
        self.network = value;
        self
    }

    /// Sets the root disk shape.
    #[must_use]
    pub fn disk(mut self, value: DiskSpec) -> Self {
        self.disk = value;
        self
    }

    /// Sets the operating-system family.
    #[must_use]
    pub const fn os(mut self, value: OsFamily) -> Self {
        self.os = value;
        self
    }

    /// Adds a bookkeeping tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the pool name.
    #[must_use]
    pub fn pool_name(mut self, value: impl Into<String>) -> Self {
        self.pool_name = value.into();
        self
    }

    /// Enables or disables pooled reservation during setup.
    #[must_use]
    pub const fn use_pool(mut self, value: bool) -> Self {
        self.use_pool = value;
        self
    }

    /// Sets the workspace root directory.
    #[must_use]
    pub fn root(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.root = value.into();
        self
    }

    /// Adds a staged file or directory.
    #[must_use]
    pub fn file(mut self, value: FileEntry) -> Self {
        self.files.push(value);
        self
    }

    /// Adds an ephemeral volume directory.
    #[must_use]
    pub fn ephemeral_volume(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.ephemeral_volumes.push(value.into());
        self
    }

    /// Builds and validates the [`ResourceSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::MissingField`] when a required field is empty.
    pub fn build(self) -> Result<ResourceSpec, SpecError> {
        let spec = ResourceSpec {
            account: self.account,
            image: self.image.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            user: self.user.trim().to_owned(),
            private_key: self.private_key,
            iam_profile: self.iam_profile,
            user_data: self.user_data,
            device_name: self.device_name,
            network: self.network,
            disk: self.disk,
            os: self.os,
            tags: self.tags,
            pool_name: self.pool_name,
            use_pool: self.use_pool,
            instance: None,
            root: self.root,
            files: self.files,
            ephemeral_volumes: self.ephemeral_volumes,
        };
        spec.validate()?;
        Ok(spec)
    }
}

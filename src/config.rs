//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::engine::EngineOptions;
use crate::logstream::DEFAULT_LIMIT;
use crate::provider::Credentials;
use crate::transport::RetryPolicy;

/// Runner configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, Eq, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "SKIFF")]
pub struct RunnerConfig {
    /// Identity of this runner deployment, stamped into instance tags.
    #[ortho_config(default = "skiff".to_owned())]
    pub runner_name: String,
    /// Access key for the compute provider. Captured even when the provider
    /// authenticates another way so audit logging can report it.
    pub access_key: Option<String>,
    /// Secret key for the compute provider. This value is required.
    pub secret_key: String,
    /// Provider region instances are created in. This value is required.
    pub region: String,
    /// Maximum number of dial attempts against a freshly provisioned
    /// machine.
    #[ortho_config(default = 30)]
    pub dial_attempts: u32,
    /// Pause between dial attempts, in seconds.
    #[ortho_config(default = 2)]
    pub dial_backoff_secs: u64,
    /// Fixed delay before the container-network bootstrap command, in
    /// seconds.
    #[ortho_config(default = 80)]
    pub warmup_delay_secs: u64,
    /// Byte budget bounding each log stream's pending batch.
    #[ortho_config(default = DEFAULT_LIMIT)]
    pub log_limit_bytes: usize,
    /// Debounce interval between log batch flushes, in milliseconds.
    #[ortho_config(default = 1000)]
    pub log_flush_interval_ms: u64,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl RunnerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to skiff.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("skiff")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values via environment
    /// variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.secret_key,
            &FieldMetadata::new("provider secret key", "SKIFF_SECRET_KEY", "secret_key"),
        )?;
        Self::require_field(
            &self.region,
            &FieldMetadata::new("provider region", "SKIFF_REGION", "region"),
        )?;
        Self::require_field(
            &self.runner_name,
            &FieldMetadata::new("runner name", "SKIFF_RUNNER_NAME", "runner_name"),
        )
    }

    /// Builds provisioning credentials from the configured keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when validation fails.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        self.validate()?;
        Ok(Credentials::new(
            self.access_key.clone().unwrap_or_default(),
            self.secret_key.clone(),
            self.region.clone(),
        ))
    }

    /// Returns the dial retry policy described by this configuration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.dial_attempts,
            backoff: Duration::from_secs(self.dial_backoff_secs),
        }
    }

    /// Returns the configured warm-up delay.
    #[must_use]
    pub const fn warmup_delay(&self) -> Duration {
        Duration::from_secs(self.warmup_delay_secs)
    }

    /// Returns the configured log flush debounce interval.
    #[must_use]
    pub const fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    /// Builds engine options from this configuration. Pools are registered
    /// separately by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when validation fails.
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        self.validate()?;
        Ok(EngineOptions::new(self.runner_name.clone())
            .with_retry(self.retry_policy())
            .with_warmup_delay(self.warmup_delay()))
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when a required field is missing or empty.
    #[error("{0}")]
    MissingField(String),
    /// Raised when configuration sources cannot be merged or parsed.
    #[error("failed to load configuration: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstream::DEFAULT_INTERVAL;
    use rstest::rstest;

    fn valid_config() -> RunnerConfig {
        RunnerConfig {
            runner_name: "skiff".to_owned(),
            access_key: Some("AKIA123".to_owned()),
            secret_key: "topsecret".to_owned(),
            region: "eu-west-1".to_owned(),
            dial_attempts: 30,
            dial_backoff_secs: 2,
            warmup_delay_secs: 80,
            log_limit_bytes: DEFAULT_LIMIT,
            log_flush_interval_ms: 1000,
        }
    }

    #[rstest]
    fn valid_configuration_passes_validation() {
        valid_config().validate().expect("config should validate");
    }

    #[rstest]
    #[case::secret_key(RunnerConfig { secret_key: "  ".to_owned(), ..valid_config() }, "SKIFF_SECRET_KEY")]
    #[case::region(RunnerConfig { region: String::new(), ..valid_config() }, "SKIFF_REGION")]
    #[case::runner_name(RunnerConfig { runner_name: String::new(), ..valid_config() }, "SKIFF_RUNNER_NAME")]
    fn blank_required_fields_are_rejected_with_guidance(
        #[case] config: RunnerConfig,
        #[case] expected_hint: &str,
    ) {
        let err = config.validate().expect_err("expected invalid config");
        let ConfigError::MissingField(message) = err else {
            panic!("expected a missing-field error, got: {err}");
        };
        assert!(message.contains(expected_hint), "got: {message}");
    }

    #[rstest]
    fn credentials_substitute_an_empty_access_key() {
        let config = RunnerConfig {
            access_key: None,
            ..valid_config()
        };
        let creds = config.credentials().expect("credentials should build");
        assert_eq!(creds.access_key, "");
        assert_eq!(creds.region, "eu-west-1");
    }

    #[rstest]
    fn engine_options_carry_the_configured_timings() {
        let config = RunnerConfig {
            dial_attempts: 5,
            dial_backoff_secs: 1,
            warmup_delay_secs: 3,
            ..valid_config()
        };
        let options = config.engine_options().expect("options should build");
        assert_eq!(options.runner_name, "skiff");
        assert_eq!(options.retry.attempts, 5);
        assert_eq!(options.warmup_delay, Duration::from_secs(3));
        assert_eq!(config.log_flush_interval(), DEFAULT_INTERVAL);
    }
}

//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::remote::MIN_DEADLINE;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = ".sushi-console.toml";

/// Prefix of configuration environment variables. Sections are separated by
/// a double underscore: `SUSHI_CONSOLE_SYNC__POLL_INTERVAL_MS=100`.
pub const ENV_PREFIX: &str = "SUSHI_CONSOLE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}

/// Synchronization tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Poll cadence for tracked values
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum normalized difference for a poll sample to count as a change
    #[serde(default = "default_parameter_epsilon")]
    pub parameter_epsilon: f64,
    /// How long an unconfirmed local write shields its value from polls
    #[serde(default = "default_optimistic_timeout_ms")]
    pub optimistic_timeout_ms: u64,
    /// Consecutive CPU poll failures before the load is reported unknown
    #[serde(default = "default_cpu_failure_threshold")]
    pub cpu_failure_threshold: u32,
    /// Deadline for remote calls; none by default
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_parameter_epsilon() -> f64 {
    0.001
}

fn default_optimistic_timeout_ms() -> u64 {
    2000
}

fn default_cpu_failure_threshold() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            parameter_epsilon: default_parameter_epsilon(),
            optimistic_timeout_ms: default_optimistic_timeout_ms(),
            cpu_failure_threshold: default_cpu_failure_threshold(),
            request_timeout_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_millis(self.optimistic_timeout_ms)
    }

    /// Remote call deadline, never shorter than one UI frame.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .map(|ms| Duration::from_millis(ms).max(MIN_DEADLINE))
    }
}

/// Automatic resubscription of failed notification streams.
///
/// Disabled by default: a failed stream is reported as a lost capability
/// and stays down until the next connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Give up after this many consecutive failures; 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `failures` consecutive
    /// failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || failures <= self.max_attempts)
    }

    /// Exponential backoff: initial, 2x, 4x, ... capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.clamp(1, 16) - 1;
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// If not set, uses RUST_LOG or defaults to "info"
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Console configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration: defaults < user config < local config < env vars.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in the user config directory (~/.config/sushi-console/ on Linux)
    /// 2. `.sushi-console.toml` in the current directory
    pub fn load() -> Result<Self, ConfigError> {
        let user_config = directories::ProjectDirs::from("", "", "sushi-console")
            .map(|dirs| dirs.config_dir().join("config.toml"));
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(LOCAL_CONFIG_FILE));
        Self::from_files(user_config, local_config)
    }

    /// Load with explicit config file locations. Missing files are skipped.
    pub fn from_files(
        user_config: Option<PathBuf>,
        local_config: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in [user_config, local_config].into_iter().flatten() {
            if path.exists() {
                tracing::debug!("Reading configuration from {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(figment.extract()?)
    }
}

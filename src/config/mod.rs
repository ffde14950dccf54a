//! Configuration management.

use crate::merge::ResolutionPolicy;
use serde::Deserialize;
use std::path::PathBuf;

/// Retry and backoff tuning for the sync coordinator.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum transport attempts before a batch is requeued intact.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds; doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Computes the backoff delay for a zero-indexed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl(attempt).unwrap_or(u64::MAX));
        std::time::Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Main configuration for memsync.
#[derive(Debug, Clone)]
pub struct MemsyncConfig {
    /// Path to the data directory (queues, audit log, canonical db).
    pub data_dir: PathBuf,
    /// Conflict resolution policy.
    pub policy: ResolutionPolicy,
    /// Maximum tokens drained into one sync batch.
    pub batch_size: usize,
    /// Transport retry tuning.
    pub retry: RetryConfig,
    /// Consecutive `Stale` verdicts before a queue entry is archived.
    pub stale_retry_limit: u32,
    /// Bounded re-evaluations when a per-id commit loses a version race,
    /// before the token escalates to manual resolution.
    pub commit_retry_limit: u32,
}

impl Default for MemsyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".memsync"),
            policy: ResolutionPolicy::default(),
            batch_size: 64,
            retry: RetryConfig::default(),
            stale_retry_limit: 3,
            commit_retry_limit: 3,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Policy name: `version-wins`, `hash-tiebreak`, `manual-only`,
    /// `relevance-weighted`.
    pub policy: Option<String>,
    /// Batch size.
    pub batch_size: Option<usize>,
    /// Stale retry limit.
    pub stale_retry_limit: Option<u32>,
    /// Commit retry limit.
    pub commit_retry_limit: Option<u32>,
    /// Retry section.
    pub retry: Option<ConfigFileRetry>,
}

/// Retry section in the config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileRetry {
    /// Maximum transport attempts.
    pub max_retries: Option<u32>,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: Option<u64>,
    /// Maximum backoff delay in milliseconds.
    pub max_delay_ms: Option<u64>,
}

impl MemsyncConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &std::path::Path) -> crate::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| crate::Error::OperationFailed {
                operation: "read_config_file".to_string(),
                cause: e.to_string(),
            })?;

        let file: ConfigFile =
            toml::from_str(&contents).map_err(|e| crate::Error::OperationFailed {
                operation: "parse_config_file".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/memsync/` on macOS)
    /// 2. XDG config dir (`~/.config/memsync/` for Unix compatibility)
    ///
    /// Returns default configuration if no config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let platform_config = base_dirs.config_dir().join("memsync").join("config.toml");
        if platform_config.exists() {
            if let Ok(config) = Self::load_from_file(&platform_config) {
                return config;
            }
        }

        let xdg_config = base_dirs
            .home_dir()
            .join(".config")
            .join("memsync")
            .join("config.toml");
        if xdg_config.exists() {
            if let Ok(config) = Self::load_from_file(&xdg_config) {
                return config;
            }
        }

        Self::default()
    }

    /// Converts a `ConfigFile` to `MemsyncConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(policy) = file.policy {
            config.policy = ResolutionPolicy::parse(&policy);
        }
        if let Some(batch_size) = file.batch_size {
            config.batch_size = batch_size.max(1);
        }
        if let Some(limit) = file.stale_retry_limit {
            config.stale_retry_limit = limit;
        }
        if let Some(limit) = file.commit_retry_limit {
            config.commit_retry_limit = limit.max(1);
        }
        if let Some(retry) = file.retry {
            if let Some(v) = retry.max_retries {
                config.retry.max_retries = v;
            }
            if let Some(v) = retry.base_delay_ms {
                config.retry.base_delay_ms = v;
            }
            if let Some(v) = retry.max_delay_ms {
                config.retry.max_delay_ms = v;
            }
        }

        config
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Sets the resolution policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the retry tuning.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

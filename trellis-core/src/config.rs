//! Configuration types

use crate::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Default number of entries kept per cache and database.
pub const DEFAULT_SIZE_LIMIT: usize = 1024;

/// Default interval between two polls of the invalidation table.
pub const DEFAULT_CLEAN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default bound on a single wait of the channel listener.
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(60);

/// Names per notification: 8000 bytes (max notify payload) / 64 (max name length).
pub const DEFAULT_NOTIFY_BATCH_SIZE: usize = 125;

/// Which cache implementation the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Per-process memory stores kept coherent through the invalidation table.
    #[default]
    Memory,
    /// Nothing is ever stored; every read is a miss.
    Disabled,
}

impl FromStr for CacheBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(ConfigError::InvalidValue {
                field: "backend".to_string(),
                value: other.to_string(),
                reason: "expected 'memory' or 'disabled'".to_string(),
            }),
        }
    }
}

/// Cache settings, read once at process start.
///
/// Durations are expressed in whole seconds in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Capacity used for caches without an explicit entry in `size_limits`.
    pub default_size_limit: usize,
    /// Per cache name capacity overrides.
    pub size_limits: HashMap<String, usize>,
    /// Minimum delay between two polls of the invalidation table.
    /// Zero selects the notification channel listener when the database has one.
    #[serde(with = "duration_secs")]
    pub clean_timeout: Duration,
    /// Upper bound of a single blocking wait of a channel listener.
    #[serde(with = "duration_secs")]
    pub listener_timeout: Duration,
    /// Maximum number of cache names per published notification.
    pub notify_batch_size: usize,
    /// Cache implementation.
    pub backend: CacheBackendKind,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_size_limit: DEFAULT_SIZE_LIMIT,
            size_limits: HashMap::new(),
            clean_timeout: DEFAULT_CLEAN_TIMEOUT,
            listener_timeout: DEFAULT_LISTENER_TIMEOUT,
            notify_batch_size: DEFAULT_NOTIFY_BATCH_SIZE,
            backend: CacheBackendKind::Memory,
        }
    }
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for the listener mode: invalidations travel over the
    /// notification channel instead of being polled.
    pub fn listening() -> Self {
        Self {
            clean_timeout: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set the default size limit.
    pub fn with_default_size_limit(mut self, limit: usize) -> Self {
        self.default_size_limit = limit;
        self
    }

    /// Override the size limit of one cache.
    pub fn with_size_limit(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.size_limits.insert(name.into(), limit);
        self
    }

    /// Set the poll interval.
    pub fn with_clean_timeout(mut self, timeout: Duration) -> Self {
        self.clean_timeout = timeout;
        self
    }

    /// Set the listener wait bound.
    pub fn with_listener_timeout(mut self, timeout: Duration) -> Self {
        self.listener_timeout = timeout;
        self
    }

    /// Set the notification batch size.
    pub fn with_notify_batch_size(mut self, size: usize) -> Self {
        self.notify_batch_size = size;
        self
    }

    /// Select the cache implementation.
    pub fn with_backend(mut self, backend: CacheBackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Capacity for the named cache.
    pub fn size_limit(&self, name: &str) -> usize {
        self.size_limits
            .get(name)
            .copied()
            .unwrap_or(self.default_size_limit)
    }

    /// Whether invalidations should be received through a channel listener.
    pub fn uses_listener(&self) -> bool {
        self.clean_timeout.is_zero()
    }

    /// Parse settings from a TOML document and validate them.
    pub fn from_toml_str(source: &str) -> TrellisResult<Self> {
        let settings: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Create settings from `TRELLIS_CACHE_*` environment variables.
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_size_limit: std::env::var("TRELLIS_CACHE_DEFAULT_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_size_limit),
            size_limits: HashMap::new(),
            clean_timeout: std::env::var("TRELLIS_CACHE_CLEAN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.clean_timeout),
            listener_timeout: std::env::var("TRELLIS_CACHE_LISTENER_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.listener_timeout),
            notify_batch_size: std::env::var("TRELLIS_CACHE_NOTIFY_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.notify_batch_size),
            backend: std::env::var("TRELLIS_CACHE_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backend),
        }
    }

    /// Validate the settings.
    ///
    /// Validates:
    /// - every size limit is positive
    /// - notify_batch_size is positive
    /// - listener_timeout is positive
    pub fn validate(&self) -> TrellisResult<()> {
        if self.default_size_limit == 0 {
            return Err(TrellisError::Config(ConfigError::InvalidValue {
                field: "default_size_limit".to_string(),
                value: self.default_size_limit.to_string(),
                reason: "default_size_limit must be greater than 0".to_string(),
            }));
        }

        if let Some((name, limit)) = self.size_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(TrellisError::Config(ConfigError::InvalidValue {
                field: format!("size_limits.{}", name),
                value: limit.to_string(),
                reason: "size limits must be greater than 0".to_string(),
            }));
        }

        if self.notify_batch_size == 0 {
            return Err(TrellisError::Config(ConfigError::InvalidValue {
                field: "notify_batch_size".to_string(),
                value: self.notify_batch_size.to_string(),
                reason: "notify_batch_size must be greater than 0".to_string(),
            }));
        }

        if self.listener_timeout.is_zero() {
            return Err(TrellisError::Config(ConfigError::InvalidValue {
                field: "listener_timeout".to_string(),
                value: format!("{:?}", self.listener_timeout),
                reason: "listener_timeout must be positive".to_string(),
            }));
        }

        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

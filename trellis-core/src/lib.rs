//! Trellis Core - Shared Types
//!
//! Identity aliases, the error hierarchy and cache settings shared by the
//! cache layer and the framework code that embeds it.

use chrono::{DateTime, Utc};

pub mod config;
pub mod error;

pub use config::{
    CacheBackendKind, CacheSettings, DEFAULT_CLEAN_TIMEOUT, DEFAULT_LISTENER_TIMEOUT,
    DEFAULT_NOTIFY_BATCH_SIZE, DEFAULT_SIZE_LIMIT,
};
pub use error::{BackendError, ConfigError, TrellisError, TrellisResult};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Wall clock timestamp, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Identifier of the user a transaction runs as.
pub type UserId = i64;

/// Ambient request context carried by a transaction (language, company, ...).
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Context keys that never take part in cache identity.
///
/// They describe the request transport rather than what the request may see.
pub const DEFAULT_CONTEXT_IGNORED_KEYS: &[&str] =
    &["client", "_request", "_check_access", "_skip_warnings"];

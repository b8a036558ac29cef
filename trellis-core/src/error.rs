//! Error types for Trellis cache operations

use thiserror::Error;

/// Configuration errors.
///
/// These are programming or deployment mistakes and are raised while the
/// process starts up: constructing caches, loading settings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Cache already registered: {name}")]
    DuplicateCacheName { name: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Errors raised by the database collaborators the cache talks to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Connection to {database} failed: {reason}")]
    ConnectionFailed { database: String, reason: String },

    #[error("Invalidation table of {database} failed: {reason}")]
    TableFailed { database: String, reason: String },

    #[error("Notification channel of {database} failed: {reason}")]
    ChannelFailed { database: String, reason: String },

    #[error("Database {database} does not support {capability}")]
    Unsupported { database: String, capability: String },
}

/// Master error type for all Trellis errors.
#[derive(Debug, Clone, Error)]
pub enum TrellisError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type alias for Trellis operations.
pub type TrellisResult<T> = Result<T, TrellisError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "size_limit".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("size_limit"));
        assert!(msg.contains("0"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_config_error_display_duplicate_name() {
        let err = ConfigError::DuplicateCacheName {
            name: "ir.model.fields".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("already registered"));
        assert!(msg.contains("ir.model.fields"));
    }

    #[test]
    fn test_backend_error_display_channel_failed() {
        let err = BackendError::ChannelFailed {
            database: "erp".to_string(),
            reason: "connection reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Notification channel"));
        assert!(msg.contains("erp"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_backend_error_display_unsupported() {
        let err = BackendError::Unsupported {
            database: "erp".to_string(),
            capability: "upsert".to_string(),
        };
        assert_eq!(format!("{}", err), "Database erp does not support upsert");
    }

    #[test]
    fn test_trellis_error_from_variants() {
        let config = TrellisError::from(ConfigError::MissingRequired {
            field: "name".to_string(),
        });
        assert!(matches!(config, TrellisError::Config(_)));

        let backend = TrellisError::from(BackendError::TableFailed {
            database: "erp".to_string(),
            reason: "disk full".to_string(),
        });
        assert!(matches!(backend, TrellisError::Backend(_)));
    }
}

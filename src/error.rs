//! Error types for convostore.
//!
//! All errors are strongly typed using thiserror. Each concern gets its own
//! enum and [`ConvoError`] wraps them, so callers can match on the category
//! they care about (missing ids, policy violations, configuration problems)
//! without string inspection.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ObjKind;
use crate::storage::StorageError;

/// Errors raised when a value, key or name has the wrong shape.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("Unknown object kind '{value}'")]
    UnknownKind {
        value: String,
    },

    #[error("Key '{key}' does not match the id '{item_id}' of the inserted {kind}")]
    IdMismatch {
        kind: ObjKind,
        key: String,
        item_id: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' holds a {actual} value, expected {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid {what} '{value}': {reason}")]
    InvalidName {
        what: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid type tag '{value}'")]
    InvalidTypeTag {
        value: String,
    },
}

/// Operations refused because of a registry or deletion policy.
#[derive(Debug, Error)]
pub enum PolicyViolation {
    #[error(
        "Deleting metadata key '{key}' from a single {kind} is not allowed. \
         To delete this key for all {kind}s, use the corpus-wide delete_metadata operation, \
         or unlock deletion for this kind in the schema registry"
    )]
    MetadataDeletionLocked {
        kind: ObjKind,
        key: String,
    },

    #[error("Vector '{name}' is not registered; register it with the schema registry first")]
    UnregisteredVector {
        name: String,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Unrecognized storage backend '{value}' (expected 'mem' or 'db')")]
    UnknownBackend {
        value: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine the home directory for the default config location")]
    NoHomeDirectory,
}

/// Top-level error type for convostore.
#[derive(Debug, Error)]
pub enum ConvoError {
    #[error("No record with id '{id}' in collection '{collection}'")]
    NotFound {
        collection: String,
        id: String,
    },

    #[error("Key '{key}' not found in record '{owner}'")]
    KeyNotFound {
        owner: String,
        key: String,
    },

    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for ConvoError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RecordNotFound { collection, id } => Self::NotFound { collection, id },
            StorageError::KeyNotFound { owner, key } => Self::KeyNotFound { owner, key },
            other => Self::Storage(other),
        }
    }
}

impl ConvoError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for a missing record or a missing key.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::KeyNotFound { .. })
    }

    /// Returns true if this is a type error.
    #[must_use]
    pub const fn is_type_error(&self) -> bool {
        matches!(self, Self::Type(_))
    }

    /// Returns true if a policy refused the operation.
    #[must_use]
    pub const fn is_policy_violation(&self) -> bool {
        matches!(self, Self::Policy(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a storage backend error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable.
    ///
    /// A failed transfer leaves fields and metadata possibly half-migrated;
    /// repeating the insert is the recovery path, so backend failures count.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(
                e,
                StorageError::ConnectionError(_) | StorageError::BackendError(_)
            ),
            _ => false,
        }
    }
}

/// Result type alias for convostore operations.
pub type ConvoResult<T> = Result<T, ConvoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_locked_message() {
        let err = PolicyViolation::MetadataDeletionLocked {
            kind: ObjKind::Utterance,
            key: "toxicity".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("toxicity"));
        assert!(msg.contains("utterance"));
        assert!(msg.contains("delete_metadata"));
    }

    #[test]
    fn test_storage_not_found_maps_to_not_found() {
        let err: ConvoError = StorageError::RecordNotFound {
            collection: "c_v0_utterances".to_string(),
            id: "42".to_string(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("42"));
    }

    #[test]
    fn test_missing_key_maps_to_key_not_found() {
        let err: ConvoError = StorageError::KeyNotFound {
            owner: "utterance_0".to_string(),
            key: "color".to_string(),
        }
        .into();
        assert!(matches!(err, ConvoError::KeyNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_backend_error_is_retryable() {
        let err: ConvoError = StorageError::BackendError("disk full".to_string()).into();
        assert!(err.is_storage());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_config_error_category() {
        let err: ConvoError = ConfigError::UnknownBackend {
            value: "redis".to_string(),
        }
        .into();
        assert!(err.is_configuration());
        assert!(format!("{err}").contains("redis"));
    }

    #[test]
    fn test_internal_error() {
        let err = ConvoError::internal("unexpected state");
        assert!(matches!(err, ConvoError::Internal { .. }));
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}

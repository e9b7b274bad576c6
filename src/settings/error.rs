//! Error types for guild settings

use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised while reading, validating or committing guild settings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// No setting with this name exists
    #[error("Unknown setting: {0}")]
    UnknownKey(String),

    /// The input could not be parsed for this setting
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// The setting already holds this value
    #[error("{key} already contains {value}")]
    DuplicateValue { key: String, value: String },

    /// The value to remove is not present
    #[error("{key} does not contain {value}")]
    MissingValue { key: String, value: String },

    /// The settings repository failed
    #[error("Settings persistence error: {0}")]
    Persistence(String),
}

impl From<StorageError> for SettingsError {
    fn from(error: StorageError) -> Self {
        Self::Persistence(error.to_string())
    }
}

impl SettingsError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Input errors are shown to the invoking user; persistence failures are not.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Persistence(_))
    }
}

/// Result type for settings operations
pub type SettingsResult<T> = Result<T, SettingsError>;

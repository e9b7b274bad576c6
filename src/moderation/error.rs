//! Error types for the moderation system
//!
//! This module defines the errors that can occur while applying, undoing,
//! recording or expiring moderation actions.

use thiserror::Error;

use crate::settings::SettingsError;
use crate::storage::StorageError;

/// Errors that can occur during moderation operations
#[derive(Debug, Error)]
pub enum ModerationError {
    /// A draft was built without the fields every entry requires
    #[error("Invalid moderation draft: {0}")]
    InvalidDraft(String),

    /// Moderation entry not found
    #[error("Moderation entry not found: {0}")]
    EntryNotFound(u64),

    /// The action does not support being undone
    #[error("Action cannot be undone: {0}")]
    UndoUnavailable(String),

    /// A duration outside the bounds accepted by the action
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// No action is registered for a punishment kind
    #[error("No action registered for: {0}")]
    UnknownAction(String),

    /// The target user does not accept direct messages from the bot
    #[error("Cannot send messages to user {0}")]
    CannotMessageUser(u64),

    /// The channel was deleted or the bot lost access to it
    #[error("Channel {0} is unavailable")]
    ChannelUnavailable(u64),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<serenity::Error>),

    /// Failed to get guild or member
    #[error("Failed to get guild or member: {0}")]
    GuildOrMemberNotFound(String),

    /// The entry repository failed to read or write
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The expiry scheduler rejected a task
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A settings read or write performed by an action failed
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Generic error
    #[error("Moderation error: {0}")]
    Other(String),
}

impl From<serenity::Error> for ModerationError {
    fn from(error: serenity::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

impl From<String> for ModerationError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl From<StorageError> for ModerationError {
    fn from(error: StorageError) -> Self {
        Self::Persistence(error.to_string())
    }
}

impl ModerationError {
    /// Whether this error should be reported to the invoking user as-is
    /// rather than as a generic failure.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        match self {
            Self::UndoUnavailable(_)
            | Self::InvalidDuration(_)
            | Self::CannotMessageUser(_)
            | Self::GuildOrMemberNotFound(_) => true,
            Self::Settings(error) => error.is_user_facing(),
            _ => false,
        }
    }
}

/// Result type for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ModerationError::EntryNotFound(42);
        assert_eq!(error.to_string(), "Moderation entry not found: 42");

        let error = ModerationError::CannotMessageUser(1234);
        assert_eq!(error.to_string(), "Cannot send messages to user 1234");

        let error = ModerationError::from("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Moderation error: Something went wrong");
    }

    #[test]
    fn test_user_facing_classification() {
        assert!(ModerationError::UndoUnavailable("Kick".into()).is_user_facing());
        assert!(!ModerationError::Persistence("disk full".into()).is_user_facing());
        assert!(!ModerationError::EntryNotFound(1).is_user_facing());

        let duplicate = SettingsError::DuplicateValue {
            key: "prefix".into(),
            value: "!".into(),
        };
        assert!(ModerationError::from(duplicate).is_user_facing());
    }
}

//! Bot configuration
//!
//! Read from `config/gavel.yaml` when the file exists. Every field has a
//! default, so a missing file or a partial file is fine. The Discord token
//! never lives in the file; it always comes from `DISCORD_TOKEN`.

use crate::storage::{StorageError, read_yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "config/gavel.yaml";
pub const TOKEN_VAR: &str = "DISCORD_TOKEN";
pub const DATA_DIR_VAR: &str = "GAVEL_DATA_DIR";

const SECONDS_PER_DAY: u32 = 86_400;
/// Discord deletes at most a week of messages on ban
const MAX_DELETE_MESSAGE_SECONDS: u32 = 7 * SECONDS_PER_DAY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Storage(#[from] StorageError),

    #[error("{0} must be set")]
    MissingToken(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Prefix for guilds that never set one
    pub default_prefix: String,
    pub data_dir: PathBuf,
    /// How often the expiry scheduler looks for due tasks
    pub scheduler_interval_seconds: u64,
    /// Message history removed by bans, in seconds. Discord works in whole
    /// days, so this must be a multiple of 86400 up to seven days.
    pub delete_message_seconds: u32,
    /// Gateway ban events within this window of a recorded entry are not recorded again
    pub similar_entry_window_seconds: i64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            default_prefix: "!".to_string(),
            data_dir: PathBuf::from("data"),
            scheduler_interval_seconds: 5,
            delete_message_seconds: 0,
            similar_entry_window_seconds: 15,
        }
    }
}

impl BotConfig {
    /// Load `config/gavel.yaml` and apply environment overrides
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load() -> Result<Self, ConfigError> {
        let config = Self::load_from(Path::new(CONFIG_FILE)).await?;
        Ok(config.with_data_dir_override(std::env::var(DATA_DIR_VAR).ok()))
    }

    /// Load from an explicit path, falling back to defaults when it does not exist
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// holds values Discord would not honor.
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = read_yaml::<Self>(path).await?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `Invalid` if `delete_message_seconds` is not a whole number of
    /// days or exceeds seven days.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let seconds = self.delete_message_seconds;
        if seconds % SECONDS_PER_DAY != 0 || seconds > MAX_DELETE_MESSAGE_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "delete_message_seconds must be whole days up to {MAX_DELETE_MESSAGE_SECONDS}, got {seconds}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_data_dir_override(mut self, data_dir: Option<String>) -> Self {
        if let Some(dir) = data_dir.filter(|dir| !dir.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    #[must_use]
    pub fn similar_entry_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.similar_entry_window_seconds)
    }

    /// The Discord token from the environment
    ///
    /// # Errors
    /// Returns `MissingToken` if `DISCORD_TOKEN` is unset or empty.
    pub fn discord_token() -> Result<String, ConfigError> {
        std::env::var(TOKEN_VAR)
            .ok()
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::MissingToken(TOKEN_VAR))
    }
}

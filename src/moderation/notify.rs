//! Moderation log channel
//!
//! Listens for inserted entries and posts a summary to the guild's
//! `channels.logs.moderation` channel.

use crate::moderation::action::format_duration;
use crate::moderation::{Entry, GuildOperations, ModerationError, ModerationResult, Notice};
use crate::settings::{SettingsStore, find_key, helpers, schema, write_settings};
use crate::MODERATION_TARGET;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Summary posted for a new entry
#[must_use]
pub fn entry_log_notice(entry: &Entry) -> Notice {
    let title = if entry.is_undo() {
        format!("{} (Reverted) | Case #{}", entry.kind, entry.id)
    } else {
        format!("{} | Case #{}", entry.kind, entry.id)
    };

    let mut notice = Notice::new(title)
        .field("User", format!("<@{}> ({})", entry.user_id, entry.user_id))
        .field("Moderator", format!("<@{}>", entry.moderator_id))
        .field(
            "Reason",
            entry.reason.clone().unwrap_or_else(|| "No reason specified".to_string()),
        )
        .timestamp(entry.created_at);

    if let (Some(duration), Some(expires)) = (entry.duration, entry.expires_at()) {
        notice = notice.field(
            "Duration",
            format!("{} (expires <t:{}:R>)", format_duration(duration), expires.timestamp()),
        );
    }
    notice
}

/// Posts inserted entries to the moderation log channel
#[derive(Clone)]
pub struct ModerationLogListener {
    settings: SettingsStore,
    ops: Arc<dyn GuildOperations>,
}

impl ModerationLogListener {
    #[must_use]
    pub fn new(settings: SettingsStore, ops: Arc<dyn GuildOperations>) -> Self {
        Self { settings, ops }
    }

    /// Post one entry. A channel that is gone or unwritable is removed from the settings.
    ///
    /// # Errors
    /// Returns an error if the settings cannot be read or updated, or if
    /// sending fails for another reason.
    pub async fn handle(&self, entry: &Entry) -> ModerationResult<()> {
        let settings = self.settings.read(entry.guild_id).await?;
        let Some(channel_id) = settings.snowflake(schema::CHANNELS_LOGS_MODERATION) else {
            return Ok(());
        };

        match self.ops.send_channel_message(channel_id, entry_log_notice(entry)).await {
            Ok(()) => Ok(()),
            Err(ModerationError::ChannelUnavailable(channel_id)) => {
                warn!(
                    target: MODERATION_TARGET,
                    guild_id = %entry.guild_id,
                    channel_id = %channel_id,
                    "Moderation log channel is unavailable, clearing it"
                );
                let key = find_key(schema::CHANNELS_LOGS_MODERATION)?;
                write_settings(&self.settings, entry.guild_id, helpers::reset(key)).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Handle entries from `rx` until the channel closes
    pub fn spawn(self, mut rx: broadcast::Receiver<Entry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => {
                        if let Err(e) = self.handle(&entry).await {
                            error!(
                                target: MODERATION_TARGET,
                                guild_id = %entry.guild_id,
                                case_id = %entry.id,
                                error = %e,
                                "Failed to post moderation log"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: MODERATION_TARGET, skipped, "Moderation log listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(target: MODERATION_TARGET, "Moderation log listener stopped");
        })
    }
}

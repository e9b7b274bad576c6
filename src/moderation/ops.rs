//! Discord-side effects used by moderation actions
//!
//! Actions never talk to serenity directly; they go through
//! [`GuildOperations`], which the bot implements over the HTTP client and
//! tests replace with a mock.

use crate::moderation::ModerationResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Embed-like message sent to a user or a log channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: Option<String>,
    pub fields: Vec<(String, String)>,
    pub color: u32,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notice {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    #[must_use]
    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Role to create when a role-based punishment has none configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTemplate {
    pub name: String,
    /// Permission bits denied to the role in every channel
    pub deny: u64,
}

/// Guild and user operations performed on Discord
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuildOperations: Send + Sync {
    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_seconds: u32,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    async fn unban(&self, guild_id: u64, user_id: u64, reason: Option<String>) -> ModerationResult<()>;

    async fn kick(&self, guild_id: u64, user_id: u64, reason: Option<String>) -> ModerationResult<()>;

    /// Time a member out until `until`, or lift the timeout when `None`
    async fn timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: Option<String>,
    ) -> ModerationResult<()>;

    /// Create a role and deny its permissions in every channel, returning its id
    async fn create_role(&self, guild_id: u64, template: RoleTemplate) -> ModerationResult<u64>;

    async fn role_exists(&self, guild_id: u64, role_id: u64) -> ModerationResult<bool>;

    async fn is_banned(&self, guild_id: u64, user_id: u64) -> ModerationResult<bool>;

    /// Role ids of a member, `None` if the user is not in the guild
    async fn member_roles(&self, guild_id: u64, user_id: u64) -> ModerationResult<Option<Vec<u64>>>;

    /// When a member's timeout ends, if they have one
    async fn timed_out_until(&self, guild_id: u64, user_id: u64) -> ModerationResult<Option<DateTime<Utc>>>;

    async fn guild_name(&self, guild_id: u64) -> ModerationResult<String>;

    /// Fails with `CannotMessageUser` when the user does not accept messages from the bot
    async fn send_direct_message(&self, user_id: u64, notice: Notice) -> ModerationResult<()>;

    async fn send_channel_message(&self, channel_id: u64, notice: Notice) -> ModerationResult<()>;
}

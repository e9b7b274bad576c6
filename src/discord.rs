//! Serenity-backed [`GuildOperations`]

use crate::MODERATION_TARGET;
use crate::moderation::{GuildOperations, ModerationError, ModerationResult, Notice, RoleTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{
    self as serenity, ChannelId, CreateEmbed, CreateEmbedFooter, CreateMessage, EditMember,
    EditRole, GuildId, Http, PermissionOverwrite, PermissionOverwriteType, Permissions, RoleId,
    Timestamp, UserId,
};
use serenity::http::{HttpError, UserPagination};
use std::sync::Arc;
use tracing::{debug, warn};

/// Discord JSON error codes the bot reacts to
mod codes {
    pub const UNKNOWN_CHANNEL: isize = 10003;
    pub const UNKNOWN_MEMBER: isize = 10007;
    pub const UNKNOWN_USER: isize = 10013;
    pub const UNKNOWN_BAN: isize = 10026;
    pub const MISSING_ACCESS: isize = 50001;
    pub const CANNOT_MESSAGE_USER: isize = 50007;
    pub const MISSING_PERMISSIONS: isize = 50013;
}

/// Discord's limit on ban message deletion
const MAX_DELETE_MESSAGE_DAYS: u32 = 7;

/// JSON error code of a failed Discord request
fn discord_error_code(error: &serenity::Error) -> Option<isize> {
    match error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => Some(response.error.code),
        _ => None,
    }
}

fn is_direct_message_refusal(code: Option<isize>) -> bool {
    code == Some(codes::CANNOT_MESSAGE_USER)
}

fn is_channel_unavailable(code: Option<isize>) -> bool {
    matches!(
        code,
        Some(codes::UNKNOWN_CHANNEL | codes::MISSING_ACCESS | codes::MISSING_PERMISSIONS)
    )
}

fn is_unknown_member(code: Option<isize>) -> bool {
    matches!(code, Some(codes::UNKNOWN_MEMBER | codes::UNKNOWN_USER))
}

fn is_unknown_ban(code: Option<isize>) -> bool {
    code == Some(codes::UNKNOWN_BAN)
}

/// A lift that failed because the member or the ban is already gone succeeded
fn already_lifted(
    result: Result<(), serenity::Error>,
    gone: fn(Option<isize>) -> bool,
    guild_id: u64,
    user_id: u64,
) -> ModerationResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if gone(discord_error_code(&e)) => {
            debug!(
                target: MODERATION_TARGET,
                guild_id = %guild_id,
                user_id = %user_id,
                "Nothing left to lift"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn guild(id: u64) -> ModerationResult<GuildId> {
    if id == 0 {
        return Err(ModerationError::GuildOrMemberNotFound("guild 0".to_string()));
    }
    Ok(GuildId::new(id))
}

fn user(id: u64) -> ModerationResult<UserId> {
    if id == 0 {
        return Err(ModerationError::GuildOrMemberNotFound("user 0".to_string()));
    }
    Ok(UserId::new(id))
}

fn timestamp(at: DateTime<Utc>) -> ModerationResult<Timestamp> {
    Timestamp::from_unix_timestamp(at.timestamp())
        .map_err(|_| ModerationError::InvalidDuration(format!("{at} is out of range")))
}

fn embed(notice: Notice) -> ModerationResult<CreateEmbed> {
    let mut embed = CreateEmbed::new().title(notice.title).color(notice.color);
    if let Some(description) = notice.description {
        embed = embed.description(description);
    }
    for (name, value) in notice.fields {
        embed = embed.field(name, value, false);
    }
    if let Some(footer) = notice.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(at) = notice.timestamp {
        embed = embed.timestamp(timestamp(at)?);
    }
    Ok(embed)
}

/// Discord operations over the REST client
pub struct SerenityOperations {
    http: Arc<Http>,
}

impl SerenityOperations {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    /// Deny the template's permissions to `role_id` in every channel of the guild.
    /// Channels the bot cannot edit are skipped.
    async fn deny_in_channels(&self, guild_id: GuildId, role_id: RoleId, deny: Permissions) -> ModerationResult<()> {
        let channels = guild_id.channels(&*self.http).await?;
        for channel_id in channels.keys() {
            let overwrite = PermissionOverwrite {
                allow: Permissions::empty(),
                deny,
                kind: PermissionOverwriteType::Role(role_id),
            };
            if let Err(e) = channel_id.create_permission(&*self.http, overwrite).await {
                warn!(
                    target: MODERATION_TARGET,
                    guild_id = %guild_id,
                    channel_id = %channel_id,
                    error = %e,
                    "Failed to set role overwrite"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GuildOperations for SerenityOperations {
    /// Discord deletes history in whole days, so `delete_message_seconds` is
    /// rounded down to days and capped at seven.
    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_seconds: u32,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        let days = (delete_message_seconds / 86_400).min(MAX_DELETE_MESSAGE_DAYS);
        let days = u8::try_from(days).unwrap_or(u8::MAX);
        self.http
            .ban_user(guild(guild_id)?, user(user_id)?, days, reason.as_deref())
            .await?;
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: Option<String>) -> ModerationResult<()> {
        let result = self
            .http
            .remove_ban(guild(guild_id)?, user(user_id)?, reason.as_deref())
            .await;
        already_lifted(result, is_unknown_ban, guild_id, user_id)
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: Option<String>) -> ModerationResult<()> {
        self.http
            .kick_member(guild(guild_id)?, user(user_id)?, reason.as_deref())
            .await?;
        Ok(())
    }

    async fn timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        let mut builder = match until {
            Some(until) => EditMember::new().disable_communication_until_datetime(timestamp(until)?),
            None => EditMember::new().enable_communication(),
        };
        if let Some(reason) = reason.as_deref() {
            builder = builder.audit_log_reason(reason);
        }
        let result = guild(guild_id)?
            .edit_member(&*self.http, user(user_id)?, builder)
            .await
            .map(|_| ());
        if until.is_some() {
            return result.map_err(Into::into);
        }
        already_lifted(result, is_unknown_member, guild_id, user_id)
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        self.http
            .add_member_role(guild(guild_id)?, user(user_id)?, RoleId::new(role_id), reason.as_deref())
            .await?;
        Ok(())
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: Option<String>,
    ) -> ModerationResult<()> {
        let result = self
            .http
            .remove_member_role(guild(guild_id)?, user(user_id)?, RoleId::new(role_id), reason.as_deref())
            .await;
        already_lifted(result, is_unknown_member, guild_id, user_id)
    }

    async fn create_role(&self, guild_id: u64, template: RoleTemplate) -> ModerationResult<u64> {
        let guild_id = guild(guild_id)?;
        let builder = EditRole::new()
            .name(&template.name)
            .permissions(Permissions::empty())
            .mentionable(false);
        let role = guild_id.create_role(&*self.http, builder).await?;
        debug!(
            target: MODERATION_TARGET,
            guild_id = %guild_id,
            role_id = %role.id,
            name = %template.name,
            "Created punishment role"
        );

        self.deny_in_channels(guild_id, role.id, Permissions::from_bits_truncate(template.deny))
            .await?;
        Ok(role.id.get())
    }

    async fn role_exists(&self, guild_id: u64, role_id: u64) -> ModerationResult<bool> {
        if role_id == 0 {
            return Ok(false);
        }
        let roles = guild(guild_id)?.roles(&*self.http).await?;
        Ok(roles.contains_key(&RoleId::new(role_id)))
    }

    async fn is_banned(&self, guild_id: u64, user_id: u64) -> ModerationResult<bool> {
        // Bans are listed by user id, so the first ban after `user_id - 1` is this user's if any
        let after = UserId::new(user_id.saturating_sub(1).max(1));
        let bans = self
            .http
            .get_bans(guild(guild_id)?, Some(UserPagination::After(after)), Some(1))
            .await?;
        Ok(bans.first().is_some_and(|ban| ban.user.id.get() == user_id))
    }

    async fn member_roles(&self, guild_id: u64, user_id: u64) -> ModerationResult<Option<Vec<u64>>> {
        match guild(guild_id)?.member(&*self.http, user(user_id)?).await {
            Ok(member) => Ok(Some(member.roles.iter().map(|role| role.get()).collect())),
            Err(e) if is_unknown_member(discord_error_code(&e)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn timed_out_until(&self, guild_id: u64, user_id: u64) -> ModerationResult<Option<DateTime<Utc>>> {
        match guild(guild_id)?.member(&*self.http, user(user_id)?).await {
            Ok(member) => Ok(member
                .communication_disabled_until
                .and_then(|until| DateTime::from_timestamp(until.unix_timestamp(), 0))),
            Err(e) if is_unknown_member(discord_error_code(&e)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn guild_name(&self, guild_id: u64) -> ModerationResult<String> {
        let guild = guild(guild_id)?.to_partial_guild(&*self.http).await?;
        Ok(guild.name)
    }

    async fn send_direct_message(&self, user_id: u64, notice: Notice) -> ModerationResult<()> {
        let message = CreateMessage::new().embed(embed(notice)?);
        let result = match user(user_id)?.create_dm_channel(&*self.http).await {
            Ok(channel) => channel.send_message(&*self.http, message).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_direct_message_refusal(discord_error_code(&e)) => {
                Err(ModerationError::CannotMessageUser(user_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_channel_message(&self, channel_id: u64, notice: Notice) -> ModerationResult<()> {
        if channel_id == 0 {
            return Err(ModerationError::ChannelUnavailable(channel_id));
        }
        let message = CreateMessage::new().embed(embed(notice)?);
        match ChannelId::new(channel_id).send_message(&*self.http, message).await {
            Ok(_) => Ok(()),
            Err(e) if is_channel_unavailable(discord_error_code(&e)) => {
                Err(ModerationError::ChannelUnavailable(channel_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_message_refusal_code() {
        assert!(is_direct_message_refusal(Some(50007)));
        assert!(!is_direct_message_refusal(Some(50013)));
        assert!(!is_direct_message_refusal(None));
    }

    #[test]
    fn test_channel_unavailable_codes() {
        for code in [10003, 50001, 50013] {
            assert!(is_channel_unavailable(Some(code)), "{code}");
        }
        assert!(!is_channel_unavailable(Some(50007)));
        assert!(!is_channel_unavailable(None));
    }

    #[test]
    fn test_unknown_member_codes() {
        assert!(is_unknown_member(Some(10007)));
        assert!(is_unknown_member(Some(10013)));
        assert!(!is_unknown_member(Some(10003)));
    }

    #[test]
    fn test_unknown_ban_code() {
        assert!(is_unknown_ban(Some(10026)));
        assert!(!is_unknown_ban(Some(10007)));
    }

    #[test]
    fn test_lift_of_missing_target_succeeds() {
        assert!(already_lifted(Ok(()), is_unknown_member, 1, 2).is_ok());

        let error = already_lifted(Err(serenity::Error::Other("gateway closed")), is_unknown_member, 1, 2);
        assert!(matches!(error, Err(ModerationError::DiscordApi(_))));
    }

    #[test]
    fn test_non_http_errors_have_no_code() {
        let error = serenity::Error::Other("gateway closed");
        assert_eq!(discord_error_code(&error), None);
    }

    #[test]
    fn test_zero_ids_are_rejected() {
        assert!(matches!(guild(0), Err(ModerationError::GuildOrMemberNotFound(_))));
        assert!(matches!(user(0), Err(ModerationError::GuildOrMemberNotFound(_))));
        assert_eq!(guild(5).unwrap(), GuildId::new(5));
    }

    #[test]
    fn test_notice_converts_to_embed() {
        let notice = Notice::new("Ban | Case #1")
            .description("Banned")
            .field("Reason", "spam")
            .footer("Be nice")
            .timestamp(Utc::now());
        assert!(embed(notice).is_ok());
    }
}

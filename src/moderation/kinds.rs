//! Built-in punishment kinds

use crate::moderation::action::{
    ActionConfig, ActionContext, ActionHooks, DAY, HookFuture, HookScope, ModerationAction,
    complete_last_entry_from_user,
};
use crate::moderation::{
    DraftEntry, Entry, EntryQuery, ExtraData, ModerationError, ModerationResult, RoleTemplate,
    TypeMetadata, TypeVariation,
};
use crate::settings::{SettingValue, SettingsPatch, schema, write_settings};
use crate::MODERATION_TARGET;
use chrono::Utc;
use poise::serenity_prelude::Permissions;
use tracing::info;

/// Message history removed by a soft ban when no longer window is configured
const SOFTBAN_DELETE_SECONDS: u32 = 86_400;

/// The action for a punishment kind
#[must_use]
pub fn action_for(kind: TypeVariation) -> ModerationAction {
    match kind {
        TypeVariation::Ban => ModerationAction::new(
            ActionConfig::new(kind, "Moderation => Ban", 0xD5_0000).undoable(),
            ActionHooks {
                apply_pre: Some(ban_apply),
                undo_pre: Some(ban_undo),
                is_active: Some(ban_is_active),
                ..Default::default()
            },
        ),
        TypeVariation::Kick => ModerationAction::new(
            ActionConfig::new(kind, "Moderation => Kick", 0xF5_7F17),
            ActionHooks {
                apply_pre: Some(kick_apply),
                ..Default::default()
            },
        ),
        TypeVariation::SoftBan => ModerationAction::new(
            ActionConfig::new(kind, "Moderation => SoftBan", 0xFF_6D00),
            ActionHooks {
                apply_pre: Some(softban_apply),
                ..Default::default()
            },
        ),
        TypeVariation::Timeout => ModerationAction::new(
            ActionConfig::new(kind, "Moderation => Timeout", 0x00_0000)
                .undoable()
                .duration_required()
                .duration_external(28 * DAY),
            ActionHooks {
                apply_pre: Some(timeout_apply),
                undo_pre: Some(timeout_undo),
                is_active: Some(timeout_is_active),
                ..Default::default()
            },
        ),
        TypeVariation::Warning => ModerationAction::new(
            ActionConfig::new(kind, "Moderation => Warning", 0xFF_D600).undoable(),
            ActionHooks {
                undo_pre: Some(close_previous),
                ..Default::default()
            },
        ),
        TypeVariation::Mute => role_action(kind, "Moderation => Mute", 0xF9_A825),
        TypeVariation::RestrictedAttachment => {
            role_action(kind, "Moderation => RestrictedAttachment", 0xFF_A000)
        }
        TypeVariation::RestrictedEmbed => role_action(kind, "Moderation => RestrictedEmbed", 0xFF_A000),
        TypeVariation::RestrictedEmoji => role_action(kind, "Moderation => RestrictedEmoji", 0xFF_A000),
        TypeVariation::RestrictedReaction => {
            role_action(kind, "Moderation => RestrictedReaction", 0xFF_A000)
        }
        TypeVariation::RestrictedText => role_action(kind, "Moderation => RestrictedText", 0xFF_A000),
        TypeVariation::RestrictedVoice => role_action(kind, "Moderation => RestrictedVoice", 0xFF_A000),
    }
}

fn role_action(kind: TypeVariation, log_prefix: &'static str, color: u32) -> ModerationAction {
    ModerationAction::new(
        ActionConfig::new(kind, log_prefix, color).undoable(),
        ActionHooks {
            resolve_extra_data: Some(role_extra_data),
            apply_pre: Some(role_apply),
            // Only once the role is on the member
            apply_post: Some(close_previous),
            undo_pre: Some(role_undo),
            is_active: Some(role_is_active),
            ..Default::default()
        },
    )
}

/// Complete the open, temporary entry this reversal or re-application replaces.
/// When the scope names a case, only that case is closed.
fn close_previous<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let case_id = scope.case_id;
        let same_case = move |candidate: &Entry| case_id.is_none_or(|id| candidate.id == id);
        let query = EntryQuery::new(scope.entry.user_id, scope.entry.kind)
            .with_metadata(TypeMetadata::empty())
            .with_predicate(&same_case);
        complete_last_entry_from_user(&ctx.manager, scope.guard, &query).await?;
        Ok(())
    })
}

fn ban_apply<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        ctx.ops
            .ban(ctx.guild_id, entry.user_id, ctx.delete_message_seconds, entry.reason.clone())
            .await
    })
}

fn ban_undo<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        ctx.ops.unban(ctx.guild_id, entry.user_id, entry.reason.clone()).await?;
        close_previous(ctx, scope).await
    })
}

fn ban_is_active(ctx: &ActionContext, _: TypeVariation, user_id: u64) -> HookFuture<'_, bool> {
    Box::pin(async move { ctx.ops.is_banned(ctx.guild_id, user_id).await })
}

fn kick_apply<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        ctx.ops.kick(ctx.guild_id, entry.user_id, entry.reason.clone()).await
    })
}

fn softban_apply<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        let delete_message_seconds = ctx.delete_message_seconds.max(SOFTBAN_DELETE_SECONDS);
        ctx.ops
            .ban(ctx.guild_id, entry.user_id, delete_message_seconds, entry.reason.clone())
            .await?;
        ctx.ops.unban(ctx.guild_id, entry.user_id, entry.reason.clone()).await
    })
}

fn timeout_apply<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        let until = entry.expires_at().ok_or_else(|| {
            ModerationError::InvalidDuration(format!("{} requires a duration", entry.kind))
        })?;
        ctx.ops
            .timeout(ctx.guild_id, entry.user_id, Some(until), entry.reason.clone())
            .await
    })
}

fn timeout_undo<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        ctx.ops
            .timeout(ctx.guild_id, entry.user_id, None, entry.reason.clone())
            .await?;
        close_previous(ctx, scope).await
    })
}

fn timeout_is_active(ctx: &ActionContext, _: TypeVariation, user_id: u64) -> HookFuture<'_, bool> {
    Box::pin(async move {
        let until = ctx.ops.timed_out_until(ctx.guild_id, user_id).await?;
        Ok(until.is_some_and(|until| until > Utc::now()))
    })
}

/// Settings key, role name and denied permissions of a role-based kind
fn role_definition(kind: TypeVariation) -> ModerationResult<(&'static str, &'static str, Permissions)> {
    let threads = Permissions::SEND_MESSAGES_IN_THREADS
        | Permissions::CREATE_PUBLIC_THREADS
        | Permissions::CREATE_PRIVATE_THREADS;
    let definition = match kind {
        TypeVariation::Mute => (
            schema::ROLES_MUTED,
            "Muted",
            Permissions::SEND_MESSAGES
                | Permissions::ADD_REACTIONS
                | Permissions::CONNECT
                | Permissions::SPEAK
                | threads,
        ),
        TypeVariation::RestrictedAttachment => (
            schema::ROLES_RESTRICTED_ATTACHMENT,
            "Restricted Attachment",
            Permissions::ATTACH_FILES,
        ),
        TypeVariation::RestrictedEmbed => (
            schema::ROLES_RESTRICTED_EMBED,
            "Restricted Embed",
            Permissions::EMBED_LINKS,
        ),
        TypeVariation::RestrictedEmoji => (
            schema::ROLES_RESTRICTED_EMOJI,
            "Restricted Emoji",
            Permissions::USE_EXTERNAL_EMOJIS,
        ),
        TypeVariation::RestrictedReaction => (
            schema::ROLES_RESTRICTED_REACTION,
            "Restricted Reaction",
            Permissions::ADD_REACTIONS,
        ),
        TypeVariation::RestrictedText => (
            schema::ROLES_RESTRICTED_TEXT,
            "Restricted Text",
            Permissions::SEND_MESSAGES | threads,
        ),
        TypeVariation::RestrictedVoice => (
            schema::ROLES_RESTRICTED_VOICE,
            "Restricted Voice",
            Permissions::CONNECT,
        ),
        _ => {
            return Err(ModerationError::Other(format!("{kind} is not role based")));
        }
    };
    Ok(definition)
}

/// The configured role of a role-based kind. When `create` is set, a missing
/// or deleted role is created and stored in the settings.
async fn ensure_role(ctx: &ActionContext, kind: TypeVariation, create: bool) -> ModerationResult<u64> {
    let (key, name, deny) = role_definition(kind)?;

    let settings = ctx.settings.read(ctx.guild_id).await?;
    if let Some(role_id) = settings.snowflake(key) {
        if ctx.ops.role_exists(ctx.guild_id, role_id).await? {
            return Ok(role_id);
        }
    }

    if !create {
        return Err(ModerationError::GuildOrMemberNotFound(format!(
            "No role is configured for {kind}"
        )));
    }

    let template = RoleTemplate {
        name: name.to_string(),
        deny: deny.bits(),
    };
    let role_id = ctx.ops.create_role(ctx.guild_id, template).await?;
    let patch = SettingsPatch::from([(key.to_string(), SettingValue::Snowflake(role_id))]);
    write_settings(&ctx.settings, ctx.guild_id, patch).await?;

    info!(
        target: MODERATION_TARGET,
        guild_id = %ctx.guild_id,
        role_id = %role_id,
        "Created {name} role"
    );
    Ok(role_id)
}

fn role_extra_data(ctx: &ActionContext, kind: TypeVariation, undo: bool) -> HookFuture<'_, Option<ExtraData>> {
    Box::pin(async move {
        let role_id = ensure_role(ctx, kind, !undo).await?;
        Ok(Some(ExtraData::Role { role_id }))
    })
}

fn role_of(entry: &DraftEntry) -> ModerationResult<u64> {
    entry
        .extra_data
        .as_ref()
        .and_then(ExtraData::role_id)
        .ok_or_else(|| ModerationError::Other(format!("{} entry carries no role", entry.kind)))
}

fn role_apply<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        let role_id = role_of(entry)?;
        ctx.ops
            .add_role(ctx.guild_id, entry.user_id, role_id, entry.reason.clone())
            .await
    })
}

fn role_undo<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
    Box::pin(async move {
        let entry = scope.entry;
        let role_id = role_of(entry)?;
        ctx.ops
            .remove_role(ctx.guild_id, entry.user_id, role_id, entry.reason.clone())
            .await?;
        close_previous(ctx, scope).await
    })
}

fn role_is_active(ctx: &ActionContext, kind: TypeVariation, user_id: u64) -> HookFuture<'_, bool> {
    Box::pin(async move {
        let (key, _, _) = role_definition(kind)?;
        let Some(role_id) = ctx.settings.read(ctx.guild_id).await?.snowflake(key) else {
            return Ok(false);
        };
        let roles = ctx.ops.member_roles(ctx.guild_id, user_id).await?;
        Ok(roles.is_some_and(|roles| roles.contains(&role_id)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{
        ActionData, ActionOptions, ActionRegistry, EntryFilter, LockRegistry, MemoryEntryRepository,
        MockExpiryScheduler, MockGuildOperations, ModerationRegistry, action::SECOND,
    };
    use crate::settings::{MemorySettingsRepository, SettingsStore, read_settings};
    use mockall::predicate::{always, eq};
    use std::sync::Arc;

    const GUILD: u64 = 10;
    const USER: u64 = 20;
    const ROLE: u64 = 30;

    fn context(ops: MockGuildOperations, scheduler: MockExpiryScheduler) -> ActionContext {
        let locks = LockRegistry::new();
        let registry = ModerationRegistry::new(
            Arc::new(MemoryEntryRepository::new()),
            locks.clone(),
            Arc::new(scheduler),
            chrono::Duration::seconds(15),
        );
        ActionContext {
            guild_id: GUILD,
            guild_name: "Test Guild".to_string(),
            manager: registry.get(GUILD),
            ops: Arc::new(ops),
            settings: SettingsStore::new(Arc::new(MemorySettingsRepository::new()), locks),
            delete_message_seconds: 0,
        }
    }

    fn any_scheduler() -> MockExpiryScheduler {
        let mut scheduler = MockExpiryScheduler::new();
        scheduler.expect_add().returning(|_, _, _| Ok(()));
        scheduler
    }

    fn options(duration: Option<u64>) -> ActionOptions {
        ActionOptions {
            user_id: USER,
            moderator_id: Some(1),
            reason: Some("test".to_string()),
            duration,
            case_id: None,
        }
    }

    async fn configure_muted_role(ctx: &ActionContext) {
        let patch = SettingsPatch::from([(schema::ROLES_MUTED.to_string(), SettingValue::Snowflake(ROLE))]);
        write_settings(&ctx.settings, GUILD, patch).await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_ban_schedules_nothing() {
        let mut ops = MockGuildOperations::new();
        ops.expect_ban()
            .with(eq(GUILD), eq(USER), eq(0), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut scheduler = MockExpiryScheduler::new();
        scheduler.expect_add().never();

        let ctx = context(ops, scheduler);
        let registry = ActionRegistry::new();
        let entry = registry
            .get(TypeVariation::Ban)
            .unwrap()
            .apply(&ctx, options(None), &ActionData::default())
            .await
            .unwrap();

        assert_eq!(entry.duration, None);
        assert_eq!(entry.expires_timestamp(), None);
    }

    #[tokio::test]
    async fn test_softban_bans_then_unbans() {
        let mut ops = MockGuildOperations::new();
        let mut sequence = mockall::Sequence::new();
        ops.expect_ban()
            .with(eq(GUILD), eq(USER), eq(SOFTBAN_DELETE_SECONDS), always())
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _, _| Ok(()));
        ops.expect_unban()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));

        let ctx = context(ops, any_scheduler());
        let action = action_for(TypeVariation::SoftBan);
        action.apply(&ctx, options(None), &ActionData::default()).await.unwrap();
        assert!(matches!(
            action.undo(&ctx, options(None), &ActionData::default()).await,
            Err(ModerationError::UndoUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_mute_records_role_and_schedules_expiry() {
        let mut ops = MockGuildOperations::new();
        ops.expect_role_exists().returning(|_, _| Ok(true));
        ops.expect_add_role()
            .with(eq(GUILD), eq(USER), eq(ROLE), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut scheduler = MockExpiryScheduler::new();
        scheduler
            .expect_add()
            .withf(|task, _, options| {
                task.to_string() == "moderationEndMute"
                    && options.data.extra_data == Some(ExtraData::Role { role_id: ROLE })
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = context(ops, scheduler);
        configure_muted_role(&ctx).await;

        let entry = action_for(TypeVariation::Mute)
            .apply(&ctx, options(Some(600_000)), &ActionData::default())
            .await
            .unwrap();
        assert_eq!(entry.extra_data, Some(ExtraData::Role { role_id: ROLE }));
        assert_eq!(
            entry.expires_timestamp(),
            Some(entry.created_at.timestamp_millis() + 600_000)
        );
    }

    #[tokio::test]
    async fn test_remute_completes_previous_temporary_mute() {
        let mut ops = MockGuildOperations::new();
        ops.expect_role_exists().returning(|_, _| Ok(true));
        ops.expect_add_role().times(2).returning(|_, _, _, _| Ok(()));

        let ctx = context(ops, any_scheduler());
        configure_muted_role(&ctx).await;
        let mute = action_for(TypeVariation::Mute);

        let first = mute
            .apply(&ctx, options(Some(600_000)), &ActionData::default())
            .await
            .unwrap();
        let second = mute
            .apply(&ctx, options(Some(600_000)), &ActionData::default())
            .await
            .unwrap();

        let entries = ctx.manager.fetch(EntryFilter::user(USER)).await.unwrap();
        assert!(entries[&first.id].completed);
        assert!(!entries[&second.id].completed);
    }

    #[tokio::test]
    async fn test_failed_remute_keeps_previous_mute_open() {
        let mut ops = MockGuildOperations::new();
        let mut sequence = mockall::Sequence::new();
        ops.expect_role_exists().returning(|_, _| Ok(true));
        ops.expect_add_role()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _, _| Ok(()));
        ops.expect_add_role()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _, _| Err(ModerationError::Other("Missing Permissions".to_string())));

        let ctx = context(ops, any_scheduler());
        configure_muted_role(&ctx).await;
        let mute = action_for(TypeVariation::Mute);

        let first = mute
            .apply(&ctx, options(Some(600_000)), &ActionData::default())
            .await
            .unwrap();
        let second = mute
            .apply(&ctx, options(Some(600_000)), &ActionData::default())
            .await;
        assert!(matches!(second, Err(ModerationError::Other(_))));

        let entries = ctx.manager.fetch(EntryFilter::user(USER)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[&first.id].completed);
    }

    #[tokio::test]
    async fn test_undo_of_named_case_leaves_other_warnings_open() {
        let ctx = context(MockGuildOperations::new(), any_scheduler());
        let warning = action_for(TypeVariation::Warning);

        let older = warning
            .apply(&ctx, options(Some(30 * DAY)), &ActionData::default())
            .await
            .unwrap();
        let newer = warning
            .apply(&ctx, options(Some(60 * SECOND)), &ActionData::default())
            .await
            .unwrap();

        let mut lift = options(None);
        lift.case_id = Some(newer.id);
        warning.undo(&ctx, lift, &ActionData::default()).await.unwrap();

        let entries = ctx.manager.fetch(EntryFilter::user(USER)).await.unwrap();
        assert!(entries[&newer.id].completed);
        assert!(!entries[&older.id].completed);

        // Without a case the oldest open warning is lifted
        warning.undo(&ctx, options(None), &ActionData::default()).await.unwrap();
        assert!(ctx.manager.fetch_one(older.id).await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_mute_creates_missing_role() {
        let mut ops = MockGuildOperations::new();
        ops.expect_create_role()
            .withf(|guild_id, template| {
                *guild_id == GUILD
                    && template.name == "Muted"
                    && template.deny & Permissions::SEND_MESSAGES.bits() != 0
            })
            .times(1)
            .returning(|_, _| Ok(ROLE));
        ops.expect_add_role().times(1).returning(|_, _, _, _| Ok(()));

        let ctx = context(ops, any_scheduler());
        action_for(TypeVariation::Mute)
            .apply(&ctx, options(None), &ActionData::default())
            .await
            .unwrap();

        let settings = read_settings(&ctx.settings, GUILD).await.unwrap();
        assert_eq!(settings.snowflake(schema::ROLES_MUTED), Some(ROLE));
    }

    #[tokio::test]
    async fn test_unmute_removes_role_and_closes_entry() {
        let mut ops = MockGuildOperations::new();
        ops.expect_role_exists().returning(|_, _| Ok(true));
        ops.expect_add_role().returning(|_, _, _, _| Ok(()));
        ops.expect_remove_role()
            .with(eq(GUILD), eq(USER), eq(ROLE), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let ctx = context(ops, any_scheduler());
        configure_muted_role(&ctx).await;
        let mute = action_for(TypeVariation::Mute);

        let applied = mute
            .apply(&ctx, options(Some(600_000)), &ActionData::default())
            .await
            .unwrap();
        let reverted = mute.undo(&ctx, options(None), &ActionData::default()).await.unwrap();

        assert!(reverted.is_undo());
        assert!(ctx.manager.fetch_one(applied.id).await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_unmute_without_role_fails() {
        let mut ops = MockGuildOperations::new();
        ops.expect_create_role().never();

        let ctx = context(ops, any_scheduler());
        let result = action_for(TypeVariation::Mute)
            .undo(&ctx, options(None), &ActionData::default())
            .await;
        assert!(matches!(result, Err(ModerationError::GuildOrMemberNotFound(_))));
    }

    #[tokio::test]
    async fn test_role_is_active() {
        let mut ops = MockGuildOperations::new();
        ops.expect_member_roles()
            .with(eq(GUILD), eq(USER))
            .returning(|_, _| Ok(Some(vec![ROLE])));
        ops.expect_member_roles()
            .returning(|_, _| Ok(None));

        let ctx = context(ops, any_scheduler());
        let mute = action_for(TypeVariation::Mute);
        assert!(!mute.is_active(&ctx, USER).await.unwrap());

        configure_muted_role(&ctx).await;
        assert!(mute.is_active(&ctx, USER).await.unwrap());
        assert!(!mute.is_active(&ctx, USER + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_uses_discord_timer() {
        let mut ops = MockGuildOperations::new();
        ops.expect_timeout()
            .withf(|_, user_id, until, _| *user_id == USER && until.is_some())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        ops.expect_timed_out_until()
            .returning(|_, _| Ok(Some(Utc::now() + chrono::Duration::minutes(5))));
        let mut scheduler = MockExpiryScheduler::new();
        scheduler.expect_add().never();

        let ctx = context(ops, scheduler);
        let timeout = action_for(TypeVariation::Timeout);
        timeout
            .apply(&ctx, options(Some(60 * SECOND)), &ActionData::default())
            .await
            .unwrap();
        assert!(timeout.is_active(&ctx, USER).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_without_duration_fails_before_discord() {
        let mut ops = MockGuildOperations::new();
        ops.expect_timeout().never();

        let ctx = context(ops, any_scheduler());
        let result = action_for(TypeVariation::Timeout)
            .apply(&ctx, options(None), &ActionData::default())
            .await;
        assert!(matches!(result, Err(ModerationError::InvalidDuration(_))));
        assert!(ctx.manager.fetch(EntryFilter::default()).await.unwrap().is_empty());
    }

    #[test]
    fn test_configuration_table() {
        for kind in TypeVariation::ALL {
            let action = action_for(kind);
            assert_eq!(action.kind(), kind);
            assert!(action.config().log_prefix.starts_with("Moderation => "));
            // Kinds that expire on their own are exactly the undoable ones Discord does not time
            assert_eq!(
                kind.undo_task_name().is_some(),
                action.config().is_undo_action_available && !action.config().duration_external
            );
        }
        assert_eq!(action_for(TypeVariation::Timeout).config().maximum_duration, 28 * DAY);
        assert_eq!(action_for(TypeVariation::Timeout).config().minimum_duration, 5 * SECOND);
    }
}

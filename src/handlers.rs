use crate::moderation::{CreateData, Entry, ModerationResult, TypeMetadata, TypeVariation};
use crate::settings::schema;
use crate::{Data, EVENT_TARGET};
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{
    self as serenity, Context, EventHandler, GuildId, GuildMemberUpdateEvent, Member, Ready, User,
};
use tracing::{debug, error, info, warn};

/// A punishment applied or lifted outside the bot, seen through the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub guild_id: u64,
    pub user_id: u64,
    pub kind: TypeVariation,
    pub undo: bool,
    /// Milliseconds, for timeouts
    pub duration: Option<u64>,
    /// Boolean setting that enables recording this event
    pub setting: &'static str,
}

impl ExternalEvent {
    #[must_use]
    pub fn ban(guild_id: u64, user_id: u64) -> Self {
        Self {
            guild_id,
            user_id,
            kind: TypeVariation::Ban,
            undo: false,
            duration: None,
            setting: schema::EVENTS_BAN_ADD,
        }
    }

    #[must_use]
    pub fn unban(guild_id: u64, user_id: u64) -> Self {
        Self {
            undo: true,
            setting: schema::EVENTS_BAN_REMOVE,
            ..Self::ban(guild_id, user_id)
        }
    }

    #[must_use]
    pub fn timeout(guild_id: u64, user_id: u64, duration: Option<u64>) -> Self {
        Self {
            guild_id,
            user_id,
            kind: TypeVariation::Timeout,
            undo: duration.is_none(),
            duration,
            setting: schema::EVENTS_TIMEOUT,
        }
    }
}

/// Record an external punishment as an entry.
///
/// Waits for in-flight mutations of the guild first, so an entry the bot is
/// inserting for its own action is visible, then skips the event if a similar
/// entry was just created.
///
/// # Errors
/// Returns an error if the settings cannot be read or the entry cannot be inserted.
pub async fn record_external_event(data: &Data, event: ExternalEvent) -> ModerationResult<Option<Entry>> {
    let settings = data.settings.read(event.guild_id).await?;
    if !settings.bool(event.setting) {
        return Ok(None);
    }

    let manager = data.moderation.get(event.guild_id);
    manager.wait_lock().await;
    if manager.check_similar_entry_has_been_created(event.kind, event.user_id) {
        debug!(
            target: EVENT_TARGET,
            guild_id = %event.guild_id,
            user_id = %event.user_id,
            action_type = %event.kind,
            "Skipping event already recorded by the bot"
        );
        return Ok(None);
    }

    let metadata = if event.undo {
        TypeMetadata::UNDO
    } else {
        TypeMetadata::empty()
    };
    let draft = manager.create(CreateData {
        kind: Some(event.kind),
        user_id: Some(event.user_id),
        duration: event.duration,
        metadata,
        ..CreateData::default()
    })?;
    manager.insert(draft).await.map(Some)
}

/// Remaining timeout in milliseconds, `None` when the timeout is lifted or already over
fn remaining_timeout(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    let remaining = until? - now;
    u64::try_from(remaining.num_milliseconds()).ok().filter(|ms| *ms > 0)
}

pub struct Handler {
    pub data: Data,
}

impl Handler {
    #[must_use]
    pub fn new(data: Data) -> Self {
        Self { data }
    }

    async fn record(&self, event: ExternalEvent) {
        let guild_id = event.guild_id;
        let user_id = event.user_id;
        match record_external_event(&self.data, event).await {
            Ok(Some(entry)) => info!(
                target: EVENT_TARGET,
                guild_id = %guild_id,
                user_id = %user_id,
                case_id = %entry.id,
                action_type = %entry.kind,
                "Recorded external moderation event"
            ),
            Ok(None) => {}
            Err(e) => error!(
                target: EVENT_TARGET,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %e,
                "Failed to record external moderation event"
            ),
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        self.data.set_bot_user_id(ready.user.id.get());
        info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                target: EVENT_TARGET,
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");
    }

    async fn guild_ban_addition(&self, _ctx: Context, guild_id: GuildId, banned_user: User) {
        self.record(ExternalEvent::ban(guild_id.get(), banned_user.id.get()))
            .await;
    }

    async fn guild_ban_removal(&self, _ctx: Context, guild_id: GuildId, unbanned_user: User) {
        self.record(ExternalEvent::unban(guild_id.get(), unbanned_user.id.get()))
            .await;
    }

    async fn guild_member_update(
        &self,
        _ctx: Context,
        old_if_available: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        let until = event
            .communication_disabled_until
            .and_then(|until| DateTime::from_timestamp(until.unix_timestamp(), 0));
        let previous = old_if_available.map(|member| {
            member
                .communication_disabled_until
                .and_then(|until| DateTime::from_timestamp(until.unix_timestamp(), 0))
        });
        // Without the old member only new timeouts can be told apart from other updates
        if previous.is_some_and(|previous| previous == until) {
            return;
        }

        let now = Utc::now();
        let event = match (remaining_timeout(until, now), previous) {
            (Some(duration), _) => ExternalEvent::timeout(event.guild_id.get(), event.user.id.get(), Some(duration)),
            (None, Some(previous)) if remaining_timeout(previous, now).is_some() => {
                ExternalEvent::timeout(event.guild_id.get(), event.user.id.get(), None)
            }
            _ => return,
        };
        self.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::moderation::action::HookFuture;
    use crate::moderation::{
        ActionContext, ActionData, ActionHooks, ActionOptions, EntryFilter, HookScope,
        MockGuildOperations, ModerationAction,
    };
    use crate::settings::{SettingValue, SettingsPatch, write_settings};
    use std::sync::{Arc, LazyLock};
    use tokio::sync::Notify;

    /// Signalled once the gated ban reached Discord
    static BAN_SENT: LazyLock<Notify> = LazyLock::new(Notify::new);
    /// Lets the gated ban finish
    static BAN_RELEASE: LazyLock<Notify> = LazyLock::new(Notify::new);

    const GUILD: u64 = 10;
    const USER: u64 = 20;

    async fn data_with_events(ops: MockGuildOperations, enabled: bool) -> Data {
        let data = Data::in_memory(BotConfig::default(), Arc::new(ops));
        let patch = SettingsPatch::from([
            (schema::EVENTS_BAN_ADD.to_string(), SettingValue::Bool(enabled)),
            (schema::EVENTS_BAN_REMOVE.to_string(), SettingValue::Bool(enabled)),
            (schema::EVENTS_TIMEOUT.to_string(), SettingValue::Bool(enabled)),
        ]);
        write_settings(&data.settings, GUILD, patch).await.unwrap();
        data
    }

    #[test]
    fn test_handler_implements_event_handler() {
        fn assert_impl<T: EventHandler>() {}
        assert_impl::<Handler>();
    }

    #[tokio::test]
    async fn test_disabled_events_are_ignored() {
        let data = data_with_events(MockGuildOperations::new(), false).await;
        let recorded = record_external_event(&data, ExternalEvent::ban(GUILD, USER)).await.unwrap();
        assert!(recorded.is_none());
        assert!(data.moderation.get(GUILD).fetch(EntryFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_external_ban_is_recorded() {
        let data = data_with_events(MockGuildOperations::new(), true).await;
        data.set_bot_user_id(99);

        let entry = record_external_event(&data, ExternalEvent::ban(GUILD, USER))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, TypeVariation::Ban);
        assert_eq!(entry.moderator_id, 99);
        assert!(!entry.is_undo());
    }

    #[tokio::test]
    async fn test_external_unban_is_recorded_as_undo() {
        let data = data_with_events(MockGuildOperations::new(), true).await;
        let entry = record_external_event(&data, ExternalEvent::unban(GUILD, USER))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, TypeVariation::Ban);
        assert!(entry.is_undo());
    }

    #[tokio::test]
    async fn test_ban_by_the_bot_is_not_recorded_twice() {
        let mut ops = MockGuildOperations::new();
        ops.expect_ban().returning(|_, _, _, _| Ok(()));
        let data = data_with_events(ops, true).await;

        let ctx = data.action_context(GUILD, "Guild");
        let ban = data.actions.get(TypeVariation::Ban).unwrap();
        ban.apply(&ctx, ActionOptions::new(USER), &ActionData::default())
            .await
            .unwrap();

        let recorded = record_external_event(&data, ExternalEvent::ban(GUILD, USER)).await.unwrap();
        assert!(recorded.is_none());
        let entries = data.moderation.get(GUILD).fetch(EntryFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    fn gated_ban<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
        Box::pin(async move {
            ctx.ops.ban(ctx.guild_id, scope.entry.user_id, 0, None).await?;
            BAN_SENT.notify_one();
            BAN_RELEASE.notified().await;
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_ban_event_during_own_ban_is_not_recorded() {
        let mut ops = MockGuildOperations::new();
        ops.expect_ban().times(1).returning(|_, _, _, _| Ok(()));
        let data = data_with_events(ops, true).await;

        let config = *data.actions.get(TypeVariation::Ban).unwrap().config();
        let ban = ModerationAction::new(
            config,
            ActionHooks {
                apply_pre: Some(gated_ban),
                ..Default::default()
            },
        );
        let ctx = data.action_context(GUILD, "Guild");
        let applying = tokio::spawn(async move {
            ban.apply(&ctx, ActionOptions::new(USER), &ActionData::default())
                .await
        });

        // The gateway reports the ban while the bot is still recording it
        BAN_SENT.notified().await;
        let external = {
            let data = data.clone();
            tokio::spawn(async move { record_external_event(&data, ExternalEvent::ban(GUILD, USER)).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!external.is_finished());

        BAN_RELEASE.notify_one();
        let entry = applying.await.unwrap().unwrap();
        assert!(external.await.unwrap().unwrap().is_none());

        let entries = data.moderation.get(GUILD).fetch(EntryFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[&entry.id].kind, TypeVariation::Ban);
    }

    #[tokio::test]
    async fn test_external_timeout_records_duration() {
        let data = data_with_events(MockGuildOperations::new(), true).await;
        let entry = record_external_event(&data, ExternalEvent::timeout(GUILD, USER, Some(60_000)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, TypeVariation::Timeout);
        assert_eq!(entry.duration, Some(60_000));
        assert!(data.scheduler.pending().is_empty());
    }

    #[test]
    fn test_remaining_timeout() {
        let now = Utc::now();
        assert_eq!(remaining_timeout(Some(now + chrono::Duration::seconds(90)), now), Some(90_000));
        assert_eq!(remaining_timeout(Some(now - chrono::Duration::seconds(1)), now), None);
        assert_eq!(remaining_timeout(None, now), None);
    }
}

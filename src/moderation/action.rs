//! Moderation action protocol
//!
//! Every punishment kind is a [`ModerationAction`]: a static [`ActionConfig`]
//! plus an [`ActionHooks`] table of optional callbacks. `apply` and `undo` run
//! the same pipeline:
//!
//! resolve options, on-start hook, pre hook (may fail and abort), direct
//! message, post hook, insert.
//!
//! The guild lock is held from the pre hook until the entry is inserted, so a
//! gateway event caused by the Discord-side effect finds the entry once it can
//! observe the guild. If the pre hook fails, its error hook runs and the error
//! is returned. No entry is created and no message is sent in that case.

use crate::moderation::{
    CreateData, DraftEntry, Entry, EntryQuery, ExtraData, GuildLockGuard, GuildOperations,
    ModerationError, ModerationManager, ModerationResult, Notice, TypeMetadata, TypeVariation,
};
use crate::settings::{SettingsStore, schema};
use crate::MODERATION_TARGET;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SECOND: u64 = 1_000;
pub const MINUTE: u64 = 60 * SECOND;
pub const HOUR: u64 = 60 * MINUTE;
pub const DAY: u64 = 24 * HOUR;
pub const YEAR: u64 = 365 * DAY;

/// Boxed future returned by hooks
pub type HookFuture<'a, T = ()> = Pin<Box<dyn Future<Output = ModerationResult<T>> + Send + 'a>>;

/// Synchronous notification that a pipeline started
pub type StartHook = fn(&ActionContext, &DraftEntry);
/// Discord-side effect or follow-up for an entry about to be recorded
pub type EffectHook = for<'a> fn(&'a ActionContext, &'a HookScope<'a>) -> HookFuture<'a>;
/// Cleanup after a failed pre hook
pub type ErrorHook =
    for<'a> fn(&'a ActionContext, &'a DraftEntry, &'a ModerationError) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
/// Computes the kind-specific payload; `undo` tells which pipeline asks
pub type ExtraDataHook = for<'a> fn(&'a ActionContext, TypeVariation, bool) -> HookFuture<'a, Option<ExtraData>>;
/// Whether the punishment is currently in effect for a user
pub type ActiveHook = for<'a> fn(&'a ActionContext, TypeVariation, u64) -> HookFuture<'a, bool>;

/// Static configuration of a punishment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionConfig {
    pub kind: TypeVariation,
    /// Prefix used in log lines, such as `Moderation => Ban`
    pub log_prefix: &'static str,
    pub color: u32,
    pub is_undo_action_available: bool,
    pub duration_required: bool,
    /// Discord keeps the timer, so no expiry task is needed
    pub duration_external: bool,
    /// Milliseconds
    pub minimum_duration: u64,
    /// Milliseconds
    pub maximum_duration: u64,
}

impl ActionConfig {
    #[must_use]
    pub const fn new(kind: TypeVariation, log_prefix: &'static str, color: u32) -> Self {
        Self {
            kind,
            log_prefix,
            color,
            is_undo_action_available: false,
            duration_required: false,
            duration_external: false,
            minimum_duration: 0,
            maximum_duration: YEAR,
        }
    }

    #[must_use]
    pub const fn undoable(mut self) -> Self {
        self.is_undo_action_available = true;
        self
    }

    #[must_use]
    pub const fn duration_required(mut self) -> Self {
        self.duration_required = true;
        self.minimum_duration = 5 * SECOND;
        self
    }

    #[must_use]
    pub const fn duration_external(mut self, maximum_duration: u64) -> Self {
        self.duration_external = true;
        self.maximum_duration = maximum_duration;
        self
    }

    #[must_use]
    pub fn accepts_duration(&self) -> bool {
        self.is_undo_action_available || self.duration_external
    }

    /// Check a user-supplied duration against this kind's bounds.
    ///
    /// `None` and zero both mean permanent.
    ///
    /// # Errors
    /// Returns `InvalidDuration` when the duration is missing but required, out
    /// of bounds, or given to a kind that cannot expire.
    pub fn validate_duration(&self, duration: Option<u64>) -> ModerationResult<Option<u64>> {
        match duration.filter(|duration| *duration > 0) {
            None if self.duration_required => Err(ModerationError::InvalidDuration(format!(
                "{} requires a duration",
                self.kind
            ))),
            None => Ok(None),
            Some(_) if !self.accepts_duration() => Err(ModerationError::InvalidDuration(format!(
                "{} cannot be temporary",
                self.kind
            ))),
            Some(duration) if duration < self.minimum_duration => {
                Err(ModerationError::InvalidDuration(format!(
                    "{} must last at least {}",
                    self.kind,
                    format_duration(self.minimum_duration)
                )))
            }
            Some(duration) if duration > self.maximum_duration => {
                Err(ModerationError::InvalidDuration(format!(
                    "{} can last at most {}",
                    self.kind,
                    format_duration(self.maximum_duration)
                )))
            }
            Some(duration) => Ok(Some(duration)),
        }
    }
}

/// Optional callbacks of a punishment kind. Unset hooks are skipped.
#[derive(Clone, Copy, Default)]
pub struct ActionHooks {
    pub apply_pre_on_start: Option<StartHook>,
    pub apply_pre: Option<EffectHook>,
    pub apply_pre_on_error: Option<ErrorHook>,
    pub apply_post: Option<EffectHook>,
    pub undo_pre_on_start: Option<StartHook>,
    pub undo_pre: Option<EffectHook>,
    pub undo_pre_on_error: Option<ErrorHook>,
    pub undo_post: Option<EffectHook>,
    pub resolve_extra_data: Option<ExtraDataHook>,
    pub is_active: Option<ActiveHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Apply,
    Undo,
}

struct PhaseHooks {
    on_start: Option<StartHook>,
    pre: Option<EffectHook>,
    on_error: Option<ErrorHook>,
    post: Option<EffectHook>,
}

impl ActionHooks {
    fn phase(&self, phase: Phase) -> PhaseHooks {
        match phase {
            Phase::Apply => PhaseHooks {
                on_start: self.apply_pre_on_start,
                pre: self.apply_pre,
                on_error: self.apply_pre_on_error,
                post: self.apply_post,
            },
            Phase::Undo => PhaseHooks {
                on_start: self.undo_pre_on_start,
                pre: self.undo_pre,
                on_error: self.undo_pre_on_error,
                post: self.undo_post,
            },
        }
    }
}

/// Everything an action needs about the guild it runs in
#[derive(Clone)]
pub struct ActionContext {
    pub guild_id: u64,
    pub guild_name: String,
    pub manager: Arc<ModerationManager>,
    pub ops: Arc<dyn GuildOperations>,
    pub settings: SettingsStore,
    /// Message history removed by bans, in seconds
    pub delete_message_seconds: u32,
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("guild_id", &self.guild_id)
            .field("guild_name", &self.guild_name)
            .finish_non_exhaustive()
    }
}

/// What an effect hook works on
pub struct HookScope<'a> {
    pub entry: &'a DraftEntry,
    /// Held until the entry is inserted; ledger writes from hooks go through it
    pub guard: &'a GuildLockGuard,
    /// The entry an undo lifts. Unset means the oldest open entry of the user.
    pub case_id: Option<u64>,
}

/// Target and details of an apply or undo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOptions {
    pub user_id: u64,
    /// Defaults to the bot itself
    pub moderator_id: Option<u64>,
    pub reason: Option<String>,
    /// Milliseconds; `None` or zero means permanent
    pub duration: Option<u64>,
    /// Entry an undo lifts, such as the one whose duration elapsed
    pub case_id: Option<u64>,
}

impl ActionOptions {
    #[must_use]
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }
}

/// Per-call behavior switches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionData {
    pub send_direct_message: bool,
    /// Moderator name shown in the direct message
    pub moderator: Option<String>,
}

/// A punishment kind: its configuration and its hooks
#[derive(Clone, Copy)]
pub struct ModerationAction {
    config: ActionConfig,
    hooks: ActionHooks,
}

impl std::fmt::Debug for ModerationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationAction")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModerationAction {
    #[must_use]
    pub const fn new(config: ActionConfig, hooks: ActionHooks) -> Self {
        Self { config, hooks }
    }

    #[must_use]
    pub fn config(&self) -> &ActionConfig {
        &self.config
    }

    #[must_use]
    pub fn kind(&self) -> TypeVariation {
        self.config.kind
    }

    /// Apply the punishment and record it
    ///
    /// # Errors
    /// Returns the pre hook's error, an unclassified direct message failure, or
    /// a persistence error. No entry exists afterwards in any of those cases.
    pub async fn apply(
        &self,
        ctx: &ActionContext,
        options: ActionOptions,
        data: &ActionData,
    ) -> ModerationResult<Entry> {
        self.run(ctx, options, data, Phase::Apply).await
    }

    /// Lift the punishment and record the reversal with the `UNDO` flag
    ///
    /// # Errors
    /// Returns `UndoUnavailable` for kinds that cannot be undone, otherwise the
    /// same errors as [`ModerationAction::apply`].
    pub async fn undo(
        &self,
        ctx: &ActionContext,
        options: ActionOptions,
        data: &ActionData,
    ) -> ModerationResult<Entry> {
        if !self.config.is_undo_action_available {
            return Err(ModerationError::UndoUnavailable(self.config.kind.to_string()));
        }
        self.run(ctx, options, data, Phase::Undo).await
    }

    /// Whether the punishment is currently in effect. Kinds without state answer `false`.
    ///
    /// # Errors
    /// Returns an error if Discord or the settings cannot be queried.
    pub async fn is_active(&self, ctx: &ActionContext, user_id: u64) -> ModerationResult<bool> {
        match self.hooks.is_active {
            Some(is_active) => is_active(ctx, self.config.kind, user_id).await,
            None => Ok(false),
        }
    }

    /// Oldest open entry of this kind for the user
    ///
    /// # Errors
    /// Returns an error if the entries cannot be fetched.
    pub async fn retrieve_last_moderation_entry_from_user(
        &self,
        ctx: &ActionContext,
        query: &EntryQuery<'_>,
    ) -> ModerationResult<Option<Entry>> {
        ctx.manager.retrieve_last_entry_from_user(query).await
    }

    /// Complete the oldest open entry for the user if it is temporary, taking
    /// the guild lock for the duration.
    ///
    /// # Errors
    /// Returns an error if the entries cannot be fetched or saved.
    pub async fn complete_last_moderation_entry_from_user(
        &self,
        ctx: &ActionContext,
        query: &EntryQuery<'_>,
    ) -> ModerationResult<Option<Entry>> {
        let guard = ctx.manager.create_lock().await;
        complete_last_entry_from_user(&ctx.manager, &guard, query).await
    }

    async fn run(
        &self,
        ctx: &ActionContext,
        options: ActionOptions,
        data: &ActionData,
        phase: Phase,
    ) -> ModerationResult<Entry> {
        let prefix = self.config.log_prefix;
        let case_id = options.case_id;
        let create = self.resolve_options(ctx, options, phase).await?;
        let draft = ctx.manager.create(create)?;
        let hooks = self.hooks.phase(phase);

        let guard = ctx.manager.create_lock().await;
        let scope = HookScope {
            entry: &draft,
            guard: &guard,
            case_id,
        };

        if let Some(on_start) = hooks.on_start {
            on_start(ctx, &draft);
        }

        if let Some(pre) = hooks.pre {
            if let Err(e) = pre(ctx, &scope).await {
                if let Some(on_error) = hooks.on_error {
                    on_error(ctx, &draft, &e).await;
                }
                warn!(
                    target: MODERATION_TARGET,
                    guild_id = %ctx.guild_id,
                    user_id = %draft.user_id,
                    action_type = %draft.kind,
                    "{prefix} => Aborted: {e}"
                );
                return Err(e);
            }
        }

        if data.send_direct_message {
            self.send_direct_message(ctx, &draft, data).await?;
        }

        if let Some(post) = hooks.post {
            post(ctx, &scope).await?;
        }

        let entry = ctx.manager.insert_locked(&guard, draft).await?;
        drop(guard);
        info!(
            target: MODERATION_TARGET,
            guild_id = %ctx.guild_id,
            case_id = %entry.id,
            user_id = %entry.user_id,
            "{prefix} => {}",
            if phase == Phase::Undo { "Reverted" } else { "Applied" }
        );
        Ok(entry)
    }

    async fn resolve_options(
        &self,
        ctx: &ActionContext,
        options: ActionOptions,
        phase: Phase,
    ) -> ModerationResult<CreateData> {
        let undo = phase == Phase::Undo;
        let extra_data = match self.hooks.resolve_extra_data {
            Some(resolve) => resolve(ctx, self.config.kind, undo).await?,
            None => None,
        };

        Ok(CreateData {
            kind: Some(self.config.kind),
            user_id: Some(options.user_id),
            moderator_id: options.moderator_id,
            reason: options.reason,
            // Reversals are permanent records
            duration: options.duration.filter(|duration| *duration > 0 && !undo),
            extra_data,
            metadata: if undo {
                TypeMetadata::UNDO
            } else {
                TypeMetadata::empty()
            },
        })
    }

    async fn send_direct_message(
        &self,
        ctx: &ActionContext,
        draft: &DraftEntry,
        data: &ActionData,
    ) -> ModerationResult<()> {
        let settings = ctx.settings.read(ctx.guild_id).await?;
        let notice = self.build_direct_message(
            ctx,
            draft,
            data,
            settings.text(schema::MESSAGES_MODERATION_DM),
        );

        match ctx.ops.send_direct_message(draft.user_id, notice).await {
            Ok(()) => Ok(()),
            Err(ModerationError::CannotMessageUser(user_id)) => {
                debug!(
                    target: MODERATION_TARGET,
                    guild_id = %ctx.guild_id,
                    user_id = %user_id,
                    "{} => User does not accept direct messages",
                    self.config.log_prefix
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    target: MODERATION_TARGET,
                    guild_id = %ctx.guild_id,
                    user_id = %draft.user_id,
                    action_type = %draft.kind,
                    "{} => Failed to send direct message: {e}",
                    self.config.log_prefix
                );
                Err(e)
            }
        }
    }

    fn build_direct_message(
        &self,
        ctx: &ActionContext,
        draft: &DraftEntry,
        data: &ActionData,
        custom_message: Option<&str>,
    ) -> Notice {
        let kind = if draft.is_undo() {
            format!("{} (Reverted)", draft.kind)
        } else {
            draft.kind.to_string()
        };

        let mut notice = Notice::new(ctx.guild_name.clone())
            .description(format!("You received a moderation action: **{kind}**"))
            .color(self.config.color)
            .field(
                "Reason",
                draft.reason.clone().unwrap_or_else(|| "No reason specified".to_string()),
            )
            .timestamp(draft.created_at);

        if let Some(duration) = draft.duration {
            notice = notice.field("Duration", format_duration(duration));
        }
        if let Some(moderator) = &data.moderator {
            notice = notice.field("Moderator", moderator.clone());
        }
        if let Some(message) = custom_message {
            notice = notice.footer(message);
        }
        notice
    }
}

/// Complete the oldest open entry matching `query`, but only if it is temporary.
///
/// Returns the entry found, completed or not. Permanent entries have nothing to
/// complete and are returned as they are.
///
/// # Errors
/// Returns an error if the entries cannot be fetched or saved.
pub async fn complete_last_entry_from_user(
    manager: &ModerationManager,
    guard: &GuildLockGuard,
    query: &EntryQuery<'_>,
) -> ModerationResult<Option<Entry>> {
    let Some(entry) = manager.retrieve_last_entry_from_user(query).await? else {
        return Ok(None);
    };
    if !entry.is_temporary() || entry.is_completed() {
        return Ok(Some(entry));
    }
    manager.complete_locked(guard, &entry).await.map(Some)
}

/// Dispatch table of actions keyed by punishment kind
pub struct ActionRegistry {
    actions: HashMap<TypeVariation, ModerationAction>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Registry with every built-in kind
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for kind in TypeVariation::ALL {
            registry.register(crate::moderation::kinds::action_for(kind));
        }
        registry
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action, replacing any action of the same kind
    pub fn register(&mut self, action: ModerationAction) {
        self.actions.insert(action.kind(), action);
    }

    /// # Errors
    /// Returns `UnknownAction` if no action is registered for the kind.
    pub fn get(&self, kind: TypeVariation) -> ModerationResult<&ModerationAction> {
        self.actions
            .get(&kind)
            .ok_or_else(|| ModerationError::UnknownAction(kind.to_string()))
    }
}

/// Compact human readable duration, such as `1d 2h 30m`
#[must_use]
pub fn format_duration(milliseconds: u64) -> String {
    let units = [("y", YEAR), ("d", DAY), ("h", HOUR), ("m", MINUTE), ("s", SECOND)];
    let mut remaining = milliseconds;
    let parts: Vec<String> = units
        .iter()
        .filter_map(|(suffix, size)| {
            let count = remaining / size;
            remaining %= size;
            (count > 0).then(|| format!("{count}{suffix}"))
        })
        .collect();

    if parts.is_empty() {
        format!("{milliseconds}ms")
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{
        EntryFilter, LockRegistry, MemoryEntryRepository, MockExpiryScheduler, MockGuildOperations,
        ModerationRegistry,
    };
    use crate::settings::{MemorySettingsRepository, SettingValue, SettingsPatch, write_settings};
    use chrono::Duration;
    use mockall::{Sequence, predicate::eq};

    const GUILD: u64 = 10;
    const USER: u64 = 20;
    const MODERATOR: u64 = 30;

    fn context(ops: MockGuildOperations) -> ActionContext {
        let mut scheduler = MockExpiryScheduler::new();
        scheduler.expect_add().returning(|_, _, _| Ok(()));
        let locks = LockRegistry::new();
        let registry = ModerationRegistry::new(
            Arc::new(MemoryEntryRepository::new()),
            locks.clone(),
            Arc::new(scheduler),
            Duration::seconds(15),
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

    fn options() -> ActionOptions {
        ActionOptions {
            user_id: USER,
            moderator_id: Some(MODERATOR),
            reason: Some("spam".to_string()),
            duration: None,
            case_id: None,
        }
    }

    fn with_dm() -> ActionData {
        ActionData {
            send_direct_message: true,
            moderator: Some("Moderator#0001".to_string()),
        }
    }

    fn kick_pre<'a>(ctx: &'a ActionContext, scope: &'a HookScope<'a>) -> HookFuture<'a> {
        Box::pin(async move {
            let entry = scope.entry;
            ctx.ops.kick(ctx.guild_id, entry.user_id, entry.reason.clone()).await
        })
    }

    fn failing_pre<'a>(_: &'a ActionContext, _: &'a HookScope<'a>) -> HookFuture<'a> {
        Box::pin(async { Err(ModerationError::Other("Missing Permissions".to_string())) })
    }

    fn cleanup_on_error<'a>(
        ctx: &'a ActionContext,
        entry: &'a DraftEntry,
        _: &'a ModerationError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = ctx.ops.remove_role(ctx.guild_id, entry.user_id, 99, None).await;
        })
    }

    fn test_action(hooks: ActionHooks) -> ModerationAction {
        ModerationAction::new(
            ActionConfig::new(TypeVariation::Kick, "Moderation => Kick", 0xF57F17),
            hooks,
        )
    }

    async fn stored(ctx: &ActionContext) -> Vec<Entry> {
        ctx.manager
            .fetch(EntryFilter::default())
            .await
            .unwrap()
            .into_values()
            .collect()
    }

    #[tokio::test]
    async fn test_apply_runs_hooks_in_order() {
        let mut ops = MockGuildOperations::new();
        let mut sequence = Sequence::new();
        ops.expect_kick()
            .with(eq(GUILD), eq(USER), eq(Some("spam".to_string())))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));
        ops.expect_send_direct_message()
            .withf(|user_id, notice| {
                *user_id == USER
                    && notice.title == "Test Guild"
                    && notice.fields.contains(&("Moderator".to_string(), "Moderator#0001".to_string()))
            })
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));

        let ctx = context(ops);
        let action = test_action(ActionHooks {
            apply_pre: Some(kick_pre),
            ..Default::default()
        });

        let entry = action.apply(&ctx, options(), &with_dm()).await.unwrap();
        assert_eq!(entry.kind, TypeVariation::Kick);
        assert_eq!(entry.moderator_id, MODERATOR);
        assert!(!entry.is_undo());
        assert_eq!(stored(&ctx).await, vec![entry]);
    }

    #[tokio::test]
    async fn test_failed_pre_hook_aborts_without_entry_or_message() {
        let mut ops = MockGuildOperations::new();
        ops.expect_send_direct_message().never();
        ops.expect_remove_role().times(1).returning(|_, _, _, _| Ok(()));

        let ctx = context(ops);
        let action = test_action(ActionHooks {
            apply_pre: Some(failing_pre),
            apply_pre_on_error: Some(cleanup_on_error),
            ..Default::default()
        });

        let result = action.apply(&ctx, options(), &with_dm()).await;
        assert!(matches!(result, Err(ModerationError::Other(ref message)) if message == "Missing Permissions"));
        assert!(stored(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_direct_messages_are_swallowed() {
        let mut ops = MockGuildOperations::new();
        ops.expect_send_direct_message()
            .returning(|user_id, _| Err(ModerationError::CannotMessageUser(user_id)));

        let ctx = context(ops);
        let entry = test_action(ActionHooks::default())
            .apply(&ctx, options(), &with_dm())
            .await
            .unwrap();

        assert_eq!(stored(&ctx).await, vec![entry]);
    }

    #[tokio::test]
    async fn test_other_direct_message_failures_abort() {
        let mut ops = MockGuildOperations::new();
        ops.expect_send_direct_message()
            .returning(|_, _| Err(ModerationError::Other("gateway unavailable".to_string())));

        let ctx = context(ops);
        let result = test_action(ActionHooks::default())
            .apply(&ctx, options(), &with_dm())
            .await;

        assert!(matches!(result, Err(ModerationError::Other(_))));
        assert!(stored(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_direct_message_is_opt_in() {
        let mut ops = MockGuildOperations::new();
        ops.expect_send_direct_message().never();

        let ctx = context(ops);
        test_action(ActionHooks::default())
            .apply(&ctx, options(), &ActionData::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_direct_message_carries_guild_footer() {
        let mut ops = MockGuildOperations::new();
        ops.expect_send_direct_message()
            .withf(|_, notice| notice.footer.as_deref() == Some("Appeal at example.com"))
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(ops);
        let patch = SettingsPatch::from([(
            schema::MESSAGES_MODERATION_DM.to_string(),
            SettingValue::Text("Appeal at example.com".to_string()),
        )]);
        write_settings(&ctx.settings, GUILD, patch).await.unwrap();

        test_action(ActionHooks::default())
            .apply(&ctx, options(), &with_dm())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_undo_requires_availability() {
        let ctx = context(MockGuildOperations::new());
        let result = test_action(ActionHooks::default())
            .undo(&ctx, options(), &ActionData::default())
            .await;
        assert!(matches!(result, Err(ModerationError::UndoUnavailable(_))));
    }

    #[tokio::test]
    async fn test_undo_stamps_metadata_and_drops_duration() {
        let ctx = context(MockGuildOperations::new());
        let action = ModerationAction::new(
            ActionConfig::new(TypeVariation::Warning, "Moderation => Warning", 0xFFD600).undoable(),
            ActionHooks::default(),
        );

        let mut undo_options = options();
        undo_options.duration = Some(60_000);
        let entry = action.undo(&ctx, undo_options, &ActionData::default()).await.unwrap();
        assert!(entry.is_undo());
        assert_eq!(entry.duration, None);
    }

    #[tokio::test]
    async fn test_zero_duration_is_permanent() {
        let ctx = context(MockGuildOperations::new());
        let mut apply_options = options();
        apply_options.duration = Some(0);

        let entry = test_action(ActionHooks::default())
            .apply(&ctx, apply_options, &ActionData::default())
            .await
            .unwrap();
        assert_eq!(entry.duration, None);
    }

    #[tokio::test]
    async fn test_is_active_defaults_to_false() {
        let ctx = context(MockGuildOperations::new());
        assert!(!test_action(ActionHooks::default()).is_active(&ctx, USER).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_last_returns_permanent_entry_open() {
        let ctx = context(MockGuildOperations::new());
        let action = test_action(ActionHooks::default());

        let permanent = action.apply(&ctx, options(), &ActionData::default()).await.unwrap();
        let query = EntryQuery::new(USER, TypeVariation::Kick);
        let found = action
            .complete_last_moderation_entry_from_user(&ctx, &query)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, permanent.id);
        assert!(!found.completed);
        assert!(!ctx.manager.fetch_one(permanent.id).await.unwrap().unwrap().completed);

        let query = EntryQuery::new(USER + 1, TypeVariation::Kick);
        assert!(action
            .complete_last_moderation_entry_from_user(&ctx, &query)
            .await
            .unwrap()
            .is_none());
    }

    fn holds_lock_pre<'a>(ctx: &'a ActionContext, _: &'a HookScope<'a>) -> HookFuture<'a> {
        Box::pin(async move {
            assert!(ctx.manager.is_locked());
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_lock_is_held_from_pre_hook_through_insert() {
        let ctx = context(MockGuildOperations::new());
        let action = test_action(ActionHooks {
            apply_pre: Some(holds_lock_pre),
            apply_post: Some(holds_lock_pre),
            ..Default::default()
        });

        action.apply(&ctx, options(), &ActionData::default()).await.unwrap();
        assert!(!ctx.manager.is_locked());
    }

    #[tokio::test]
    async fn test_failed_pre_hook_releases_lock() {
        let ctx = context(MockGuildOperations::new());
        let action = test_action(ActionHooks {
            apply_pre: Some(failing_pre),
            ..Default::default()
        });

        assert!(action.apply(&ctx, options(), &ActionData::default()).await.is_err());
        assert!(!ctx.manager.is_locked());
    }

    #[tokio::test]
    async fn test_complete_last_completes_temporary_entry() {
        let ctx = context(MockGuildOperations::new());
        let action = ModerationAction::new(
            ActionConfig::new(TypeVariation::Warning, "Moderation => Warning", 0xFFD600).undoable(),
            ActionHooks::default(),
        );
        let mut temporary = options();
        temporary.duration = Some(60_000);
        let entry = action.apply(&ctx, temporary, &ActionData::default()).await.unwrap();

        let query = EntryQuery::new(USER, TypeVariation::Warning);
        let completed = action
            .complete_last_moderation_entry_from_user(&ctx, &query)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.id, entry.id);
        assert!(completed.completed);
        assert!(action
            .retrieve_last_moderation_entry_from_user(&ctx, &query)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_validate_duration() {
        let mute = ActionConfig::new(TypeVariation::Mute, "Moderation => Mute", 0).undoable();
        assert_eq!(mute.validate_duration(None).unwrap(), None);
        assert_eq!(mute.validate_duration(Some(0)).unwrap(), None);
        assert_eq!(mute.validate_duration(Some(MINUTE)).unwrap(), Some(MINUTE));
        assert!(mute.validate_duration(Some(2 * YEAR)).is_err());

        let timeout = ActionConfig::new(TypeVariation::Timeout, "Moderation => Timeout", 0)
            .undoable()
            .duration_required()
            .duration_external(28 * DAY);
        assert!(timeout.validate_duration(None).is_err());
        assert!(timeout.validate_duration(Some(SECOND)).is_err());
        assert!(timeout.validate_duration(Some(29 * DAY)).is_err());
        assert_eq!(timeout.validate_duration(Some(DAY)).unwrap(), Some(DAY));

        let kick = ActionConfig::new(TypeVariation::Kick, "Moderation => Kick", 0);
        assert!(matches!(
            kick.validate_duration(Some(MINUTE)),
            Err(ModerationError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(90 * MINUTE), "1h 30m");
        assert_eq!(format_duration(DAY + 5 * SECOND), "1d 5s");
        assert_eq!(format_duration(500), "500ms");
    }

    #[test]
    fn test_registry_covers_every_kind() {
        let registry = ActionRegistry::new();
        for kind in TypeVariation::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
        assert!(matches!(
            ActionRegistry::empty().get(TypeVariation::Ban),
            Err(ModerationError::UnknownAction(_))
        ));
    }
}

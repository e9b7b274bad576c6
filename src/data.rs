use std::sync::Arc;

use crate::config::BotConfig;
use crate::moderation::{
    ActionContext, ActionRegistry, EntryRepository, ExpiryHandler, ExpiryScheduler,
    GuildOperations, LockRegistry, MemoryEntryRepository, ModerationLogListener,
    ModerationRegistry, ModerationResult, TaskScheduler, YamlEntryRepository,
};
use crate::settings::{
    MemorySettingsRepository, SettingsRepository, SettingsResult, SettingsStore,
    YamlSettingsRepository,
};
use crate::{CONSOLE_TARGET, MODERATION_TARGET};
use derive_more::Deref;
use tokio::task::JoinHandle;
use tracing::info;

/// Shared bot state handed to every command and event handler
#[derive(Clone, Deref)]
#[deref(forward)]
pub struct Data(pub Arc<DataInner>);

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .field("moderation", &self.moderation)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Data {
    /// Bot state persisting entries, settings and scheduled tasks under `config.data_dir`
    #[must_use]
    pub fn new(config: BotConfig, ops: Arc<dyn GuildOperations>) -> Self {
        let entries = Arc::new(YamlEntryRepository::new(&config.data_dir));
        let settings = Arc::new(YamlSettingsRepository::new(&config.data_dir));
        let scheduler = Arc::new(TaskScheduler::new(
            &config.data_dir,
            config.scheduler_interval_seconds,
        ));
        Self(Arc::new(DataInner::new(config, ops, entries, settings, scheduler)))
    }

    /// Bot state that keeps everything in memory
    #[must_use]
    pub fn in_memory(config: BotConfig, ops: Arc<dyn GuildOperations>) -> Self {
        let scheduler = Arc::new(TaskScheduler::in_memory(config.scheduler_interval_seconds));
        Self(Arc::new(DataInner::new(
            config,
            ops,
            Arc::new(MemoryEntryRepository::new()),
            Arc::new(MemorySettingsRepository::new()),
            scheduler,
        )))
    }

    /// Load pending expiry tasks, then start the scheduler loop and the
    /// moderation log listener.
    ///
    /// # Errors
    /// Returns an error if the saved schedule cannot be read.
    pub async fn start_background_tasks(&self) -> ModerationResult<JoinHandle<()>> {
        let loaded = self.scheduler.load().await?;
        let handler = Arc::new(ExpiryHandler::new(
            self.moderation.clone(),
            Arc::clone(&self.actions),
            Arc::clone(&self.ops),
            self.settings.clone(),
        ));
        Arc::clone(&self.scheduler)
            .start(handler, self.config.scheduler_interval_seconds)
            .await;

        let listener = ModerationLogListener::new(self.settings.clone(), Arc::clone(&self.ops))
            .spawn(self.moderation.subscribe());

        info!(
            target: CONSOLE_TARGET,
            pending_tasks = loaded,
            "Background tasks started"
        );
        Ok(listener)
    }
}

/// Main centralized data structure for the bot
pub struct DataInner {
    pub config: BotConfig,
    /// Guild locks shared by moderation entries and settings transactions
    pub locks: LockRegistry,
    pub moderation: ModerationRegistry,
    pub actions: Arc<ActionRegistry>,
    pub settings: SettingsStore,
    pub scheduler: Arc<TaskScheduler>,
    pub ops: Arc<dyn GuildOperations>,
}

impl DataInner {
    #[must_use]
    pub fn new(
        config: BotConfig,
        ops: Arc<dyn GuildOperations>,
        entries: Arc<dyn EntryRepository>,
        settings: Arc<dyn SettingsRepository>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        let locks = LockRegistry::new();
        let moderation = ModerationRegistry::new(
            entries,
            locks.clone(),
            Arc::clone(&scheduler) as Arc<dyn ExpiryScheduler>,
            config.similar_entry_window(),
        );
        let settings = SettingsStore::new(settings, locks.clone());

        Self {
            config,
            locks,
            moderation,
            actions: Arc::new(ActionRegistry::new()),
            settings,
            scheduler,
            ops,
        }
    }

    /// Context for running actions in a guild
    #[must_use]
    pub fn action_context(&self, guild_id: u64, guild_name: impl Into<String>) -> ActionContext {
        ActionContext {
            guild_id,
            guild_name: guild_name.into(),
            manager: self.moderation.get(guild_id),
            ops: Arc::clone(&self.ops),
            settings: self.settings.clone(),
            delete_message_seconds: self.config.delete_message_seconds,
        }
    }

    /// The guild's command prefix, or the configured default
    ///
    /// # Errors
    /// Returns an error if the guild settings cannot be loaded.
    pub async fn prefix(&self, guild_id: Option<u64>) -> SettingsResult<String> {
        let Some(guild_id) = guild_id else {
            return Ok(self.config.default_prefix.clone());
        };
        let settings = self.settings.read(guild_id).await?;
        Ok(settings
            .prefix()
            .map_or_else(|| self.config.default_prefix.clone(), ToString::to_string))
    }

    /// Record the bot's own user id once the gateway reports it
    pub fn set_bot_user_id(&self, user_id: u64) {
        self.moderation.set_bot_user_id(user_id);
        info!(target: MODERATION_TARGET, user_id, "Default moderator set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{ActionData, ActionOptions, MockGuildOperations, TypeVariation};
    use crate::settings::{SettingValue, SettingsPatch, schema, write_settings};
    use crate::storage::temp_dir;

    const GUILD: u64 = 10;

    fn config() -> BotConfig {
        BotConfig {
            default_prefix: "!".to_string(),
            ..BotConfig::default()
        }
    }

    #[tokio::test]
    async fn test_prefix_falls_back_to_default() {
        let data = Data::in_memory(config(), Arc::new(MockGuildOperations::new()));
        assert_eq!(data.prefix(None).await.unwrap(), "!");
        assert_eq!(data.prefix(Some(GUILD)).await.unwrap(), "!");

        let patch = SettingsPatch::from([(schema::PREFIX.to_string(), SettingValue::Text("?".to_string()))]);
        write_settings(&data.settings, GUILD, patch).await.unwrap();
        assert_eq!(data.prefix(Some(GUILD)).await.unwrap(), "?");
        assert_eq!(data.prefix(Some(GUILD + 1)).await.unwrap(), "!");
    }

    #[tokio::test]
    async fn test_action_context_shares_guild_manager() {
        let data = Data::in_memory(config(), Arc::new(MockGuildOperations::new()));
        let first = data.action_context(GUILD, "Guild");
        let second = data.action_context(GUILD, "Guild");
        assert!(Arc::ptr_eq(&first.manager, &second.manager));
        assert_eq!(first.guild_name, "Guild");
        assert_eq!(first.delete_message_seconds, 0);
    }

    #[tokio::test]
    async fn test_default_moderator_is_bot_user() {
        let mut ops = MockGuildOperations::new();
        ops.expect_kick().returning(|_, _, _| Ok(()));
        let data = Data::in_memory(config(), Arc::new(ops));
        data.set_bot_user_id(99);

        let ctx = data.action_context(GUILD, "Guild");
        let action = data.actions.get(TypeVariation::Kick).unwrap();
        let entry = action
            .apply(&ctx, ActionOptions::new(20), &ActionData::default())
            .await
            .unwrap();
        assert_eq!(entry.moderator_id, 99);
    }

    #[tokio::test]
    async fn test_entries_persist_across_restarts() {
        let dir = temp_dir("data-restart");
        let config = BotConfig {
            data_dir: dir.clone(),
            ..config()
        };

        let mut ops = MockGuildOperations::new();
        ops.expect_kick().returning(|_, _, _| Ok(()));
        let ops: Arc<dyn GuildOperations> = Arc::new(ops);

        let data = Data::new(config.clone(), Arc::clone(&ops));
        let ctx = data.action_context(GUILD, "Guild");
        let kick = data.actions.get(TypeVariation::Kick).unwrap();
        let first = kick
            .apply(&ctx, ActionOptions::new(20), &ActionData::default())
            .await
            .unwrap();
        drop(data);

        let data = Data::new(config, ops);
        let ctx = data.action_context(GUILD, "Guild");
        let kick = data.actions.get(TypeVariation::Kick).unwrap();
        let second = kick
            .apply(&ctx, ActionOptions::new(21), &ActionData::default())
            .await
            .unwrap();
        assert_eq!(second.id, first.id + 1);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

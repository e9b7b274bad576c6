//! Guild settings storage
//!
//! The repository persists one flat key-value map per guild. [`SettingsStore`]
//! adds a read-through cache and opens transactions under the guild lock.

use crate::moderation::LockRegistry;
use crate::settings::{GuildSettings, SettingsPatch, SettingsResult, SettingsTransaction};
use crate::storage::{read_yaml, write_yaml_atomic};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Storage for guild settings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Stored settings of a guild, `None` if it never wrote any
    async fn load(&self, guild_id: u64) -> SettingsResult<Option<GuildSettings>>;

    /// Merge `patch` into the stored settings in one atomic write and return the result
    async fn persist(&self, guild_id: u64, patch: SettingsPatch) -> SettingsResult<GuildSettings>;
}

/// In-memory repository
#[derive(Clone, Default)]
pub struct MemorySettingsRepository {
    guilds: Arc<DashMap<u64, GuildSettings>>,
}

impl MemorySettingsRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn load(&self, guild_id: u64) -> SettingsResult<Option<GuildSettings>> {
        Ok(self.guilds.get(&guild_id).map(|settings| settings.clone()))
    }

    async fn persist(&self, guild_id: u64, patch: SettingsPatch) -> SettingsResult<GuildSettings> {
        let mut settings = self.guilds.entry(guild_id).or_default();
        settings.apply(&patch);
        Ok(settings.clone())
    }
}

/// Repository keeping one YAML document per guild under `<data_dir>/settings/`
#[derive(Debug, Clone)]
pub struct YamlSettingsRepository {
    dir: PathBuf,
}

impl YamlSettingsRepository {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("settings"),
        }
    }

    fn path(&self, guild_id: u64) -> PathBuf {
        self.dir.join(format!("{guild_id}.yaml"))
    }
}

#[async_trait]
impl SettingsRepository for YamlSettingsRepository {
    async fn load(&self, guild_id: u64) -> SettingsResult<Option<GuildSettings>> {
        Ok(read_yaml(&self.path(guild_id)).await?)
    }

    async fn persist(&self, guild_id: u64, patch: SettingsPatch) -> SettingsResult<GuildSettings> {
        let mut settings = self.load(guild_id).await?.unwrap_or_default();
        settings.apply(&patch);
        write_yaml_atomic(&self.path(guild_id), &settings).await?;
        Ok(settings)
    }
}

/// Cached access to guild settings
#[derive(Clone)]
pub struct SettingsStore {
    repository: Arc<dyn SettingsRepository>,
    cache: Arc<DashMap<u64, GuildSettings>>,
    locks: LockRegistry,
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("cached_guilds", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl SettingsStore {
    /// `locks` must be the registry shared with the moderation managers
    #[must_use]
    pub fn new(repository: Arc<dyn SettingsRepository>, locks: LockRegistry) -> Self {
        Self {
            repository,
            cache: Arc::new(DashMap::new()),
            locks,
        }
    }

    /// Committed settings of a guild
    ///
    /// # Errors
    /// Returns an error if the settings are not cached and cannot be loaded.
    pub async fn read(&self, guild_id: u64) -> SettingsResult<GuildSettings> {
        if let Some(settings) = self.cache.get(&guild_id) {
            return Ok(settings.clone());
        }

        let settings = self.repository.load(guild_id).await?.unwrap_or_default();
        self.cache.insert(guild_id, settings.clone());
        Ok(settings)
    }

    /// Open a transaction, waiting for the guild lock first.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be loaded; the lock is released then.
    pub async fn open(&self, guild_id: u64) -> SettingsResult<SettingsTransaction> {
        let guard = self.locks.create_lock(guild_id).await;
        let snapshot = self.read(guild_id).await?;
        debug!(guild_id = %guild_id, "Settings transaction opened");
        Ok(SettingsTransaction::new(self.clone(), guard, snapshot))
    }

    pub(crate) async fn persist(
        &self,
        guild_id: u64,
        patch: SettingsPatch,
    ) -> SettingsResult<GuildSettings> {
        let settings = self.repository.persist(guild_id, patch).await?;
        self.cache.insert(guild_id, settings.clone());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{SettingValue, schema};

    fn patch(key: &str, value: SettingValue) -> SettingsPatch {
        SettingsPatch::from([(key.to_string(), value)])
    }

    async fn exercise(repository: &dyn SettingsRepository) {
        assert!(repository.load(1).await.unwrap().is_none());

        let mut update = patch(schema::PREFIX, SettingValue::Text("?".into()));
        update.insert(schema::EVENTS_BAN_ADD.to_string(), SettingValue::Bool(true));
        repository.persist(1, update).await.unwrap();

        let merged = repository
            .persist(1, patch(schema::ROLES_MUTED, SettingValue::Snowflake(7)))
            .await
            .unwrap();
        assert_eq!(merged.prefix(), Some("?"));
        assert_eq!(merged.snowflake(schema::ROLES_MUTED), Some(7));

        assert_eq!(repository.load(1).await.unwrap(), Some(merged));
        assert!(repository.load(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_repository() {
        exercise(&MemorySettingsRepository::new()).await;
    }

    #[tokio::test]
    async fn test_yaml_repository() {
        let dir = crate::storage::temp_dir("settings");
        exercise(&YamlSettingsRepository::new(&dir)).await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_read_is_cached() {
        let mut repository = MockSettingsRepository::new();
        repository
            .expect_load()
            .times(1)
            .returning(|_| Ok(None));

        let store = SettingsStore::new(Arc::new(repository), LockRegistry::new());
        assert_eq!(store.read(1).await.unwrap(), GuildSettings::new());
        assert_eq!(store.read(1).await.unwrap(), GuildSettings::new());
    }
}

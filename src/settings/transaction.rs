//! Settings transactions
//!
//! A transaction holds the guild lock from open until it is submitted or
//! dropped. Writes are staged in memory and persisted by `submit` as a single
//! merged patch. Dropping a transaction without submitting discards them.

use crate::moderation::GuildLockGuard;
use crate::settings::{GuildSettings, SettingsError, SettingsPatch, SettingsResult, SettingsStore};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

/// Future returned by the closure given to [`with_settings_transaction`]
pub type TransactionFuture<'t, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>;

/// Staged settings changes for one guild
pub struct SettingsTransaction {
    store: SettingsStore,
    guard: GuildLockGuard,
    settings: GuildSettings,
    pending: Vec<SettingsPatch>,
    submitted: bool,
}

impl std::fmt::Debug for SettingsTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsTransaction")
            .field("guild_id", &self.guard.guild_id())
            .field("pending", &self.pending.len())
            .field("submitted", &self.submitted)
            .finish()
    }
}

impl SettingsTransaction {
    pub(crate) fn new(store: SettingsStore, guard: GuildLockGuard, settings: GuildSettings) -> Self {
        Self {
            store,
            guard,
            settings,
            pending: Vec::new(),
            submitted: false,
        }
    }

    #[must_use]
    pub fn guild_id(&self) -> u64 {
        self.guard.guild_id()
    }

    /// The snapshot taken at open with every staged write applied
    #[must_use]
    pub fn settings(&self) -> &GuildSettings {
        &self.settings
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Stage a partial update. Later writes to a key override earlier ones.
    pub fn write(&mut self, patch: SettingsPatch) {
        self.settings.apply(&patch);
        self.pending.push(patch);
    }

    /// Persist every staged write as one unit and release the lock.
    ///
    /// Consuming the transaction rules out writing to it afterwards.
    ///
    /// # Errors
    /// Returns an error if persistence fails; nothing is stored in that case.
    pub async fn submit(mut self) -> SettingsResult<GuildSettings> {
        let guild_id = self.guild_id();
        if self.pending.is_empty() {
            self.submitted = true;
            return Ok(self.settings.clone());
        }

        let merged = std::mem::take(&mut self.pending).into_iter().fold(
            SettingsPatch::new(),
            |mut merged, patch| {
                merged.extend(patch);
                merged
            },
        );
        let keys = merged.keys().cloned().collect::<Vec<_>>().join(", ");

        let settings = self.store.persist(guild_id, merged).await?;
        self.submitted = true;
        info!(guild_id = %guild_id, keys = %keys, "Settings updated");
        Ok(settings)
    }
}

impl Drop for SettingsTransaction {
    fn drop(&mut self) {
        if !self.submitted && !self.pending.is_empty() {
            debug!(
                guild_id = %self.guard.guild_id(),
                discarded = self.pending.len(),
                "Settings transaction dropped without submit"
            );
        }
    }
}

/// Committed settings of a guild
///
/// # Errors
/// Returns an error if the settings cannot be loaded.
pub async fn read_settings(store: &SettingsStore, guild_id: u64) -> SettingsResult<GuildSettings> {
    store.read(guild_id).await
}

/// Apply one patch in its own transaction
///
/// # Errors
/// Returns an error if the settings cannot be loaded or persisted.
pub async fn write_settings(
    store: &SettingsStore,
    guild_id: u64,
    patch: SettingsPatch,
) -> SettingsResult<GuildSettings> {
    let mut transaction = store.open(guild_id).await?;
    transaction.write(patch);
    transaction.submit().await
}

/// Run `body` inside a transaction: submitted when it returns `Ok`, rolled back
/// when it returns `Err` or panics.
///
/// # Errors
/// Returns the body's error, or the open/submit failure converted into `E`.
pub async fn with_settings_transaction<T, E, F>(
    store: &SettingsStore,
    guild_id: u64,
    body: F,
) -> Result<T, E>
where
    E: From<SettingsError>,
    F: for<'t> FnOnce(&'t mut SettingsTransaction) -> TransactionFuture<'t, T, E>,
{
    let mut transaction = store.open(guild_id).await?;
    let value = body(&mut transaction).await?;
    transaction.submit().await?;
    Ok(value)
}

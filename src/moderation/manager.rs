//! Moderation manager
//!
//! One manager owns the entry ledger of one guild: it builds drafts, persists
//! them under the guild lock, closes them, and registers expiry tasks for
//! temporary punishments.

use crate::moderation::{
    CreateData, DraftEntry, Entry, EntryFilter, EntryRepository, ExpiryScheduler, GuildLockGuard,
    LockRegistry, ModerationError, ModerationResult, ScheduleOptions, TypeMetadata, TypeVariation,
    UndoTaskData,
};
use crate::MODERATION_TARGET;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Capacity of the "entry added" broadcast channel
const ENTRY_EVENTS_CAPACITY: usize = 256;

/// Criteria for locating the entry an undo flow should close
pub struct EntryQuery<'a> {
    pub user_id: u64,
    pub kind: TypeVariation,
    /// When set, only entries with exactly this metadata match
    pub metadata: Option<TypeMetadata>,
    pub predicate: Option<&'a (dyn Fn(&Entry) -> bool + Send + Sync)>,
}

impl<'a> EntryQuery<'a> {
    #[must_use]
    pub fn new(user_id: u64, kind: TypeVariation) -> Self {
        Self {
            user_id,
            kind,
            metadata: None,
            predicate: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: TypeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: &'a (dyn Fn(&Entry) -> bool + Send + Sync)) -> Self {
        self.predicate = Some(predicate);
        self
    }

    fn matches(&self, entry: &Entry) -> bool {
        !entry.is_closed()
            && entry.kind == self.kind
            && self.metadata.is_none_or(|metadata| entry.metadata == metadata)
            && self.predicate.is_none_or(|predicate| predicate(entry))
    }
}

/// Ledger of moderation entries for a single guild
pub struct ModerationManager {
    guild_id: u64,
    repository: Arc<dyn EntryRepository>,
    locks: LockRegistry,
    scheduler: Arc<dyn ExpiryScheduler>,
    cache: DashMap<u64, Entry>,
    last_id: AtomicU64,
    events: broadcast::Sender<Entry>,
    default_moderator_id: Arc<AtomicU64>,
    similar_entry_window: Duration,
}

impl std::fmt::Debug for ModerationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationManager")
            .field("guild_id", &self.guild_id)
            .field("cached_entries", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl ModerationManager {
    /// Build a draft from caller-supplied fields and guild defaults. Nothing is persisted.
    ///
    /// # Errors
    /// Returns `InvalidDraft` if the kind or the target user is missing.
    pub fn create(&self, data: CreateData) -> ModerationResult<DraftEntry> {
        let kind = data
            .kind
            .ok_or_else(|| ModerationError::InvalidDraft("missing type".to_string()))?;
        let user_id = data
            .user_id
            .ok_or_else(|| ModerationError::InvalidDraft("missing user".to_string()))?;

        Ok(DraftEntry {
            guild_id: self.guild_id,
            kind,
            user_id,
            moderator_id: data
                .moderator_id
                .unwrap_or_else(|| self.default_moderator_id.load(Ordering::Relaxed)),
            reason: data.reason.filter(|reason| !reason.trim().is_empty()),
            duration: data.duration.filter(|duration| *duration > 0),
            extra_data: data.extra_data,
            metadata: data.metadata,
            created_at: Utc::now(),
        })
    }

    /// Persist a draft under the guild lock and announce it.
    ///
    /// Temporary entries with an undo task get an expiry task registered.
    ///
    /// # Errors
    /// Returns an error if the repository fails; nothing is cached or announced then.
    pub async fn insert(&self, draft: DraftEntry) -> ModerationResult<Entry> {
        let guard = self.create_lock().await;
        self.insert_locked(&guard, draft).await
    }

    /// [`ModerationManager::insert`] for a caller that already holds the guild lock
    ///
    /// # Errors
    /// Returns an error if `guard` belongs to another guild or the repository fails.
    pub async fn insert_locked(&self, guard: &GuildLockGuard, draft: DraftEntry) -> ModerationResult<Entry> {
        self.check_guard(guard)?;

        let id = self.next_id().await?;
        let entry = draft.into_entry(id);
        if let Err(e) = self.repository.save(&entry).await {
            error!(
                target: MODERATION_TARGET,
                guild_id = %self.guild_id,
                action_type = %entry.kind,
                error = %e,
                "Failed to persist moderation entry"
            );
            return Err(e);
        }

        self.last_id.store(id, Ordering::Release);
        self.cache.insert(id, entry.clone());

        info!(
            target: MODERATION_TARGET,
            guild_id = %self.guild_id,
            case_id = %id,
            user_id = %entry.user_id,
            action_type = %entry.kind,
            duration_ms = ?entry.duration,
            undo = %entry.is_undo(),
            "Moderation entry created"
        );

        self.schedule_expiry(&entry).await;
        // Nobody listening is fine
        let _ = self.events.send(entry.clone());

        Ok(entry)
    }

    /// Entries matching `filter`, ordered by id (creation order) ascending.
    ///
    /// Does not take the lock; an insert that has not committed yet may be missing.
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub async fn fetch(&self, filter: EntryFilter) -> ModerationResult<BTreeMap<u64, Entry>> {
        let entries = self.repository.find(self.guild_id, filter).await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                self.cache.insert(entry.id, entry.clone());
                (entry.id, entry)
            })
            .collect())
    }

    /// A single entry by id
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub async fn fetch_one(&self, id: u64) -> ModerationResult<Option<Entry>> {
        let entry = self.repository.find_one(self.guild_id, id).await?;
        if let Some(entry) = &entry {
            self.cache.insert(entry.id, entry.clone());
        }
        Ok(entry)
    }

    /// Mark an entry as completed. Completing a completed entry is a no-op.
    ///
    /// # Errors
    /// Returns `EntryNotFound` if the entry does not exist, or a repository error.
    pub async fn complete(&self, entry: &Entry) -> ModerationResult<Entry> {
        let guard = self.create_lock().await;
        self.complete_locked(&guard, entry).await
    }

    /// [`ModerationManager::complete`] for a caller that already holds the guild lock
    ///
    /// # Errors
    /// Returns an error if `guard` belongs to another guild, the entry does not
    /// exist, or the repository fails.
    pub async fn complete_locked(&self, guard: &GuildLockGuard, entry: &Entry) -> ModerationResult<Entry> {
        self.close_locked(guard, entry.id, |entry| &mut entry.completed, "completed")
            .await
    }

    /// Mark an entry as archived. Archiving an archived entry is a no-op.
    ///
    /// # Errors
    /// Returns `EntryNotFound` if the entry does not exist, or a repository error.
    pub async fn archive(&self, id: u64) -> ModerationResult<Entry> {
        let guard = self.create_lock().await;
        self.close_locked(&guard, id, |entry| &mut entry.archived, "archived")
            .await
    }

    async fn close_locked(
        &self,
        guard: &GuildLockGuard,
        id: u64,
        flag: fn(&mut Entry) -> &mut bool,
        label: &str,
    ) -> ModerationResult<Entry> {
        self.check_guard(guard)?;

        let mut current = self
            .repository
            .find_one(self.guild_id, id)
            .await?
            .ok_or(ModerationError::EntryNotFound(id))?;

        if *flag(&mut current) {
            debug!(guild_id = %self.guild_id, case_id = %id, "Moderation entry already {label}");
            return Ok(current);
        }

        *flag(&mut current) = true;
        self.repository.save(&current).await?;
        self.cache.insert(id, current.clone());

        info!(
            target: MODERATION_TARGET,
            guild_id = %self.guild_id,
            case_id = %id,
            user_id = %current.user_id,
            action_type = %current.kind,
            "Moderation entry {label}"
        );

        Ok(current)
    }

    /// Delete every entry of the guild and its pending expiry tasks. Administrative only.
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub async fn reset(&self) -> ModerationResult<usize> {
        let _guard = self.create_lock().await;
        let removed = self.repository.delete_all(self.guild_id).await?;
        self.cache.clear();
        self.last_id.store(0, Ordering::Release);

        // Ids restart at 1, so tasks of deleted entries would point at new ones
        match self.scheduler.remove_guild(self.guild_id).await {
            Ok(tasks) => debug!(target: MODERATION_TARGET, guild_id = %self.guild_id, tasks, "Dropped expiry tasks"),
            Err(e) => error!(
                target: MODERATION_TARGET,
                guild_id = %self.guild_id,
                error = %e,
                "Failed to drop expiry tasks"
            ),
        }

        info!(target: MODERATION_TARGET, guild_id = %self.guild_id, removed, "Moderation entries reset");
        Ok(removed)
    }

    /// The oldest open entry matching `query`.
    ///
    /// Entries are scanned in creation order, so punishments are lifted in the
    /// order they were applied.
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    pub async fn retrieve_last_entry_from_user(
        &self,
        query: &EntryQuery<'_>,
    ) -> ModerationResult<Option<Entry>> {
        let entries = self.fetch(EntryFilter::user(query.user_id)).await?;
        Ok(entries.into_values().find(|entry| query.matches(entry)))
    }

    /// Whether an open entry of this kind for this user was created recently.
    ///
    /// Used to skip gateway events caused by the bot's own actions. Reads the
    /// in-memory cache only.
    #[must_use]
    pub fn check_similar_entry_has_been_created(&self, kind: TypeVariation, user_id: u64) -> bool {
        let minimum = Utc::now() - self.similar_entry_window;
        self.cache.iter().any(|entry| {
            let entry = entry.value();
            entry.kind == kind
                && entry.user_id == user_id
                && !entry.is_closed()
                && entry.created_at >= minimum
        })
    }

    /// Acquire the guild lock
    pub async fn create_lock(&self) -> GuildLockGuard {
        self.locks.create_lock(self.guild_id).await
    }

    fn check_guard(&self, guard: &GuildLockGuard) -> ModerationResult<()> {
        if guard.guild_id() != self.guild_id {
            return Err(ModerationError::Other(format!(
                "Lock of guild {} used for guild {}",
                guard.guild_id(),
                self.guild_id
            )));
        }
        Ok(())
    }

    /// Whether a mutation currently holds the guild lock
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locks.is_locked(self.guild_id)
    }

    /// Wait for any in-flight mutation of the guild to finish
    pub async fn wait_lock(&self) {
        self.locks.wait_lock(self.guild_id).await;
    }

    /// Subscribe to entries as they are inserted
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Entry> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    async fn next_id(&self) -> ModerationResult<u64> {
        let last = match self.last_id.load(Ordering::Acquire) {
            0 => self.repository.latest_id(self.guild_id).await?.unwrap_or(0),
            last => last,
        };
        Ok(last + 1)
    }

    async fn schedule_expiry(&self, entry: &Entry) {
        let (Some(task), Some(expires_at)) = (entry.kind.undo_task_name(), entry.expires_at()) else {
            return;
        };
        if entry.is_undo() {
            return;
        }

        let options = ScheduleOptions {
            catch_up: true,
            data: UndoTaskData::from(entry),
        };
        // The entry is already committed; a failed registration is logged, not rolled back
        if let Err(e) = self.scheduler.add(task, expires_at, options).await {
            error!(
                target: MODERATION_TARGET,
                guild_id = %self.guild_id,
                case_id = %entry.id,
                task = %task,
                error = %e,
                "Failed to schedule moderation expiry"
            );
        }
    }
}

/// Hands out one [`ModerationManager`] per guild, all sharing storage, locks and scheduler
#[derive(Clone)]
pub struct ModerationRegistry {
    managers: Arc<DashMap<u64, Arc<ModerationManager>>>,
    repository: Arc<dyn EntryRepository>,
    locks: LockRegistry,
    scheduler: Arc<dyn ExpiryScheduler>,
    events: broadcast::Sender<Entry>,
    bot_user_id: Arc<AtomicU64>,
    similar_entry_window: Duration,
}

impl std::fmt::Debug for ModerationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationRegistry")
            .field("guilds", &self.managers.len())
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl ModerationRegistry {
    #[must_use]
    pub fn new(
        repository: Arc<dyn EntryRepository>,
        locks: LockRegistry,
        scheduler: Arc<dyn ExpiryScheduler>,
        similar_entry_window: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(ENTRY_EVENTS_CAPACITY);
        Self {
            managers: Arc::new(DashMap::new()),
            repository,
            locks,
            scheduler,
            events,
            bot_user_id: Arc::new(AtomicU64::new(0)),
            similar_entry_window,
        }
    }

    /// The manager for a guild, created on first use
    #[must_use]
    pub fn get(&self, guild_id: u64) -> Arc<ModerationManager> {
        Arc::clone(
            self.managers
                .entry(guild_id)
                .or_insert_with(|| {
                    Arc::new(ModerationManager {
                        guild_id,
                        repository: Arc::clone(&self.repository),
                        locks: self.locks.clone(),
                        scheduler: Arc::clone(&self.scheduler),
                        cache: DashMap::new(),
                        last_id: AtomicU64::new(0),
                        events: self.events.clone(),
                        default_moderator_id: Arc::clone(&self.bot_user_id),
                        similar_entry_window: self.similar_entry_window,
                    })
                })
                .value(),
        )
    }

    /// Record the bot's own id, used as moderator when none is given
    pub fn set_bot_user_id(&self, user_id: u64) {
        self.bot_user_id.store(user_id, Ordering::Relaxed);
    }

    /// Subscribe to entries inserted in any guild
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Entry> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }
}

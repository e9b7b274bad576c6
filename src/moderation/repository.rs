//! Entry persistence
//!
//! The manager talks to storage only through [`EntryRepository`]. Each `save`
//! replaces one entry atomically; `find` returns a consistent snapshot.

use crate::moderation::{Entry, EntryFilter, ModerationResult};
use crate::storage::{read_yaml, write_yaml_atomic};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Storage for moderation entries, keyed by guild
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntryRepository: Send + Sync {
    /// Entries of a guild matching `filter`, ordered by id ascending
    async fn find(&self, guild_id: u64, filter: EntryFilter) -> ModerationResult<Vec<Entry>>;

    /// A single entry by id
    async fn find_one(&self, guild_id: u64, id: u64) -> ModerationResult<Option<Entry>>;

    /// Insert or replace an entry
    async fn save(&self, entry: &Entry) -> ModerationResult<()>;

    /// Highest id used in the guild so far
    async fn latest_id(&self, guild_id: u64) -> ModerationResult<Option<u64>>;

    /// Remove every entry of a guild, returning how many were removed
    async fn delete_all(&self, guild_id: u64) -> ModerationResult<usize>;
}

/// In-memory repository
#[derive(Clone, Default)]
pub struct MemoryEntryRepository {
    guilds: Arc<DashMap<u64, BTreeMap<u64, Entry>>>,
}

impl MemoryEntryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryRepository for MemoryEntryRepository {
    async fn find(&self, guild_id: u64, filter: EntryFilter) -> ModerationResult<Vec<Entry>> {
        Ok(self
            .guilds
            .get(&guild_id)
            .map(|entries| {
                entries
                    .values()
                    .filter(|entry| filter.matches(entry))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_one(&self, guild_id: u64, id: u64) -> ModerationResult<Option<Entry>> {
        Ok(self
            .guilds
            .get(&guild_id)
            .and_then(|entries| entries.get(&id).cloned()))
    }

    async fn save(&self, entry: &Entry) -> ModerationResult<()> {
        self.guilds
            .entry(entry.guild_id)
            .or_default()
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn latest_id(&self, guild_id: u64) -> ModerationResult<Option<u64>> {
        Ok(self
            .guilds
            .get(&guild_id)
            .and_then(|entries| entries.keys().next_back().copied()))
    }

    async fn delete_all(&self, guild_id: u64) -> ModerationResult<usize> {
        Ok(self
            .guilds
            .remove(&guild_id)
            .map_or(0, |(_, entries)| entries.len()))
    }
}

/// Repository keeping one YAML document per guild under `<data_dir>/moderation/`.
///
/// Writes for a guild are expected to be serialized by the guild lock.
#[derive(Debug, Clone)]
pub struct YamlEntryRepository {
    dir: PathBuf,
}

impl YamlEntryRepository {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("moderation"),
        }
    }

    fn path(&self, guild_id: u64) -> PathBuf {
        self.dir.join(format!("{guild_id}.yaml"))
    }

    async fn load(&self, guild_id: u64) -> ModerationResult<BTreeMap<u64, Entry>> {
        let entries: Vec<Entry> = read_yaml(&self.path(guild_id)).await?.unwrap_or_default();
        Ok(entries.into_iter().map(|entry| (entry.id, entry)).collect())
    }
}

#[async_trait]
impl EntryRepository for YamlEntryRepository {
    async fn find(&self, guild_id: u64, filter: EntryFilter) -> ModerationResult<Vec<Entry>> {
        Ok(self
            .load(guild_id)
            .await?
            .into_values()
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    async fn find_one(&self, guild_id: u64, id: u64) -> ModerationResult<Option<Entry>> {
        Ok(self.load(guild_id).await?.remove(&id))
    }

    async fn save(&self, entry: &Entry) -> ModerationResult<()> {
        let mut entries = self.load(entry.guild_id).await?;
        entries.insert(entry.id, entry.clone());
        let entries: Vec<&Entry> = entries.values().collect();
        write_yaml_atomic(&self.path(entry.guild_id), &entries).await?;
        Ok(())
    }

    async fn latest_id(&self, guild_id: u64) -> ModerationResult<Option<u64>> {
        Ok(self.load(guild_id).await?.keys().next_back().copied())
    }

    async fn delete_all(&self, guild_id: u64) -> ModerationResult<usize> {
        let count = self.load(guild_id).await?.len();
        if count > 0 {
            tokio::fs::remove_file(self.path(guild_id))
                .await
                .map_err(|e| crate::moderation::ModerationError::Persistence(e.to_string()))?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{DraftEntry, TypeMetadata, TypeVariation};
    use chrono::Utc;

    fn entry(guild_id: u64, id: u64, user_id: u64, kind: TypeVariation) -> Entry {
        DraftEntry {
            guild_id,
            kind,
            user_id,
            moderator_id: 1,
            reason: Some("test".to_string()),
            duration: None,
            extra_data: None,
            metadata: TypeMetadata::empty(),
            created_at: Utc::now(),
        }
        .into_entry(id)
    }

    async fn exercise(repository: &dyn EntryRepository) {
        assert_eq!(repository.latest_id(10).await.unwrap(), None);

        repository.save(&entry(10, 2, 100, TypeVariation::Mute)).await.unwrap();
        repository.save(&entry(10, 1, 100, TypeVariation::Ban)).await.unwrap();
        repository.save(&entry(10, 3, 200, TypeVariation::Mute)).await.unwrap();
        repository.save(&entry(20, 1, 100, TypeVariation::Mute)).await.unwrap();

        let found = repository.find(10, EntryFilter::user(100)).await.unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        let filter = EntryFilter {
            user_id: None,
            kind: Some(TypeVariation::Mute),
        };
        assert_eq!(repository.find(10, filter).await.unwrap().len(), 2);
        assert_eq!(repository.latest_id(10).await.unwrap(), Some(3));

        let mut updated = repository.find_one(10, 2).await.unwrap().unwrap();
        updated.completed = true;
        repository.save(&updated).await.unwrap();
        assert!(repository.find_one(10, 2).await.unwrap().unwrap().completed);
        assert!(repository.find_one(10, 9).await.unwrap().is_none());

        assert_eq!(repository.delete_all(10).await.unwrap(), 3);
        assert!(repository.find(10, EntryFilter::default()).await.unwrap().is_empty());
        assert_eq!(repository.find(20, EntryFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_repository() {
        exercise(&MemoryEntryRepository::new()).await;
    }

    #[tokio::test]
    async fn test_yaml_repository() {
        let dir = crate::storage::temp_dir("entries");
        exercise(&YamlEntryRepository::new(&dir)).await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

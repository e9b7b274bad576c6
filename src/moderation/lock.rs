//! Per-guild mutual exclusion
//!
//! Moderation entry mutations and settings transactions for the same guild are
//! serialized through one lock per guild. Guilds never block each other.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of guild locks, shared by every manager and settings store
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<DashMap<u64, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("guilds", &self.locks.len())
            .finish()
    }
}

/// Holds a guild's lock until dropped
#[derive(Debug)]
pub struct GuildLockGuard {
    guild_id: u64,
    _guard: OwnedMutexGuard<()>,
}

impl GuildLockGuard {
    #[must_use]
    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }
}

impl Drop for GuildLockGuard {
    fn drop(&mut self) {
        trace!(guild_id = %self.guild_id, "Guild lock released");
    }
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, guild_id: u64) -> Arc<Mutex<()>> {
        // Clone out of the shard so the map is not held across an await
        Arc::clone(self.locks.entry(guild_id).or_default().value())
    }

    /// Acquire the guild's lock, waiting for any holder to release it first.
    /// The lock is released when the returned guard is dropped, on every exit path.
    pub async fn create_lock(&self, guild_id: u64) -> GuildLockGuard {
        let guard = self.lock_for(guild_id).lock_owned().await;
        trace!(guild_id = %guild_id, "Guild lock acquired");
        GuildLockGuard {
            guild_id,
            _guard: guard,
        }
    }

    /// Wait until no mutation is in flight for the guild, without holding the lock
    /// afterwards.
    pub async fn wait_lock(&self, guild_id: u64) {
        let lock = self.lock_for(guild_id);
        drop(lock.lock().await);
    }

    /// Whether a mutation currently holds the guild's lock
    #[must_use]
    pub fn is_locked(&self, guild_id: u64) -> bool {
        self.locks
            .get(&guild_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let locks = LockRegistry::new();

        let guard = locks.create_lock(1).await;
        assert_eq!(guard.guild_id(), 1);
        assert!(locks.is_locked(1));
        assert!(!locks.is_locked(2));

        drop(guard);
        assert!(!locks.is_locked(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_lock_blocks_until_release() {
        let locks = LockRegistry::new();
        let guard = locks.create_lock(1).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.wait_lock(1).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.expect("waiter panicked");

        // Waiting does not keep the lock
        assert!(!locks.is_locked(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guilds_do_not_block_each_other() {
        let locks = LockRegistry::new();
        let _first = locks.create_lock(1).await;

        let second = tokio::time::timeout(Duration::from_millis(10), locks.create_lock(2)).await;
        assert!(second.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(10), locks.create_lock(1)).await;
        assert!(same.is_err());
    }
}

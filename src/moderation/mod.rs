//! Moderation system for Gavel
//!
//! Entries record every punishment. Actions apply and lift punishments, the
//! manager persists entries under a per-guild lock, and the scheduler lifts
//! temporary punishments when they expire.

pub mod action;
mod entry;
mod error;
pub mod kinds;
mod lock;
mod manager;
mod notify;
mod ops;
mod repository;
mod scheduler;

pub use action::{
    ActionConfig, ActionContext, ActionData, ActionHooks, ActionOptions, ActionRegistry, HookScope,
    ModerationAction, format_duration,
};
pub use entry::{CreateData, DraftEntry, Entry, EntryFilter, ExtraData, TypeMetadata, TypeVariation};
pub use error::{ModerationError, ModerationResult};
pub use lock::{GuildLockGuard, LockRegistry};
pub use manager::{EntryQuery, ModerationManager, ModerationRegistry};
pub use notify::{ModerationLogListener, entry_log_notice};
#[cfg(test)]
pub use ops::MockGuildOperations;
pub use ops::{GuildOperations, Notice, RoleTemplate};
#[cfg(test)]
pub use repository::MockEntryRepository;
pub use repository::{EntryRepository, MemoryEntryRepository, YamlEntryRepository};
#[cfg(test)]
pub use scheduler::MockExpiryScheduler;
pub use scheduler::{
    ExpiryHandler, ExpiryScheduler, ScheduleOptions, ScheduledTask, SchedulerRequest, TaskHandler,
    TaskScheduler, UndoTaskData,
};

//! Guild settings
//!
//! Settings are a flat key-value map per guild. Every mutation goes through a
//! [`SettingsTransaction`], which holds the same guild lock as moderation
//! entry writes.

mod error;
pub mod helpers;
pub mod schema;
mod store;
mod transaction;
mod value;

pub use error::{SettingsError, SettingsResult};
pub use schema::{SettingKey, Serializer, find_key};
#[cfg(test)]
pub use store::MockSettingsRepository;
pub use store::{MemorySettingsRepository, SettingsRepository, SettingsStore, YamlSettingsRepository};
pub use transaction::{
    SettingsTransaction, TransactionFuture, read_settings, with_settings_transaction, write_settings,
};
pub use value::{GuildSettings, SettingValue, SettingsPatch};

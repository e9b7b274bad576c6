pub mod commands;
pub mod config;
pub mod data;
pub mod discord;
pub mod handlers;
pub mod logging;
pub mod moderation;
pub mod settings;
pub mod storage;

// Log targets
pub const BOT_NAME: &str = "gavel";
pub const COMMAND_TARGET: &str = "gavel::command";
pub const ERROR_TARGET: &str = "gavel::error";
pub const EVENT_TARGET: &str = "gavel::handlers";
pub const MODERATION_TARGET: &str = "gavel::moderation";
pub const CONSOLE_TARGET: &str = "gavel";

pub use config::BotConfig;
pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

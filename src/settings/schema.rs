//! Settings schema
//!
//! Every configurable key with the serializer that parses, compares and
//! displays its values.

use crate::settings::{SettingValue, SettingsError, SettingsResult};

pub const PREFIX: &str = "prefix";
pub const LANGUAGE: &str = "language";
pub const CHANNELS_LOGS_MODERATION: &str = "channels.logs.moderation";
pub const CHANNELS_IGNORE_ALL: &str = "channels.ignore-all";
pub const MESSAGES_MODERATION_DM: &str = "messages.moderation-dm";
pub const EVENTS_BAN_ADD: &str = "events.ban-add";
pub const EVENTS_BAN_REMOVE: &str = "events.ban-remove";
pub const EVENTS_TIMEOUT: &str = "events.timeout";
pub const ROLES_MUTED: &str = "roles.muted";
pub const ROLES_RESTRICTED_ATTACHMENT: &str = "roles.restricted-attachment";
pub const ROLES_RESTRICTED_EMBED: &str = "roles.restricted-embed";
pub const ROLES_RESTRICTED_EMOJI: &str = "roles.restricted-emoji";
pub const ROLES_RESTRICTED_REACTION: &str = "roles.restricted-reaction";
pub const ROLES_RESTRICTED_TEXT: &str = "roles.restricted-text";
pub const ROLES_RESTRICTED_VOICE: &str = "roles.restricted-voice";
pub const DISABLED_COMMANDS: &str = "disabled-commands";
pub const PERMISSIONS_MODERATORS: &str = "permissions.moderators";

/// How a key's values are parsed and displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Boolean,
    Integer { min: i64, max: i64 },
    String { min_length: usize, max_length: usize },
    Channel,
    Role,
}

/// One configurable key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingKey {
    pub name: &'static str,
    pub serializer: Serializer,
    /// Holds a list of values rather than one
    pub array: bool,
    pub description: &'static str,
}

const fn key(name: &'static str, serializer: Serializer, description: &'static str) -> SettingKey {
    SettingKey {
        name,
        serializer,
        array: false,
        description,
    }
}

const fn array(name: &'static str, serializer: Serializer, description: &'static str) -> SettingKey {
    SettingKey {
        name,
        serializer,
        array: true,
        description,
    }
}

const TEXT: Serializer = Serializer::String {
    min_length: 1,
    max_length: 2000,
};

pub static SCHEMA: &[SettingKey] = &[
    key(
        PREFIX,
        Serializer::String {
            min_length: 1,
            max_length: 10,
        },
        "Command prefix for this server",
    ),
    key(
        LANGUAGE,
        Serializer::String {
            min_length: 2,
            max_length: 10,
        },
        "Language used for responses",
    ),
    key(CHANNELS_LOGS_MODERATION, Serializer::Channel, "Channel receiving moderation logs"),
    array(CHANNELS_IGNORE_ALL, Serializer::Channel, "Channels where the bot ignores commands"),
    key(MESSAGES_MODERATION_DM, TEXT, "Extra text appended to moderation direct messages"),
    key(EVENTS_BAN_ADD, Serializer::Boolean, "Record bans made outside the bot"),
    key(EVENTS_BAN_REMOVE, Serializer::Boolean, "Record unbans made outside the bot"),
    key(EVENTS_TIMEOUT, Serializer::Boolean, "Record timeouts made outside the bot"),
    key(ROLES_MUTED, Serializer::Role, "Role given to muted members"),
    key(ROLES_RESTRICTED_ATTACHMENT, Serializer::Role, "Role denying attachments"),
    key(ROLES_RESTRICTED_EMBED, Serializer::Role, "Role denying link embeds"),
    key(ROLES_RESTRICTED_EMOJI, Serializer::Role, "Role denying external emojis"),
    key(ROLES_RESTRICTED_REACTION, Serializer::Role, "Role denying reactions"),
    key(ROLES_RESTRICTED_TEXT, Serializer::Role, "Role denying messages"),
    key(ROLES_RESTRICTED_VOICE, Serializer::Role, "Role denying voice"),
    array(
        DISABLED_COMMANDS,
        Serializer::String {
            min_length: 1,
            max_length: 32,
        },
        "Commands disabled in this server",
    ),
    array(PERMISSIONS_MODERATORS, Serializer::Role, "Roles allowed to moderate"),
];

/// Look up a key by name
///
/// # Errors
/// Returns `UnknownKey` if no such setting exists.
pub fn find_key(name: &str) -> SettingsResult<&'static SettingKey> {
    SCHEMA
        .iter()
        .find(|key| key.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| SettingsError::UnknownKey(name.to_string()))
}

impl SettingKey {
    /// Value a key holds until it is written
    #[must_use]
    pub fn default_value(&self) -> SettingValue {
        if self.array {
            SettingValue::List(Vec::new())
        } else if self.serializer == Serializer::Boolean {
            SettingValue::Bool(false)
        } else {
            SettingValue::Null
        }
    }

    /// Parse one element from user input
    ///
    /// # Errors
    /// Returns `InvalidValue` when the input does not fit the key.
    pub fn parse(&self, input: &str) -> SettingsResult<SettingValue> {
        let input = input.trim();
        match self.serializer {
            Serializer::Boolean => parse_bool(input)
                .map(SettingValue::Bool)
                .ok_or_else(|| SettingsError::invalid(self.name, "expected a boolean")),
            Serializer::Integer { min, max } => {
                let value: i64 = input
                    .parse()
                    .map_err(|_| SettingsError::invalid(self.name, "expected a whole number"))?;
                if value < min || value > max {
                    return Err(SettingsError::invalid(
                        self.name,
                        format!("must be between {min} and {max}"),
                    ));
                }
                Ok(SettingValue::Integer(value))
            }
            Serializer::String {
                min_length,
                max_length,
            } => {
                let length = input.chars().count();
                if length < min_length {
                    return Err(SettingsError::invalid(
                        self.name,
                        format!("must be at least {min_length} characters"),
                    ));
                }
                if length > max_length {
                    return Err(SettingsError::invalid(
                        self.name,
                        format!("must be at most {max_length} characters"),
                    ));
                }
                Ok(SettingValue::Text(input.to_string()))
            }
            Serializer::Channel => parse_snowflake(input, &["<#"])
                .map(SettingValue::Snowflake)
                .ok_or_else(|| SettingsError::invalid(self.name, "expected a channel")),
            Serializer::Role => parse_snowflake(input, &["<@&"])
                .map(SettingValue::Snowflake)
                .ok_or_else(|| SettingsError::invalid(self.name, "expected a role")),
        }
    }

    /// Whether two elements are the same value for this key
    #[must_use]
    pub fn equals(&self, left: &SettingValue, right: &SettingValue) -> bool {
        match (self.serializer, left, right) {
            (Serializer::String { .. }, SettingValue::Text(left), SettingValue::Text(right)) => {
                left.eq_ignore_ascii_case(right)
            }
            _ => left == right,
        }
    }

    /// Human readable form of a value
    #[must_use]
    pub fn stringify(&self, value: &SettingValue) -> String {
        match value {
            SettingValue::Null => "Not set".to_string(),
            SettingValue::List(values) if values.is_empty() => "None".to_string(),
            SettingValue::List(values) => values
                .iter()
                .map(|value| self.stringify(value))
                .collect::<Vec<_>>()
                .join(", "),
            SettingValue::Bool(true) => "Enabled".to_string(),
            SettingValue::Bool(false) => "Disabled".to_string(),
            SettingValue::Integer(value) => value.to_string(),
            SettingValue::Text(value) => format!("`{value}`"),
            SettingValue::Snowflake(id) => match self.serializer {
                Serializer::Channel => format!("<#{id}>"),
                Serializer::Role => format!("<@&{id}>"),
                _ => id.to_string(),
            },
        }
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "on" | "enable" | "enabled" | "1" | "+" => Some(true),
        "false" | "no" | "n" | "off" | "disable" | "disabled" | "0" | "-" => Some(false),
        _ => None,
    }
}

/// A raw id, or a mention using one of `prefixes`
fn parse_snowflake(input: &str, prefixes: &[&str]) -> Option<u64> {
    let id = prefixes
        .iter()
        .find_map(|prefix| input.strip_prefix(prefix)?.strip_suffix('>'))
        .unwrap_or(input);
    // Discord ids are at least 17 digits
    if id.len() < 17 || id.len() > 20 {
        return None;
    }
    id.parse().ok()
}

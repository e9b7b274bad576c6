//! Setting values and the per-guild settings map

use crate::settings::schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single stored setting value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Snowflake(u64),
    List(Vec<SettingValue>),
}

impl SettingValue {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_snowflake(&self) -> Option<u64> {
        match self {
            Self::Snowflake(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[SettingValue]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Partial update: the keys to change and their new values
pub type SettingsPatch = BTreeMap<String, SettingValue>;

/// Settings of one guild. Keys that were never written read as their default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildSettings {
    values: BTreeMap<String, SettingValue>,
}

impl GuildSettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, falling back to the schema default
    #[must_use]
    pub fn get(&self, key: &str) -> SettingValue {
        self.values.get(key).cloned().unwrap_or_else(|| {
            schema::find_key(key).map_or(SettingValue::Null, |key| key.default_value())
        })
    }

    /// Merge a patch. Values equal to the default are dropped from storage.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        for (key, value) in patch {
            let is_default = schema::find_key(key).is_ok_and(|key| key.default_value() == *value);
            if is_default || value.is_null() {
                self.values.remove(key);
            } else {
                self.values.insert(key.clone(), value.clone());
            }
        }
    }

    #[must_use]
    pub fn bool(&self, key: &str) -> bool {
        self.get(key).as_bool().unwrap_or(false)
    }

    #[must_use]
    pub fn snowflake(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(SettingValue::as_snowflake)
    }

    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(SettingValue::as_str)
    }

    /// The guild's command prefix, if one was configured
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.text(schema::PREFIX)
    }

    /// Explicitly stored keys, for display
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.values.iter()
    }
}

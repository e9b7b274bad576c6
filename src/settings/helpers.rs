//! Validated patch builders used by configuration commands
//!
//! Each helper checks user input against the current settings and returns a
//! patch; nothing is written until the patch is staged on a transaction.

use crate::settings::{GuildSettings, SettingKey, SettingValue, SettingsError, SettingsPatch, SettingsResult};

fn patch(key: &SettingKey, value: SettingValue) -> SettingsPatch {
    SettingsPatch::from([(key.name.to_string(), value)])
}

/// Set a scalar key, or append to an array key.
///
/// Setting the current value, or appending an element already present, is
/// rejected for both kinds of key.
///
/// # Errors
/// Returns `InvalidValue` if the input does not parse and `DuplicateValue` if
/// it is already stored.
pub fn set(settings: &GuildSettings, key: &SettingKey, input: &str) -> SettingsResult<SettingsPatch> {
    let parsed = key.parse(input)?;
    let current = settings.get(key.name);

    if key.array {
        let mut values = current.as_list().map(<[_]>::to_vec).unwrap_or_default();
        if values.iter().any(|value| key.equals(value, &parsed)) {
            return Err(duplicate(key, &parsed));
        }
        values.push(parsed);
        return Ok(patch(key, SettingValue::List(values)));
    }

    if key.equals(&current, &parsed) {
        return Err(duplicate(key, &parsed));
    }
    Ok(patch(key, parsed))
}

/// Remove an element from an array key. Scalar keys are reset to their default.
///
/// # Errors
/// Returns `InvalidValue` if the input does not parse and `MissingValue` if the
/// element is not in the array.
pub fn remove(settings: &GuildSettings, key: &SettingKey, input: &str) -> SettingsResult<SettingsPatch> {
    if !key.array {
        return Ok(reset(key));
    }

    let parsed = key.parse(input)?;
    let mut values = settings
        .get(key.name)
        .as_list()
        .map(<[_]>::to_vec)
        .unwrap_or_default();
    let position = values
        .iter()
        .position(|value| key.equals(value, &parsed))
        .ok_or_else(|| SettingsError::MissingValue {
            key: key.name.to_string(),
            value: key.stringify(&parsed),
        })?;
    values.remove(position);
    Ok(patch(key, SettingValue::List(values)))
}

/// Restore a key to its default
#[must_use]
pub fn reset(key: &SettingKey) -> SettingsPatch {
    patch(key, key.default_value())
}

fn duplicate(key: &SettingKey, value: &SettingValue) -> SettingsError {
    SettingsError::DuplicateValue {
        key: key.name.to_string(),
        value: key.stringify(value),
    }
}

//! YAML file persistence shared by the entry, settings and schedule stores.

use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Read and deserialize a YAML file. A missing file reads as `None`.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Serialize `value` and replace the file at `path` in one step.
///
/// The document is written to a sibling temporary file which is then renamed
/// over the target, so readers see either the old or the new content.
///
/// # Errors
/// Returns an error if the directory cannot be created, the value cannot be
/// serialized or the file cannot be written.
pub async fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let yaml = serde_yaml::to_string(value)?;
    let temporary = path.with_extension(format!("yaml.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&temporary, yaml).await?;
    if let Err(error) = tokio::fs::rename(&temporary, path).await {
        let _ = tokio::fs::remove_file(&temporary).await;
        return Err(error.into());
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_dir(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("gavel-{label}-{}", uuid::Uuid::new_v4()))
}

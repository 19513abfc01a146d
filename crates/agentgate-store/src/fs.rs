//! Shared filesystem helpers for the JSON stores.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Write a record as pretty JSON via a temp file and atomic rename.
///
/// Parent directories are created as needed. A crash between the write and
/// the rename leaves only a `.tmp` file behind, never a torn record.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let json = serde_json::to_string_pretty(value)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json.as_bytes())
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    Ok(())
}

/// Read and parse a JSON record. Maps a missing file to
/// [`StoreError::NotFound`] with the path as the identifier.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };

    serde_json::from_str(&contents).map_err(|e| StoreError::corrupt(path, e))
}

/// Recursively sum the sizes of all files under `path`.
///
/// Entries that disappear mid-walk are skipped rather than failing the
/// whole computation.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }

    total
}

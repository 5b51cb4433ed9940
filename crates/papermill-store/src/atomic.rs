//! JSON records written via temp file + rename

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("record");
    path.with_file_name(format!(".{name}.{}.tmp", ulid::Ulid::new()))
}

/// Write `value` as pretty JSON so readers see either the old or the new
/// record, never a partial one.
///
/// # Errors
/// Serialization or filesystem failure.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(StoreError::io(parent))?;
    }

    let tmp = temp_path(path);
    fs::write(&tmp, &bytes).await.map_err(StoreError::io(&tmp))?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

/// Read a JSON record; `Ok(None)` if the file does not exist.
///
/// # Errors
/// `Corrupt` when the file exists but does not decode, `Io` otherwise.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

/// Delete a record; a missing file is not an error.
///
/// # Errors
/// Filesystem failure other than `NotFound`.
pub async fn remove(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

/// Paths of `*.json` records directly under `dir`, sorted; missing dir is empty.
///
/// # Errors
/// Filesystem failure other than `NotFound`.
pub async fn list_json(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(StoreError::Io {
                path: dir.to_path_buf(),
                source: err,
            })
        }
    };

    let mut paths = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(StoreError::io(dir))? {
        let path = entry.path();
        let is_record = path.extension().is_some_and(|ext| ext == "json")
            && !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
        if is_record {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// File stem as UTF-8
pub(crate) fn stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

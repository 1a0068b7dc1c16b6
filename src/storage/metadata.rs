//! Atomic JSON documents (session metadata, recorder summaries, audit log).

use super::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `value` as pretty JSON to `<path>.tmp`, syncs it, then renames it
/// over `path`. Readers see either the previous file or the complete new one.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(value).map_err(|e| StorageError::json(path, e))?;
    let tmp = temp_path(path);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io(&tmp, e));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StorageError::io(path, e)
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| StorageError::json(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("meta.json");

        let mut value = BTreeMap::new();
        value.insert("session_id".to_string(), "S1".to_string());
        write_json_atomic(&path, &value).unwrap();

        let loaded: BTreeMap<String, String> = read_json(&path).unwrap();
        assert_eq!(loaded, value);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_overwrite_replaces_whole_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");

        write_json_atomic(&path, &vec![1, 2, 3, 4, 5]).unwrap();
        write_json_atomic(&path, &vec![9]).unwrap();

        let loaded: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(loaded, vec![9]);
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_json::<Vec<i32>>(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }
}

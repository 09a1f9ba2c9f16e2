//! Directory-backed key-value store
//!
//! Each key is stored as one file. Keys are hex-encoded into file names so
//! that arbitrary key characters (`:`, `/`) are safe on every filesystem.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::KeyValueStore;
use crate::traits::Result;

pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| format!("Failed to create store directory {:?}: {}", root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded: String = key.bytes().map(|b| format!("{:02x}", b)).collect();
        self.root.join(format!("{}.json", encoded))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("Failed to read {:?}: {}", path, e).into()),
        }
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.path_for(key);
        // Write to a sibling file first so a crash never leaves a torn entry
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(|e| format!("Failed to write {:?}: {}", tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| format!("Failed to replace {:?}: {}", path, e))?;
        debug!("[FileKeyValueStore] Wrote key '{}' to {:?}", key, path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("Failed to remove {:?}: {}", path, e).into()),
        }
    }
}

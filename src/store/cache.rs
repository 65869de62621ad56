//! Persistent key/value cache used to warm the store across sessions

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CacheError;

/// Minimal get/set/delete store for JSON values
pub trait PersistentCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
    fn set(&self, key: &str, value: Value) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Read a typed value; `None` when the key is absent
pub fn load<T: DeserializeOwned>(
    cache: &dyn PersistentCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    cache
        .get(key)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(CacheError::from)
}

pub fn store<T: Serialize>(cache: &dyn PersistentCache, key: &str, value: &T) -> Result<(), CacheError> {
    cache.set(key, serde_json::to_value(value)?)
}

/// Process-local cache, mostly for tests
#[derive(Debug, Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// One JSON file per key under a base directory
#[derive(Debug, Clone)]
pub struct FileCache {
    base_path: PathBuf,
}

impl FileCache {
    /// Create a cache with the default base directory ("./wallet-cache")
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from("./wallet-cache"),
        }
    }

    /// Create a cache rooted at a custom directory (for testing)
    pub fn new_with_base_dir(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    /// Keys may contain ':' or '/', which are not safe in file names.
    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", name))
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentCache for FileCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        fs::create_dir_all(&self.base_path)?;
        let json = serde_json::to_string_pretty(&value)?;
        fs::write(self.path_for(key), json)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

use crate::constants::store::{LOCK_RETRY_MS, LOCK_TIMEOUT_MS, STALE_LOCK_MS};
use crate::error::StoreError;

/// Injected persistence capability shared by the deduplicator, the execution
/// channel and the dispatcher's bookkeeping.
///
/// Keys are restricted to `[A-Za-z0-9._-]` so every backend can map them
/// one-to-one onto its own namespace.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
    /// Atomically insert `value` unless `key` exists. Returns true if inserted.
    fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    /// Atomically replace the value of `key` with `new`, or remove the key
    /// when `new` is `None`, only while it still equals `expected`.
    /// Returns true if the swap happened.
    fn compare_and_swap(&self, key: &str, expected: &str, new: Option<&str>) -> Result<bool, StoreError>;
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey {
            key: key.to_string(),
        })
    }
}

/// Process-local store. Useful for tests and single-instance deployments.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.entries.remove(key).is_some())
    }

    fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(true)
            }
        }
    }

    fn compare_and_swap(&self, key: &str, expected: &str, new: Option<&str>) -> Result<bool, StoreError> {
        validate_key(key)?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) if slot.get() == expected => {
                match new {
                    Some(value) => {
                        slot.insert(value.to_string());
                    }
                    None => {
                        slot.remove();
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Directory-backed store, one file per key. Several processes pointing at
/// the same directory share state. Writes go through a temp file + rename and
/// `insert_if_absent` relies on `create_new`. Overwrites, removals and
/// compare-and-swap serialize on a per-key `.{key}.lock` file.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}.json", key)))
    }

    fn lock(&self, key: &str) -> Result<KeyLock, StoreError> {
        let path = self.root.join(format!(".{}.lock", key));
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(KeyLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("[STORE] Breaking stale lock on {}", key);
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= Duration::from_millis(LOCK_TIMEOUT_MS) {
                        return Err(StoreError::LockTimeout { key: key.to_string() });
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_atomic(&self, key: &str, path: &Path, value: &str) -> Result<(), StoreError> {
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(value.as_bytes())?;
            f.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Held lock file; released on drop.
struct KeyLock {
    path: PathBuf,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= Duration::from_millis(STALE_LOCK_MS))
        .unwrap_or(false)
}

fn remove_file_if_present(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(key)?;
        self.write_atomic(key, &path, value)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                if key.starts_with(prefix) {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(key)?;
        remove_file_if_present(&path)
    }

    fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                f.write_all(value.as_bytes())?;
                f.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // Every other writer that could replace an existing file holds the same
    // lock, and `create_new` cannot succeed while the file exists.
    fn compare_and_swap(&self, key: &str, expected: &str, new: Option<&str>) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(key)?;
        let current = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => self.write_atomic(key, &path, value)?,
            None => {
                remove_file_if_present(&path)?;
            }
        }
        Ok(true)
    }
}

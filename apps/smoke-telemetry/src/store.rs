use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

pub mod keys {
    pub const LEASE: &str = "smoke.lease";
    pub const SNAPSHOT: &str = "smoke.snapshot";
    pub const FLEET_SERIES: &str = "smoke.history.fleet";
    pub const LOCATION_SERIES: &str = "smoke.history.locations";
    pub const LOCATION_STATS: &str = "smoke.stats.locations";
    pub const NOTIFICATIONS: &str = "smoke.notifications";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded writing {key}: {needed} bytes over a {limit} byte quota")]
    QuotaExceeded {
        key: String,
        needed: usize,
        limit: usize,
    },

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("storage io on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("encoding {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// Durable string key/value storage. No transactions and no atomicity across
/// keys; every reader re-validates timestamps inside the values it reads.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Reads and decodes a JSON value. Unreadable or corrupt entries are logged and
/// reported as absent so callers fall back to a fresh state.
pub fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(key, error=%err, "failed to read stored value");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, error=%err, "ignoring corrupt stored value");
            None
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &encoded)
}

/// History keys that may be shortened to make room for other values.
const EVICTABLE_HISTORY: &[&str] = &[keys::LOCATION_SERIES, keys::FLEET_SERIES];

/// Like [`write_json`], but on `QuotaExceeded` halves the persisted series
/// histories (dropping their oldest points) and retries until the value fits
/// or no history is left to shed.
pub fn write_json_evicting<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    loop {
        match write_json(store, key, value) {
            Err(err) if err.is_quota() => {
                if !shrink_history(store)? {
                    return Err(err);
                }
                tracing::debug!(key, "storage quota hit; shrank persisted history");
            }
            other => return other,
        }
    }
}

fn shrink_history(store: &dyn KeyValueStore) -> Result<bool, StoreError> {
    let mut shrunk = false;
    for key in EVICTABLE_HISTORY {
        let Some(raw) = store.get(key)? else {
            continue;
        };
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        let changed = match &mut value {
            serde_json::Value::Array(points) => halve_oldest(points),
            serde_json::Value::Object(series) => series
                .values_mut()
                .filter_map(serde_json::Value::as_array_mut)
                .fold(false, |acc, points| halve_oldest(points) || acc),
            _ => false,
        };
        if changed {
            write_json(store, key, &value)?;
            shrunk = true;
        }
    }
    Ok(shrunk)
}

fn halve_oldest(points: &mut Vec<serde_json::Value>) -> bool {
    if points.len() <= 1 {
        return false;
    }
    let drop = points.len() - points.len() / 2;
    points.drain(..drop);
    true
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// One file per key under a directory. Writes go through a temp file and a
/// rename so readers in other processes never observe a torn value.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    quota_bytes: usize,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, quota_bytes: usize) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir, quota_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn used_bytes_excluding(&self, key: &str) -> Result<usize, StoreError> {
        let skip = self.path_for(key);
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            key: key.to_string(),
            source,
        })?;
        let mut total = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path == skip || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                total = total.saturating_add(meta.len() as usize);
            }
        }
        Ok(total)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let needed = self.used_bytes_excluding(key)?.saturating_add(value.len());
        if needed > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                needed,
                limit: self.quota_bytes,
            });
        }

        let target = self.path_for(key);
        let tmp = self
            .dir
            .join(format!(".{key}.{}.tmp", std::process::id()));
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        fs::write(&tmp, value.as_bytes()).map_err(io_err)?;
        if let Err(source) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(source));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: usize,
}

impl MemoryStore {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_BYTES)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let others: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, v)| v.len())
            .sum();
        let needed = others.saturating_add(value.len());
        if needed > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                needed,
                limit: self.quota_bytes,
            });
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

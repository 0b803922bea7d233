//! # Persisted Client Storage
//!
//! Small string flags that outlive the process: the manual-disconnect marker
//! and relay session bookkeeping. This is deliberately not a database; a flat
//! JSON map on disk covers the whole requirement.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::warn;

/// Set on explicit disconnect, cleared on any connect attempt. Suppresses
/// startup auto-connect.
pub const MANUAL_DISCONNECT_KEY: &str = "wallet.manually_disconnected";
/// Prefix of relay session bookkeeping keys, removed in bulk on disconnect.
pub const RELAY_PREFIX: &str = "relay.";
/// Topic of the last approved relay session.
pub const RELAY_TOPIC_KEY: &str = "relay.session_topic";

/// Key/value flag storage.
pub trait ClientStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    /// Remove every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &str);
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.lock().remove(key);
    }

    fn remove_prefix(&self, prefix: &str) {
        self.map.lock().retain(|k, _| !k.starts_with(prefix));
    }
}

/// File-backed storage: the whole map is rewritten as JSON on every mutation.
/// Write failures are logged, not fatal, so a read-only disk degrades to
/// in-memory behavior.
pub struct JsonFileStorage {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl JsonFileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    fn persist(&self, map: &HashMap<String, String>) {
        match serde_json::to_string_pretty(map) {
            Ok(contents) => {
                if let Err(e) = fs::write(&self.path, contents) {
                    warn!(path = %self.path.display(), error = %e, "failed to persist client storage");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode client storage"),
        }
    }
}

impl ClientStorage for JsonFileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.map.lock();
        map.insert(key.to_string(), value.to_string());
        self.persist(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self.map.lock();
        if map.remove(key).is_some() {
            self.persist(&map);
        }
    }

    fn remove_prefix(&self, prefix: &str) {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|k, _| !k.starts_with(prefix));
        if map.len() != before {
            self.persist(&map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(MANUAL_DISCONNECT_KEY), None);

        storage.set(MANUAL_DISCONNECT_KEY, "true");
        assert_eq!(storage.get(MANUAL_DISCONNECT_KEY), Some("true".to_string()));

        storage.remove(MANUAL_DISCONNECT_KEY);
        assert_eq!(storage.get(MANUAL_DISCONNECT_KEY), None);
    }

    #[test]
    fn test_remove_prefix_sweeps_relay_keys() {
        let storage = MemoryStorage::new();
        storage.set(RELAY_TOPIC_KEY, "topic-1");
        storage.set("relay.pairing_expiry", "12345");
        storage.set(MANUAL_DISCONNECT_KEY, "true");

        storage.remove_prefix(RELAY_PREFIX);

        assert_eq!(storage.get(RELAY_TOPIC_KEY), None);
        assert_eq!(storage.get("relay.pairing_expiry"), None);
        assert_eq!(storage.get(MANUAL_DISCONNECT_KEY), Some("true".to_string()));
    }

    #[test]
    fn test_file_storage_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.json");

        {
            let storage = JsonFileStorage::open(&path);
            storage.set(MANUAL_DISCONNECT_KEY, "true");
            storage.set(RELAY_TOPIC_KEY, "topic-9");
        }

        let reopened = JsonFileStorage::open(&path);
        assert_eq!(reopened.get(MANUAL_DISCONNECT_KEY), Some("true".to_string()));
        assert_eq!(reopened.get(RELAY_TOPIC_KEY), Some("topic-9".to_string()));

        reopened.remove_prefix(RELAY_PREFIX);
        let reopened_again = JsonFileStorage::open(&path);
        assert_eq!(reopened_again.get(RELAY_TOPIC_KEY), None);
    }
}

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use dashmap::DashMap;

use crate::{
    error::{BridgeError, Result},
    layout::Margins,
};

/// The embedded browser view. Calls are fire-and-forget; the integration
/// reports load/script failures back through
/// [`BridgeSession::report_surface_error`](crate::session::BridgeSession::report_surface_error).
pub trait BrowserSurface: Send + Sync {
    fn load_url(&self, url: &str);
    fn evaluate_script(&self, script: &str);
    fn set_visibility(&self, visible: bool);
    fn set_margins(&self, margins: Margins);
    /// `hook` matches URLs that must be intercepted instead of navigated to.
    fn set_url_pattern(&self, allow: &str, deny: &str, hook: &str);
    fn set_text_zoom(&self, percent: u32);
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Key/value pairs persisted as one JSON object, rewritten on every `set`.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice::<BTreeMap<String, String>>(&bytes).map_err(
                |error| BridgeError::Storage(format!("{} is not a string map: {error}", path.display())),
            )?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value.to_string());

        let bytes = serde_json::to_vec_pretty(&updated)
            .map_err(|error| BridgeError::Storage(error.to_string()))?;
        // Blocking write on the caller's thread; preference files stay small.
        std::fs::write(&self.path, bytes).map_err(|error| {
            BridgeError::Storage(format!("failed writing {}: {error}", self.path.display()))
        })?;

        *entries = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert_eq!(store.get("token"), None);
        store.set("token", "abc").expect("set");
        store.set("token", "def").expect("overwrite");
        assert_eq!(store.get("token").as_deref(), Some("def"));
    }

    #[test]
    fn json_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs.json");

        let store = JsonFileStore::open(&path).expect("open missing file");
        store.set("session", "{\"a\":1}").expect("set");
        drop(store);

        let reopened = JsonFileStore::open(&path).expect("reopen");
        assert_eq!(reopened.get("session").as_deref(), Some("{\"a\":1}"));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn failed_write_leaves_the_store_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::open(dir.path().join("missing/prefs.json")).expect("open");

        let error = store.set("session", "abc").expect_err("parent directory is missing");
        assert!(matches!(error, BridgeError::Storage(_)));
        assert_eq!(store.get("session"), None);
    }

    #[test]
    fn json_file_store_rejects_non_string_maps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "[1,2]").expect("write");

        assert!(matches!(JsonFileStore::open(&path), Err(BridgeError::Storage(_))));
    }
}

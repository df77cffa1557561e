use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use fwdash_util::{state_file_path, write_json_atomic};
use parking_lot::Mutex;
use tracing::debug;

pub const PREFERENCES_FILE: &str = "preferences.json";

/// Best-effort key/value storage. Implementations swallow failures: an
/// unavailable store behaves like an empty one.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: Option<&str>);
}

pub struct JsonPreferences {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonPreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn open_default() -> Self {
        Self::new(state_file_path(PREFERENCES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> BTreeMap<String, String> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(_) => return BTreeMap::new(),
        };
        serde_json::from_str(&data).unwrap_or_else(|err| {
            debug!("ignoring unreadable {}: {err}", self.path.display());
            BTreeMap::new()
        })
    }
}

impl PreferenceStore for JsonPreferences {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock();
        self.read_map().remove(key)
    }

    fn set(&self, key: &str, value: Option<&str>) {
        let _guard = self.lock.lock();
        let mut map = self.read_map();
        match value {
            Some(value) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => {
                map.remove(key);
            }
        }
        if let Err(err) = write_json_atomic(&self.path, &map) {
            debug!("failed to persist {}: {err}", self.path.display());
        }
    }
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
    writes: Mutex<usize>,
}

impl MemoryPreferences {
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<&str>) {
        let mut values = self.values.lock();
        match value {
            Some(value) => {
                values.insert(key.to_string(), value.to_string());
            }
            None => {
                values.remove(key);
            }
        }
        *self.writes.lock() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_preferences_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = JsonPreferences::new(dir.path().join("state").join(PREFERENCES_FILE));

        assert_eq!(prefs.get("fwdash:selected-app"), None);
        prefs.set("fwdash:selected-app", Some("led-panel"));
        prefs.set("other", Some("x"));
        assert_eq!(prefs.get("fwdash:selected-app").as_deref(), Some("led-panel"));

        prefs.set("fwdash:selected-app", None);
        assert_eq!(prefs.get("fwdash:selected-app"), None);
        assert_eq!(prefs.get("other").as_deref(), Some("x"));
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        fs::write(&path, "{ not json").unwrap();
        let prefs = JsonPreferences::new(&path);

        assert_eq!(prefs.get("anything"), None);
        prefs.set("k", Some("v"));
        assert_eq!(prefs.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn unwritable_location_is_silently_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let prefs = JsonPreferences::new(blocker.join(PREFERENCES_FILE));

        prefs.set("k", Some("v"));
        assert_eq!(prefs.get("k"), None);
    }
}

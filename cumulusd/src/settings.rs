use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

pub const LOGIN_KEY: &str = "login";
pub const PASSWORD_KEY: &str = "password";
pub const ROOT_NAME_KEY: &str = "root_name";
pub const WATERMARK_KEY: &str = "last_updated";
pub const BOOTSTRAP_KEY: &str = "bootstrap_done";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("settings file is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// String-keyed settings map persisted as a JSON file. Holds user settings
/// together with the remote watermark and the bootstrap flag; every write
/// goes to disk atomically (temp file + rename).
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl SettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).cloned())
    }

    /// Requested fields with non-empty values, for the `get_settings` reply.
    pub fn get_fields(&self, fields: &[String]) -> BTreeMap<String, String> {
        let Ok(values) = self.values.lock() else {
            return BTreeMap::new();
        };
        fields
            .iter()
            .filter_map(|field| {
                values
                    .get(field)
                    .filter(|value| !value.is_empty())
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut args = BTreeMap::new();
        args.insert(key.to_string(), value.to_string());
        self.set_many(&args)
    }

    pub fn set_many(&self, args: &BTreeMap<String, String>) -> Result<(), SettingsError> {
        let snapshot = {
            let Ok(mut values) = self.values.lock() else {
                return Ok(());
            };
            for (key, value) in args {
                values.insert(key.clone(), value.clone());
            }
            values.clone()
        };
        self.persist(&snapshot)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        let login = self.get(LOGIN_KEY).filter(|value| !value.is_empty())?;
        let password = self.get(PASSWORD_KEY).filter(|value| !value.is_empty())?;
        Some((login, password))
    }

    pub fn watermark(&self) -> u64 {
        self.get(WATERMARK_KEY)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn set_watermark(&self, timestamp: u64) -> Result<(), SettingsError> {
        self.set(WATERMARK_KEY, &timestamp.to_string())
    }

    pub fn bootstrap_done(&self) -> bool {
        self.get(BOOTSTRAP_KEY)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    pub fn set_bootstrap_done(&self, done: bool) -> Result<(), SettingsError> {
        self.set(BOOTSTRAP_KEY, if done { "true" } else { "false" })
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&staged, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.get(LOGIN_KEY), None);
        assert_eq!(store.watermark(), 0);
        assert!(!store.bootstrap_done());
    }

    #[test]
    fn values_survive_a_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::load(&path).unwrap();
        let mut args = BTreeMap::new();
        args.insert(LOGIN_KEY.to_string(), "user".to_string());
        args.insert(ROOT_NAME_KEY.to_string(), "Cumulus".to_string());
        store.set_many(&args).unwrap();
        store.set_watermark(1_700_000_000).unwrap();
        store.set_bootstrap_done(true).unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.get(LOGIN_KEY).as_deref(), Some("user"));
        assert_eq!(reloaded.watermark(), 1_700_000_000);
        assert!(reloaded.bootstrap_done());
    }

    #[test]
    fn get_fields_skips_empty_and_unknown_values() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();
        store.set(LOGIN_KEY, "user").unwrap();
        store.set(PASSWORD_KEY, "").unwrap();

        let values = store.get_fields(&[
            LOGIN_KEY.to_string(),
            PASSWORD_KEY.to_string(),
            "unknown".to_string(),
        ]);
        assert_eq!(values.len(), 1);
        assert_eq!(values.get(LOGIN_KEY).map(String::as_str), Some("user"));
    }

    #[test]
    fn credentials_require_both_halves() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.credentials(), None);
        store.set(LOGIN_KEY, "user").unwrap();
        assert_eq!(store.credentials(), None);
        store.set(PASSWORD_KEY, "secret").unwrap();
        assert_eq!(
            store.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
    }
}

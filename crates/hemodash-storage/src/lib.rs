//! Durable JSON-file stores for notification preferences and email
//! templates, with backup-before-overwrite and corruption quarantine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use hemodash_core::{EmailTemplate, UserPreference};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hemodash-storage";

pub const DEFAULT_TEMPLATE_ID: &str = "default";

const PREFERENCES_FILE: &str = "notification_settings.json";
const TEMPLATES_FILE: &str = "email_templates.json";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("HEMODASH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self { data_dir }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encoding store content: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("template {0} is protected and cannot be deleted")]
    Protected(String),
    #[error("template {0} not found")]
    NotFound(String),
}

/// One JSON file holding a string-keyed map of records. Reads are fail-soft
/// (missing file → lazy init, corrupted file → quarantine + reset); writes
/// take a backup of the previous content and land via an atomic
/// temp-file-then-rename.
#[derive(Debug)]
struct JsonMapFile {
    path: PathBuf,
    backup_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonMapFile {
    fn new(path: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            path,
            backup_dir,
            write_lock: Mutex::new(()),
        }
    }

    async fn load<T: DeserializeOwned>(&self) -> HashMap<String, T> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "store content corrupted, quarantining");
                    self.quarantine(&text).await;
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Err(err) = self.write_atomic(b"{}").await {
                    warn!(path = %self.path.display(), %err, "initializing empty store failed");
                }
                HashMap::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "reading store failed, treating as empty");
                HashMap::new()
            }
        }
    }

    /// Read-modify-write under the store's write lock. The closure mutates
    /// the loaded map; on success the previous file content is backed up and
    /// the new map replaces it atomically.
    async fn update<T, F>(&self, apply: F) -> Result<HashMap<String, T>, StoreError>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(&mut HashMap<String, T>) -> Result<(), StoreError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await;
        apply(&mut map)?;
        self.backup().await;
        let bytes = serde_json::to_vec_pretty(&map)?;
        self.write_atomic(&bytes).await?;
        Ok(map)
    }

    async fn quarantine(&self, content: &str) {
        let quarantine_path = self
            .path
            .with_file_name(format!(
                "{}.corrupted.{}",
                self.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "store".to_string()),
                Utc::now().timestamp_millis()
            ));
        if let Err(err) = fs::write(&quarantine_path, content).await {
            warn!(path = %quarantine_path.display(), %err, "writing quarantine copy failed");
        } else {
            info!(path = %quarantine_path.display(), "corrupted store quarantined");
        }
        if let Err(err) = self.write_atomic(b"{}").await {
            warn!(path = %self.path.display(), %err, "re-initializing store after corruption failed");
        }
    }

    async fn backup(&self) {
        if !self.path.exists() {
            return;
        }
        if let Err(err) = fs::create_dir_all(&self.backup_dir).await {
            warn!(path = %self.backup_dir.display(), %err, "creating backup directory failed");
            return;
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let backup_path = self.backup_dir.join(format!("{stem}_{stamp}.json"));
        if let Err(err) = fs::copy(&self.path, &backup_path).await {
            warn!(path = %backup_path.display(), %err, "writing backup copy failed");
        }
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, bytes).await?;
        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }
}

/// Durable map from username to [`UserPreference`].
#[derive(Debug)]
pub struct PreferenceStore {
    file: JsonMapFile,
}

impl PreferenceStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            file: JsonMapFile::new(
                config.data_dir.join(PREFERENCES_FILE),
                config.backup_dir(),
            ),
        }
    }

    /// Never fails: missing or corrupted backing storage yields an empty map.
    pub async fn get_all(&self) -> HashMap<String, UserPreference> {
        self.file.load().await
    }

    pub async fn get_one(&self, username: &str) -> Option<UserPreference> {
        self.get_all().await.remove(username)
    }

    /// Full replace of the user's entry; all other entries are preserved.
    pub async fn upsert(&self, preference: UserPreference) -> Result<UserPreference, StoreError> {
        let username = preference.username.clone();
        let stored = preference.clone();
        self.file
            .update(|map: &mut HashMap<String, UserPreference>| {
                map.insert(username.clone(), preference);
                Ok(())
            })
            .await?;
        Ok(stored)
    }
}

/// Durable map from template id to [`EmailTemplate`], seeded with the stock
/// templates on first use. The default template is protected: it cannot be
/// deleted, and overwriting it produces a fresh non-default copy.
#[derive(Debug)]
pub struct TemplateStore {
    file: JsonMapFile,
}

impl TemplateStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            file: JsonMapFile::new(config.data_dir.join(TEMPLATES_FILE), config.backup_dir()),
        }
    }

    pub async fn list(&self) -> Result<HashMap<String, EmailTemplate>, StoreError> {
        self.file
            .update(|map| {
                if map.is_empty() {
                    *map = stock_templates();
                }
                Ok(())
            })
            .await
    }

    /// Resolves a template id, falling back to the stored default and then
    /// to the built-in fallback. Never fails.
    pub async fn get(&self, id: &str) -> EmailTemplate {
        let mut map: HashMap<String, EmailTemplate> = self.file.load().await;
        if map.is_empty() {
            map = stock_templates();
        }
        map.remove(id)
            .or_else(|| map.remove(DEFAULT_TEMPLATE_ID))
            .unwrap_or_else(EmailTemplate::fallback)
    }

    /// Upserts a template. Writing to the default id never mutates it in
    /// place: a new `custom_<millis>` entry is created instead and its id
    /// returned.
    pub async fn upsert(
        &self,
        id: &str,
        mut template: EmailTemplate,
    ) -> Result<(String, EmailTemplate), StoreError> {
        let now = Utc::now();
        let requested = id.to_string();
        let mut stored_id = requested.clone();
        let mut stored_template: Option<EmailTemplate> = None;
        self.file
            .update(|map: &mut HashMap<String, EmailTemplate>| {
                if map.is_empty() {
                    *map = stock_templates();
                }
                let replacing_default = requested == DEFAULT_TEMPLATE_ID
                    && map
                        .get(DEFAULT_TEMPLATE_ID)
                        .map(|t| t.is_default)
                        .unwrap_or(false);
                if replacing_default {
                    stored_id = format!("custom_{}", now.timestamp_millis());
                    template.name = format!("{} (custom)", template.name);
                    template.based_on = Some(DEFAULT_TEMPLATE_ID.to_string());
                    template.created = now;
                } else {
                    template.created = map
                        .get(&requested)
                        .map(|existing| existing.created)
                        .unwrap_or(now);
                }
                template.is_default = false;
                template.last_updated = now;
                stored_template = Some(template.clone());
                map.insert(stored_id.clone(), template.clone());
                Ok(())
            })
            .await?;
        let template = stored_template.unwrap_or_else(EmailTemplate::fallback);
        Ok((stored_id, template))
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let requested = id.to_string();
        self.file
            .update(|map: &mut HashMap<String, EmailTemplate>| {
                if map.is_empty() {
                    *map = stock_templates();
                }
                if requested == DEFAULT_TEMPLATE_ID {
                    return Err(StoreError::Protected(requested.clone()));
                }
                if map.remove(&requested).is_none() {
                    return Err(StoreError::NotFound(requested.clone()));
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn stock_templates() -> HashMap<String, EmailTemplate> {
    let now = Utc::now();
    let mut map = HashMap::new();
    map.insert(
        DEFAULT_TEMPLATE_ID.to_string(),
        EmailTemplate {
            name: "Default".to_string(),
            description: "Stock template with the dashboard color scheme".to_string(),
            created: now,
            last_updated: now,
            is_default: true,
            ..EmailTemplate::fallback()
        },
    );
    map.insert(
        "minimal".to_string(),
        EmailTemplate {
            name: "Minimal".to_string(),
            description: "Reduced grayscale styling".to_string(),
            color: "#4a4a4a".to_string(),
            accent: "#2c2c2c".to_string(),
            created: now,
            last_updated: now,
            is_default: false,
            ..EmailTemplate::fallback()
        },
    );
    map.insert(
        "dark".to_string(),
        EmailTemplate {
            name: "Dark".to_string(),
            description: "Dark background color scheme".to_string(),
            color: "#1a1a1a".to_string(),
            accent: "#3a3a3a".to_string(),
            background_color: Some("#121212".to_string()),
            text_color: Some("#f5f5f5".to_string()),
            created: now,
            last_updated: now,
            is_default: false,
            ..EmailTemplate::fallback()
        },
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn pref(username: &str, frequency: &str) -> UserPreference {
        UserPreference {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            frequency: frequency.to_string(),
            overview_indicators: BTreeMap::new(),
            apheresis_indicators: BTreeMap::new(),
            whole_blood_indicators: BTreeMap::new(),
            template_id: "default".to_string(),
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
            imported_at: None,
            imported_from: None,
        }
    }

    #[tokio::test]
    async fn get_all_on_missing_store_returns_empty_and_initializes() {
        let dir = tempdir().expect("tempdir");
        let store = PreferenceStore::new(&StoreConfig::new(dir.path()));

        let all = store.get_all().await;
        assert!(all.is_empty());
        assert!(dir.path().join(PREFERENCES_FILE).exists());
    }

    #[tokio::test]
    async fn upsert_round_trips_and_preserves_other_users() {
        let dir = tempdir().expect("tempdir");
        let store = PreferenceStore::new(&StoreConfig::new(dir.path()));

        store.upsert(pref("alice", "monthly")).await.expect("upsert alice");
        store.upsert(pref("bob", "daily")).await.expect("upsert bob");

        let mut updated = pref("alice", "weekly");
        updated.email = "alice@lab.example".to_string();
        store.upsert(updated.clone()).await.expect("upsert alice again");

        assert_eq!(store.get_one("alice").await, Some(updated));
        assert_eq!(store.get_one("bob").await, Some(pref("bob", "daily")));
        assert_eq!(store.get_one("carol").await, None);
    }

    #[tokio::test]
    async fn corrupted_store_is_quarantined_and_reset() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(PREFERENCES_FILE);
        std::fs::write(&path, "{not valid json").expect("write corrupt file");

        let store = PreferenceStore::new(&StoreConfig::new(dir.path()));
        let all = store.get_all().await;
        assert!(all.is_empty());

        let quarantined = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupted."));
        assert!(quarantined, "quarantine copy missing");

        let reset = std::fs::read_to_string(&path).expect("read reset file");
        assert_eq!(reset, "{}");
    }

    #[tokio::test]
    async fn upsert_takes_backup_of_previous_content() {
        let dir = tempdir().expect("tempdir");
        let config = StoreConfig::new(dir.path());
        let store = PreferenceStore::new(&config);

        store.upsert(pref("alice", "daily")).await.expect("first upsert");
        store.upsert(pref("bob", "daily")).await.expect("second upsert");

        let backups = std::fs::read_dir(config.backup_dir())
            .expect("read backup dir")
            .filter_map(|e| e.ok())
            .count();
        assert!(backups >= 1, "no backup written");
    }

    #[tokio::test]
    async fn template_store_seeds_stock_templates() {
        let dir = tempdir().expect("tempdir");
        let store = TemplateStore::new(&StoreConfig::new(dir.path()));

        let templates = store.list().await.expect("list");
        assert!(templates.contains_key(DEFAULT_TEMPLATE_ID));
        assert!(templates.contains_key("minimal"));
        assert!(templates.contains_key("dark"));
        assert!(templates[DEFAULT_TEMPLATE_ID].is_default);
    }

    #[tokio::test]
    async fn default_template_cannot_be_deleted() {
        let dir = tempdir().expect("tempdir");
        let store = TemplateStore::new(&StoreConfig::new(dir.path()));

        let err = store.delete(DEFAULT_TEMPLATE_ID).await.expect_err("must reject");
        assert!(matches!(err, StoreError::Protected(_)));

        let templates = store.list().await.expect("list");
        assert!(templates.contains_key(DEFAULT_TEMPLATE_ID));
    }

    #[tokio::test]
    async fn overwriting_default_creates_copy() {
        let dir = tempdir().expect("tempdir");
        let store = TemplateStore::new(&StoreConfig::new(dir.path()));
        store.list().await.expect("seed");

        let mut custom = EmailTemplate::fallback();
        custom.name = "Branded".to_string();
        custom.color = "#aa0000".to_string();

        let (stored_id, stored) = store.upsert(DEFAULT_TEMPLATE_ID, custom).await.expect("upsert");
        assert_ne!(stored_id, DEFAULT_TEMPLATE_ID);
        assert!(!stored.is_default);
        assert_eq!(stored.based_on.as_deref(), Some(DEFAULT_TEMPLATE_ID));

        let templates = store.list().await.expect("list");
        let default = &templates[DEFAULT_TEMPLATE_ID];
        assert!(default.is_default);
        assert_ne!(default.color, "#aa0000");
    }

    #[tokio::test]
    async fn delete_unknown_template_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = TemplateStore::new(&StoreConfig::new(dir.path()));

        let err = store.delete("nope").await.expect_err("must reject");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_falls_back_to_default_for_unknown_id() {
        let dir = tempdir().expect("tempdir");
        let store = TemplateStore::new(&StoreConfig::new(dir.path()));
        store.list().await.expect("seed");

        let template = store.get("missing").await;
        assert!(template.is_default);
    }
}

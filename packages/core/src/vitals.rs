//! Persisted per-container preferences ("vitals").
//!
//! Two documents back the store:
//!
//! - `vitals.json`: container id to delay, repeat, preferred mount point and
//!   backing file. Never contains passwords.
//! - `secrets.json`: container id to password, written with mode 0600.
//!
//! Both are whole-map JSON documents with a trailing newline, replaced via a
//! temporary file and rename.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{IoResultExt, Result, StoreEncodeSnafu};

pub const DEFAULT_DELAY_MINUTES: u32 = 60;
pub const DEFAULT_REPEAT_MINUTES: u32 = 5;

const SECRETS_MODE: u32 = 0o600;

/// A password held in memory, wiped on drop.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(<redacted>)")
        }
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Remembered user intent for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vital {
    pub uuid: String,
    #[serde(skip)]
    pub password: Secret,
    #[serde(default = "default_delay")]
    pub delay_minutes: u32,
    #[serde(default = "default_repeat")]
    pub repeat_minutes: u32,
    #[serde(default)]
    pub preferred_mount_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<PathBuf>,
}

fn default_delay() -> u32 {
    DEFAULT_DELAY_MINUTES
}

fn default_repeat() -> u32 {
    DEFAULT_REPEAT_MINUTES
}

impl Vital {
    /// Default vital: no password, 60 minute delay, 5 minute repeat.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            password: Secret::default(),
            delay_minutes: DEFAULT_DELAY_MINUTES,
            repeat_minutes: DEFAULT_REPEAT_MINUTES,
            preferred_mount_point: String::new(),
            backing_file: None,
        }
    }
}

/// Id to [`Vital`] map with an explicit load/save lifecycle.
#[derive(Debug)]
pub struct VitalsStore {
    path: PathBuf,
    secrets_path: PathBuf,
    vitals: BTreeMap<String, Vital>,
    dirty: bool,
}

impl VitalsStore {
    /// Creates an empty store that will persist to the given documents.
    pub fn new(path: impl Into<PathBuf>, secrets_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            secrets_path: secrets_path.into(),
            vitals: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Creates a store and restores it from disk.
    pub fn load(path: impl Into<PathBuf>, secrets_path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path, secrets_path);
        store.restore();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Stored vital for `uuid`, or a default one. Never mutates the store.
    pub fn get_vital(&self, uuid: &str) -> Vital {
        self.vitals
            .get(uuid)
            .cloned()
            .unwrap_or_else(|| Vital::new(uuid))
    }

    /// Returns true if a vital is stored for `uuid`.
    pub fn contains(&self, uuid: &str) -> bool {
        self.vitals.contains_key(uuid)
    }

    /// All stored vitals in id order.
    pub fn vitals(&self) -> impl Iterator<Item = &Vital> {
        self.vitals.values()
    }

    /// Upserts `vital` and saves immediately.
    pub fn put_vital(&mut self, vital: Vital) -> Result<()> {
        self.vitals.insert(vital.uuid.clone(), vital);
        self.dirty = true;
        self.save()
    }

    /// Records a sighting of a container in the live topology.
    ///
    /// Unknown ids get a default vital seeded with `mount_point`. For known
    /// ids a different non-empty `mount_point` replaces the stored one.
    pub fn ensure_container(&mut self, uuid: &str, mount_point: &str) {
        match self.vitals.get_mut(uuid) {
            None => {
                let mut vital = Vital::new(uuid);
                vital.preferred_mount_point = mount_point.to_string();
                self.vitals.insert(uuid.to_string(), vital);
                self.dirty = true;
            }
            Some(vital) => {
                if !mount_point.is_empty() && vital.preferred_mount_point != mount_point {
                    vital.preferred_mount_point = mount_point.to_string();
                    self.dirty = true;
                }
            }
        }
    }

    /// Remembers the backing file of a file container.
    pub fn note_backing_file(&mut self, uuid: &str, backing_file: &Path) {
        let vital = self
            .vitals
            .entry(uuid.to_string())
            .or_insert_with(|| Vital::new(uuid));
        if vital.backing_file.as_deref() != Some(backing_file) {
            vital.backing_file = Some(backing_file.to_path_buf());
            self.dirty = true;
        }
    }

    /// Writes both documents if anything changed.
    ///
    /// On failure the store stays dirty so the next call tries again.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut document = serde_json::to_string_pretty(&self.vitals).context(
            StoreEncodeSnafu {
                path: self.path.clone(),
            },
        )?;
        document.push('\n');

        let passwords: BTreeMap<&str, &str> = self
            .vitals
            .iter()
            .filter(|(_, v)| !v.password.is_empty())
            .map(|(id, v)| (id.as_str(), v.password.expose()))
            .collect();
        let mut secrets = Zeroizing::new(serde_json::to_string_pretty(&passwords).context(
            StoreEncodeSnafu {
                path: self.secrets_path.clone(),
            },
        )?);
        secrets.push('\n');

        write_atomic(&self.path, &document, None)?;
        write_atomic(&self.secrets_path, &secrets, Some(SECRETS_MODE))?;

        self.dirty = false;
        info!(path = %self.path.display(), count = self.vitals.len(), "vitals saved");
        Ok(())
    }

    /// Replaces the in-memory map with what is on disk.
    ///
    /// A missing or unreadable document counts as empty.
    pub fn restore(&mut self) {
        let mut vitals: BTreeMap<String, Vital> = read_document(&self.path).unwrap_or_default();
        for (uuid, vital) in vitals.iter_mut() {
            vital.uuid.clone_from(uuid);
        }

        let secrets: BTreeMap<String, String> =
            read_document(&self.secrets_path).unwrap_or_default();
        for (uuid, password) in secrets {
            match vitals.get_mut(&uuid) {
                Some(vital) => vital.password = Secret::new(password),
                None => {
                    let mut password = password;
                    password.zeroize();
                }
            }
        }

        debug!(path = %self.path.display(), count = vitals.len(), "vitals restored");
        self.vitals = vitals;
        self.dirty = false;
    }
}

fn read_document<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => Zeroizing::new(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read store, starting empty");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt store, starting empty");
            None
        }
    }
}

fn write_atomic(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).store_write_context(path)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if let Some(mode) = mode {
        options.mode(mode);
    }
    let mut file = options.open(&tmp_path).store_write_context(&tmp_path)?;
    if let Some(mode) = mode {
        // create() leaves the mode of a stale temp file untouched
        file.set_permissions(fs::Permissions::from_mode(mode))
            .store_write_context(&tmp_path)?;
    }
    file.write_all(content.as_bytes())
        .store_write_context(&tmp_path)?;
    file.sync_all().store_write_context(&tmp_path)?;
    drop(file);

    fs::rename(&tmp_path, path).store_write_context(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> VitalsStore {
        VitalsStore::new(dir.join("vitals.json"), dir.join("secrets.json"))
    }

    #[test]
    fn test_get_vital_defaults_without_mutation() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let vital = store.get_vital("u1");
        assert_eq!(vital.delay_minutes, 60);
        assert_eq!(vital.repeat_minutes, 5);
        assert!(vital.password.is_empty());
        assert!(vital.preferred_mount_point.is_empty());
        assert!(!store.contains("u1"));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_put_vital_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());

        let mut vital = Vital::new("u1");
        vital.password = Secret::new("hunter2");
        vital.preferred_mount_point = "/mnt/vault".to_string();
        vital.delay_minutes = 30;
        vital.backing_file = Some(PathBuf::from("/data/vault.img"));
        store.put_vital(vital.clone()).unwrap();
        store.ensure_container("u2", "");
        store.save().unwrap();
        assert!(!store.is_dirty());

        let restored = VitalsStore::load(dir.path().join("vitals.json"), dir.path().join("secrets.json"));
        assert_eq!(restored.get_vital("u1"), vital);
        assert_eq!(restored.get_vital("u2"), Vital::new("u2"));
        assert_eq!(restored.vitals().count(), 2);
    }

    #[test]
    fn test_passwords_stay_out_of_vitals_document() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        let mut vital = Vital::new("u1");
        vital.password = Secret::new("hunter2");
        store.put_vital(vital).unwrap();

        let document = fs::read_to_string(dir.path().join("vitals.json")).unwrap();
        assert!(!document.contains("hunter2"));
        assert!(document.contains("\"delayMinutes\": 60"));
        assert!(document.ends_with('\n'));

        let secrets_path = dir.path().join("secrets.json");
        assert!(fs::read_to_string(&secrets_path).unwrap().contains("hunter2"));
        let mode = fs::metadata(&secrets_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_ensure_container_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());

        store.ensure_container("u1", "/mnt/a");
        assert!(store.is_dirty());
        store.save().unwrap();

        store.ensure_container("u1", "/mnt/a");
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_ensure_container_updates_mount_point() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.ensure_container("u1", "/mnt/a");
        store.save().unwrap();

        store.ensure_container("u1", "");
        assert!(!store.is_dirty());
        assert_eq!(store.get_vital("u1").preferred_mount_point, "/mnt/a");

        store.ensure_container("u1", "/mnt/b");
        assert!(store.is_dirty());
        assert_eq!(store.get_vital("u1").preferred_mount_point, "/mnt/b");
    }

    #[test]
    fn test_note_backing_file_marks_dirty_on_change() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.ensure_container("u1", "");
        store.save().unwrap();

        store.note_backing_file("u1", Path::new("/data/vault.img"));
        assert!(store.is_dirty());
        store.save().unwrap();

        store.note_backing_file("u1", Path::new("/data/vault.img"));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_save_failure_keeps_dirty() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let mut store = VitalsStore::new(blocker.join("vitals.json"), blocker.join("secrets.json"));

        store.ensure_container("u1", "/mnt/a");
        let err = store.save().unwrap_err();
        assert!(matches!(err, Error::StoreWrite { .. }));
        assert!(store.is_dirty());
    }

    #[test]
    fn test_save_without_changes_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.save().unwrap();
        assert!(!dir.path().join("vitals.json").exists());
    }

    #[test]
    fn test_restore_corrupt_document_starts_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("vitals.json"), "{ not json").unwrap();
        let store = VitalsStore::load(dir.path().join("vitals.json"), dir.path().join("secrets.json"));
        assert_eq!(store.vitals().count(), 0);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_restore_unreadable_document_starts_empty() {
        let dir = tempdir().unwrap();
        let vitals_path = dir.path().join("vitals.json");
        fs::create_dir(&vitals_path).unwrap();
        let store = VitalsStore::load(&vitals_path, dir.path().join("secrets.json"));
        assert_eq!(store.path(), vitals_path.as_path());
        assert_eq!(store.vitals().count(), 0);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(<redacted>)");
        assert_eq!(secret.expose(), "hunter2");
    }
}

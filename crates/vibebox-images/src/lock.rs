use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

/// Wall-clock stamp written into lock entries: UTC, second resolution,
/// trailing `Z` (e.g. `2026-08-01T09:30:00Z`).
pub(crate) fn utc_stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One prepared image, as recorded in the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLockRef {
    pub id: String,
    pub version: String,
    pub sha256: String,
    pub artifact_path: PathBuf,
    pub raw_path: PathBuf,
    pub downloaded_at: String,
}

/// The persistent image lock: `(id, version)` to cached paths.
/// Entries are upserted idempotently and never deleted by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageLock {
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub images: BTreeMap<String, ImageLockRef>,
}

impl ImageLock {
    /// Load from `path`. A missing file is an empty lock.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn key(id: &str, version: &str) -> String {
        format!("{}@{}", id, version)
    }

    pub fn get(&self, id: &str, version: &str) -> Option<&ImageLockRef> {
        self.images.get(&Self::key(id, version))
    }

    /// Insert or overwrite the entry for `(id, version)` and refresh
    /// `updated_at`.
    pub fn upsert(&mut self, entry: ImageLockRef) {
        let key = Self::key(&entry.id, &entry.version);
        self.images.insert(key, entry);
        self.updated_at = utc_stamp();
    }

    /// Persist atomically: write to a temp file in the same directory,
    /// then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().context("lock path has no parent")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let yaml = serde_yaml::to_string(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.persist(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref(dir: &Path) -> ImageLockRef {
        ImageLockRef {
            id: "ubuntu-24.04".to_string(),
            version: "24.04.2".to_string(),
            sha256: "ab".repeat(32),
            artifact_path: dir.join("a.tar.gz"),
            raw_path: dir.join("base.raw"),
            downloaded_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ImageLock::load(&dir.path().join("images.lock.yaml")).unwrap();
        assert!(lock.images.is_empty());
    }

    #[test]
    fn test_upsert_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images.lock.yaml");

        let mut lock = ImageLock::default();
        lock.upsert(sample_ref(dir.path()));
        lock.save(&path).unwrap();

        let loaded = ImageLock::load(&path).unwrap();
        assert_eq!(loaded.images.len(), 1);
        let entry = loaded.get("ubuntu-24.04", "24.04.2").unwrap();
        assert_eq!(entry, &sample_ref(dir.path()));
        assert!(!loaded.updated_at.is_empty());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = ImageLock::default();
        lock.upsert(sample_ref(dir.path()));
        lock.upsert(sample_ref(dir.path()));
        assert_eq!(lock.images.len(), 1);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(ImageLock::key("alpine-3.20", "3.20.3"), "alpine-3.20@3.20.3");
    }

    #[test]
    fn test_utc_stamp_shape() {
        let stamp = utc_stamp();
        assert!(stamp.ends_with('Z'));
        // Second resolution: no fractional part.
        assert!(!stamp.contains('.'));
        assert_eq!(&stamp[10..11], "T");
    }
}

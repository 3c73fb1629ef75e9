use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use vibebox_core::cancel::CancelToken;
use vibebox_core::catalog::ImageDescriptor;
use vibebox_core::paths::{self, BASE_RAW_FILE};
use vibebox_core::progress::{ProgressEvent, ProgressFn};

use crate::download;
use crate::extract;
use crate::lock::{ImageLock, ImageLockRef, utc_stamp};

/// Absolute locations of a prepared image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPaths {
    pub artifact_path: PathBuf,
    pub raw_path: PathBuf,
}

/// The on-disk image store: a cache tree plus the persistent lock.
pub struct ImageStore {
    cache_root: PathBuf,
    lock_path: PathBuf,
}

impl ImageStore {
    /// Store rooted at the user cache/config dirs.
    pub fn new() -> Result<Self> {
        Ok(Self {
            cache_root: paths::user_cache_dir()?,
            lock_path: paths::images_lock_path()?,
        })
    }

    /// Store rooted at explicit paths (tests, alternate roots).
    pub fn at(cache_root: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            lock_path: lock_path.into(),
        }
    }

    fn version_dir(&self, descriptor: &ImageDescriptor) -> PathBuf {
        self.cache_root
            .join("images")
            .join(descriptor.id)
            .join(descriptor.version)
    }

    /// Ensure the descriptor's artifact and flat disk image exist in the
    /// cache, verified against the catalog digest, and recorded in the
    /// lock. Idempotent; interrupted downloads resume on the next call.
    pub fn ensure_prepared(
        &self,
        descriptor: &ImageDescriptor,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> Result<PreparedPaths> {
        let dir = self.version_dir(descriptor);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        }

        let artifact_path = dir.join(descriptor.artifact_name);
        let raw_path = dir.join(BASE_RAW_FILE);

        let mut lock = ImageLock::load(&self.lock_path)?;

        // Fast path: both files present and already recorded.
        if artifact_path.exists()
            && raw_path.exists()
            && lock.get(descriptor.id, descriptor.version).is_some()
        {
            debug!(id = descriptor.id, version = descriptor.version, "image already prepared");
            (progress)(ProgressEvent::Done);
            return Ok(PreparedPaths {
                artifact_path,
                raw_path,
            });
        }

        // A complete artifact needs no network round trip; anything
        // else (absent or partial) goes through the resumable fetch.
        let have_verified_artifact = artifact_path.exists()
            && download::sha256_file(&artifact_path)?.eq_ignore_ascii_case(descriptor.sha256);

        if !have_verified_artifact {
            (progress)(ProgressEvent::Phase {
                name: format!("download {}", descriptor.artifact_name),
            });
            download::fetch_resumable(
                descriptor.url,
                &artifact_path,
                descriptor.size_bytes,
                progress,
                cancel,
            )?;
            download::verify_sha256(&artifact_path, descriptor.sha256)?;
        }

        if !raw_path.exists() {
            (progress)(ProgressEvent::Phase {
                name: format!("extract {}", descriptor.raw_member),
            });
            extract::extract_member(&artifact_path, descriptor.raw_member, &raw_path, cancel)?;
        }

        lock.upsert(ImageLockRef {
            id: descriptor.id.to_string(),
            version: descriptor.version.to_string(),
            sha256: descriptor.sha256.to_lowercase(),
            artifact_path: artifact_path.clone(),
            raw_path: raw_path.clone(),
            downloaded_at: utc_stamp(),
        });
        lock.save(&self.lock_path)?;

        info!(
            id = descriptor.id,
            version = descriptor.version,
            raw = %raw_path.display(),
            "image prepared"
        );
        (progress)(ProgressEvent::Done);
        Ok(PreparedPaths {
            artifact_path,
            raw_path,
        })
    }

    /// Look up previously prepared paths without touching the network.
    pub fn prepared(&self, descriptor: &ImageDescriptor) -> Result<Option<PreparedPaths>> {
        let lock = ImageLock::load(&self.lock_path)?;
        match lock.get(descriptor.id, descriptor.version) {
            Some(entry) if entry.artifact_path.exists() && entry.raw_path.exists() => {
                Ok(Some(PreparedPaths {
                    artifact_path: entry.artifact_path.clone(),
                    raw_path: entry.raw_path.clone(),
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

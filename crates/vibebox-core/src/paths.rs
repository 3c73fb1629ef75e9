use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::catalog::ImageDescriptor;
use crate::config::PROJECT_STATE_DIR;

/// Application directory name under the user config/cache roots.
pub const APP_DIR: &str = "vibebox";
/// Image lock file name.
pub const IMAGES_LOCK_FILE: &str = "images.lock.yaml";
/// Extracted flat disk image name inside a cache version directory.
pub const BASE_RAW_FILE: &str = "base.raw";

/// `<user_config_dir>/vibebox`.
pub fn user_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Cannot determine the user config directory")?;
    Ok(base.join(APP_DIR))
}

/// `<user_cache_dir>/vibebox`.
pub fn user_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("Cannot determine the user cache directory")?;
    Ok(base.join(APP_DIR))
}

/// `<user_config_dir>/vibebox/images.lock.yaml`.
pub fn images_lock_path() -> Result<PathBuf> {
    Ok(user_config_dir()?.join(IMAGES_LOCK_FILE))
}

/// `<user_cache_dir>/vibebox/images/<id>/<version>`.
pub fn image_cache_dir(id: &str, version: &str) -> Result<PathBuf> {
    Ok(user_cache_dir()?.join("images").join(id).join(version))
}

/// Cache location of an image's downloaded artifact.
pub fn artifact_path(descriptor: &ImageDescriptor) -> Result<PathBuf> {
    Ok(image_cache_dir(descriptor.id, descriptor.version)?.join(descriptor.artifact_name))
}

/// Cache location of an image's extracted flat disk.
pub fn base_raw_path(descriptor: &ImageDescriptor) -> Result<PathBuf> {
    Ok(image_cache_dir(descriptor.id, descriptor.version)?.join(BASE_RAW_FILE))
}

/// `<project_root>/.vibebox`.
pub fn project_state_dir(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_STATE_DIR)
}

/// Per-project mutable clone of the base disk image.
pub fn instance_raw_path(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join("instance.raw")
}

/// Per-project EFI variable store, persisted across boots.
pub fn efi_varstore_path(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join("efi.varstore")
}

/// Advisory lock taken while a VM owns the instance disk.
pub fn instance_lock_path(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join("instance.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    #[test]
    fn test_cache_layout() {
        let dir = image_cache_dir("ubuntu-24.04", "24.04.2").unwrap();
        let s = dir.to_string_lossy();
        assert!(s.contains("vibebox"));
        assert!(s.ends_with("images/ubuntu-24.04/24.04.2"));
    }

    #[test]
    fn test_artifact_and_raw_share_a_directory() {
        let img = catalog::find("ubuntu-24.04").unwrap();
        let artifact = artifact_path(img).unwrap();
        let raw = base_raw_path(img).unwrap();
        assert_eq!(artifact.parent(), raw.parent());
        assert_eq!(raw.file_name().unwrap(), BASE_RAW_FILE);
    }

    #[test]
    fn test_project_paths_live_under_state_dir() {
        let root = Path::new("/tmp/project");
        assert_eq!(
            instance_raw_path(root),
            Path::new("/tmp/project/.vibebox/instance.raw")
        );
        assert_eq!(
            efi_varstore_path(root),
            Path::new("/tmp/project/.vibebox/efi.varstore")
        );
        assert_eq!(
            instance_lock_path(root),
            Path::new("/tmp/project/.vibebox/instance.lock")
        );
    }
}

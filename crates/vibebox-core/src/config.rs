use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

pub const PROVIDER_OFF: &str = "off";
pub const PROVIDER_APPLE_VM: &str = "apple-vm";
pub const PROVIDER_DOCKER: &str = "docker";
pub const PROVIDER_AUTO: &str = "auto";

/// Directory under the project root holding vibebox state.
pub const PROJECT_STATE_DIR: &str = ".vibebox";
/// Project configuration file name inside the state directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Canonicalize a provider name. Legacy "macos" maps to "apple-vm";
/// the map is a closure: normalize(normalize(x)) == normalize(x).
pub fn normalize_provider(provider: &str) -> String {
    let p = provider.trim();
    match p {
        "macos" => PROVIDER_APPLE_VM.to_string(),
        _ => p.to_string(),
    }
}

fn is_known_provider(provider: &str) -> bool {
    matches!(
        provider,
        PROVIDER_OFF | PROVIDER_APPLE_VM | PROVIDER_DOCKER | PROVIDER_AUTO
    )
}

/// Mount access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    Rw,
}

impl Default for MountMode {
    fn default() -> Self {
        Self::Rw
    }
}

/// A host path shared into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub guest: String,
    #[serde(default)]
    pub mode: MountMode,
}

impl Mount {
    pub fn read_only(&self) -> bool {
        self.mode == MountMode::Ro
    }
}

/// Apple-VM settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSettings {
    #[serde(default = "default_image_id")]
    pub image_id: String,
    #[serde(default = "default_image_version")]
    pub image_version: String,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_ram_mb")]
    pub ram_mb: u32,
    /// Optional shell script run once inside a fresh instance disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_script: Option<String>,
}

fn default_image_id() -> String {
    "ubuntu-24.04".to_string()
}
fn default_image_version() -> String {
    "24.04.2".to_string()
}
fn default_disk_gb() -> u32 {
    10
}
fn default_cpus() -> u32 {
    2
}
fn default_ram_mb() -> u32 {
    2048
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            image_id: default_image_id(),
            image_version: default_image_version(),
            disk_gb: default_disk_gb(),
            cpus: default_cpus(),
            ram_mb: default_ram_mb(),
            provision_script: None,
        }
    }
}

/// Docker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_docker_image")]
    pub image: String,
}

fn default_docker_image() -> String {
    "ubuntu:24.04".to_string()
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            image: default_docker_image(),
        }
    }
}

/// Project configuration, persisted at `<root>/.vibebox/config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub vm: VmSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

fn default_provider() -> String {
    PROVIDER_AUTO.to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        let mut cfg = Self {
            provider: default_provider(),
            vm: VmSettings::default(),
            docker: DockerSettings::default(),
            mounts: Vec::new(),
        };
        cfg.mounts.push(default_workspace_mount());
        cfg
    }
}

/// The default profile share: project root at /workspace, read-write.
pub fn default_workspace_mount() -> Mount {
    Mount {
        host: ".".to_string(),
        guest: "/workspace".to_string(),
        mode: MountMode::Rw,
    }
}

impl ProjectConfig {
    /// Path of the config file for a project root.
    pub fn path(project_root: &Path) -> PathBuf {
        project_root.join(PROJECT_STATE_DIR).join(CONFIG_FILE)
    }

    /// Canonicalize and validate. After this returns Ok, the provider is
    /// canonical and the mounts list is non-empty.
    pub fn validate(&mut self) -> Result<()> {
        self.provider = normalize_provider(&self.provider);
        if !is_known_provider(&self.provider) {
            return Err(SandboxError::Validation(format!(
                "unknown provider {:?} (expected off, apple-vm, docker, or auto)",
                self.provider
            ))
            .into());
        }
        if self.vm.disk_gb < 1 {
            return Err(SandboxError::Validation("vm.disk_gb must be >= 1".to_string()).into());
        }
        if self.vm.cpus < 1 {
            return Err(SandboxError::Validation("vm.cpus must be >= 1".to_string()).into());
        }
        if self.vm.ram_mb < 256 {
            return Err(SandboxError::Validation("vm.ram_mb must be >= 256".to_string()).into());
        }
        if self.mounts.is_empty() {
            self.mounts.push(default_workspace_mount());
        }
        for mount in &self.mounts {
            if mount.host.is_empty() {
                return Err(
                    SandboxError::Validation("mount host must not be empty".to_string()).into(),
                );
            }
            if !mount.guest.starts_with('/') {
                return Err(SandboxError::Validation(format!(
                    "mount guest path must be absolute: {:?}",
                    mount.guest
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Load and validate the config for a project. Legacy provider
    /// values are canonicalized in memory; the file is rewritten on the
    /// next save.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = Self::path(project_root);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate and persist atomically (temp file + rename).
    pub fn save(&self, project_root: &Path) -> Result<()> {
        let mut canonical = self.clone();
        canonical.validate()?;

        let path = Self::path(project_root);
        let dir = path.parent().expect("config path has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let yaml = serde_yaml::to_string(&canonical)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_provider_maps_legacy_macos() {
        assert_eq!(normalize_provider("macos"), "apple-vm");
        assert_eq!(normalize_provider("apple-vm"), "apple-vm");
        assert_eq!(normalize_provider("docker"), "docker");
    }

    #[test]
    fn test_normalize_provider_is_a_closure() {
        for p in ["macos", "apple-vm", "docker", "off", "auto", "weird"] {
            let once = normalize_provider(p);
            assert_eq!(normalize_provider(&once), once);
        }
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let mut cfg = ProjectConfig::default();
        cfg.provider = "qemu".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_defaults_empty_mounts() {
        let mut cfg = ProjectConfig::default();
        cfg.mounts.clear();
        cfg.validate().unwrap();
        assert_eq!(cfg.mounts, vec![default_workspace_mount()]);
    }

    #[test]
    fn test_validate_rejects_relative_guest_path() {
        let mut cfg = ProjectConfig::default();
        cfg.mounts = vec![Mount {
            host: ".".to_string(),
            guest: "workspace".to_string(),
            mode: MountMode::Rw,
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_bounds() {
        let mut cfg = ProjectConfig::default();
        cfg.vm.ram_mb = 128;
        assert!(cfg.validate().is_err());
        cfg.vm.ram_mb = 256;
        cfg.vm.cpus = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ProjectConfig::default();
        cfg.provider = "macos".to_string();
        cfg.vm.provision_script = Some("apt-get install -y build-essential".to_string());
        cfg.save(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        // Equivalent modulo provider canonicalization.
        assert_eq!(loaded.provider, "apple-vm");
        assert_eq!(loaded.vm, cfg.vm);
        assert_eq!(loaded.mounts, cfg.mounts);
    }

    #[test]
    fn test_load_accepts_legacy_macos_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = ProjectConfig::path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "provider: macos\n").unwrap();

        let cfg = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.provider, "apple-vm");
        assert!(!cfg.mounts.is_empty());
    }
}

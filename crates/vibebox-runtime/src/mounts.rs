use std::path::{Path, PathBuf};

use anyhow::Result;

use vibebox_core::config::{Mount, default_workspace_mount};
use vibebox_core::error::SandboxError;

use crate::jail::clean_relative;
use crate::spec::RuntimeSpec;

/// One host directory exported to the guest, with its virtiofs share
/// name and guest mount target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareBinding {
    /// Share name inside the virtiofs device map ("share<i>").
    pub name: String,
    /// Absolute host path.
    pub host: PathBuf,
    /// Absolute guest mount point.
    pub guest: String,
    pub read_only: bool,
}

/// Resolve the config's mounts into share bindings. Relative host
/// paths resolve against the project root; an empty mount list becomes
/// the default project-root share at /workspace.
pub fn share_bindings(spec: &RuntimeSpec) -> Vec<ShareBinding> {
    let mounts: Vec<Mount> = if spec.config.mounts.is_empty() {
        vec![default_workspace_mount()]
    } else {
        spec.config.mounts.clone()
    };

    mounts
        .iter()
        .enumerate()
        .map(|(i, m)| ShareBinding {
            name: format!("share{}", i),
            host: resolve_host(&spec.project_root, &m.host),
            guest: m.guest.clone(),
            read_only: m.read_only(),
        })
        .collect()
}

fn resolve_host(project_root: &Path, host: &str) -> PathBuf {
    let path = Path::new(host);
    if path.is_absolute() {
        path.to_path_buf()
    } else if host == "." {
        project_root.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// The guest path treated as the workspace: the project-root mount's
/// guest if one exists, else the first declared mount's guest, else
/// /workspace.
pub fn workspace_guest(spec: &RuntimeSpec) -> String {
    let bindings = share_bindings(spec);
    if let Some(b) = bindings.iter().find(|b| b.host == spec.project_root) {
        return b.guest.clone();
    }
    bindings
        .first()
        .map(|b| b.guest.clone())
        .unwrap_or_else(|| "/workspace".to_string())
}

/// Resolve a request cwd to an absolute guest path.
///
/// Absolute paths pass through; empty means the workspace; relative
/// paths require a project-root mount and are joined below its guest
/// path after lexical cleaning.
pub fn resolve_guest_cwd(spec: &RuntimeSpec, cwd: &str) -> Result<String> {
    if cwd.starts_with('/') {
        return Ok(cwd.to_string());
    }
    if cwd.is_empty() {
        return Ok(workspace_guest(spec));
    }

    let bindings = share_bindings(spec);
    let root_binding = bindings
        .iter()
        .find(|b| b.host == spec.project_root)
        .ok_or_else(|| SandboxError::PathEscape(format!(
            "relative cwd {:?} requires the project root to be mounted",
            cwd
        )))?;

    let cleaned = clean_relative(cwd)?;
    if cleaned.is_empty() {
        return Ok(root_binding.guest.clone());
    }
    Ok(format!(
        "{}/{}",
        root_binding.guest.trim_end_matches('/'),
        cleaned
    ))
}

use std::path::PathBuf;

use vibebox_core::config::ProjectConfig;
use vibebox_core::naming;
use vibebox_core::paths;

/// Everything a backend needs for one invocation against a project.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub project_root: PathBuf,
    pub project_name: String,
    pub config: ProjectConfig,
    /// Shared, immutable disk image from the cache. Empty when the
    /// selected backend boots no VM.
    pub base_raw_path: PathBuf,
    /// Project-local mutable clone of the base image. Owned by the
    /// apple-vm backend for the duration of a VM lifecycle and retained
    /// across invocations to preserve provisioning.
    pub instance_raw_path: PathBuf,
}

impl RuntimeSpec {
    pub fn new(project_root: PathBuf, config: ProjectConfig, base_raw_path: PathBuf) -> Self {
        let project_name = naming::project_name(&project_root);
        let instance_raw_path = paths::instance_raw_path(&project_root);
        Self {
            project_root,
            project_name,
            config,
            base_raw_path,
            instance_raw_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_derives_name_and_instance_path() {
        let spec = RuntimeSpec::new(
            PathBuf::from("/tmp/demo"),
            ProjectConfig::default(),
            PathBuf::from("/cache/base.raw"),
        );
        assert_eq!(spec.project_name, "demo");
        assert_eq!(
            spec.instance_raw_path,
            PathBuf::from("/tmp/demo/.vibebox/instance.raw")
        );
    }
}

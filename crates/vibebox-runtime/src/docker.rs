use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use vibebox_core::cancel::CancelToken;
use vibebox_core::error::SandboxError;
use vibebox_core::naming::sanitize_container_name;
use vibebox_core::progress::{ProgressEvent, ProgressFn};
use vibebox_core::request::{ExecRequest, ExecResult, ProbeResult};

use crate::backend::{Backend, StartIo};
use crate::mounts::{ShareBinding, resolve_guest_cwd, share_bindings};
use crate::shell;
use crate::spec::RuntimeSpec;

const DOCKER: &str = "docker";

/// Linux-container backend: a thin wrapper over the daemon CLI.
/// Probe shells `docker info`, prepare pulls the image, every exec is
/// one `docker run --rm`.
pub struct DockerBackend;

impl DockerBackend {
    /// Mount flags, after checking every host path exists.
    fn mount_args(&self, spec: &RuntimeSpec) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for binding in share_bindings(spec) {
            let ShareBinding {
                host, guest, read_only, ..
            } = binding;
            if !host.exists() {
                return Err(SandboxError::Validation(format!(
                    "mount host path does not exist: {}",
                    host.display()
                ))
                .into());
            }
            let mode = if read_only { "ro" } else { "rw" };
            args.push("-v".to_string());
            args.push(format!("{}:{}:{}", host.display(), guest, mode));
        }
        Ok(args)
    }
}

impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn probe(&self) -> ProbeResult {
        if which::which(DOCKER).is_err() {
            return ProbeResult::unavailable(
                "docker CLI not found on PATH",
                vec!["Install Docker Desktop or the docker CLI".to_string()],
            );
        }
        match shell::run_host(DOCKER, &["info"]) {
            Ok(out) if out.status.success() => ProbeResult::available(),
            Ok(out) => ProbeResult::unavailable(
                format!(
                    "docker daemon is not responding: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                vec!["Start Docker Desktop (or the docker daemon)".to_string()],
            ),
            Err(e) => ProbeResult::unavailable(
                format!("failed to run docker info: {}", e),
                vec!["Check the docker installation".to_string()],
            ),
        }
    }

    fn prepare(&self, spec: &RuntimeSpec, progress: &ProgressFn, cancel: &CancelToken)
    -> Result<()> {
        let image = &spec.config.docker.image;
        let inspect = shell::run_host(DOCKER, &["image", "inspect", image])?;
        if inspect.status.success() {
            debug!(image, "docker image already present");
            return Ok(());
        }

        (progress)(ProgressEvent::Phase {
            name: format!("pull {}", image),
        });
        info!(image, "pulling docker image");
        let mut cmd = Command::new(DOCKER);
        cmd.args(["pull", image]);
        let out = shell::run_with_deadline(&mut cmd, None, cancel)?;
        if !out.status.success() {
            anyhow::bail!(
                "docker pull {} failed: {}",
                image,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        (progress)(ProgressEvent::Done);
        Ok(())
    }

    fn exec(
        &self,
        spec: &RuntimeSpec,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        let guest_cwd = resolve_guest_cwd(spec, &request.cwd)?;

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "-e".to_string(),
            "IS_SANDBOX=1".to_string(),
        ];
        args.extend(self.mount_args(spec)?);
        for (k, v) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push("-w".to_string());
        args.push(guest_cwd);
        args.push(spec.config.docker.image.clone());
        args.push("/bin/bash".to_string());
        args.push("-lc".to_string());
        args.push(request.command.clone());

        debug!(?args, "docker exec");
        let timeout = if request.timeout == Duration::ZERO {
            None
        } else {
            Some(request.timeout)
        };
        let mut cmd = Command::new(DOCKER);
        cmd.args(&args);
        let out = shell::run_with_deadline(&mut cmd, timeout, cancel)?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit_code: out.status.code().unwrap_or(-1),
        })
    }

    fn start(&self, spec: &RuntimeSpec, _io: StartIo, _cancel: &CancelToken) -> Result<()> {
        let container = format!("vibebox-{}", sanitize_container_name(&spec.project_name));

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-it".to_string(),
            "--name".to_string(),
            container,
            "-e".to_string(),
            "IS_SANDBOX=1".to_string(),
        ];
        args.extend(self.mount_args(spec)?);
        args.push("-w".to_string());
        args.push(resolve_guest_cwd(spec, "")?);
        args.push(spec.config.docker.image.clone());
        args.push("/bin/bash".to_string());
        args.push("-l".to_string());

        let status = Command::new(DOCKER)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .context("Failed to run docker")?;
        if !status.success() {
            anyhow::bail!("docker run exited with {}", status.code().unwrap_or(-1));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vibebox_core::config::{Mount, MountMode, ProjectConfig};

    fn spec_in(dir: &std::path::Path, mounts: Vec<Mount>) -> RuntimeSpec {
        let mut config = ProjectConfig::default();
        config.mounts = mounts;
        RuntimeSpec::new(dir.to_path_buf(), config, PathBuf::new())
    }

    #[test]
    fn test_mount_args_include_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let spec = spec_in(
            dir.path(),
            vec![Mount {
                host: "data".to_string(),
                guest: "/data".to_string(),
                mode: MountMode::Ro,
            }],
        );
        let args = DockerBackend.mount_args(&spec).unwrap();
        assert_eq!(args[0], "-v");
        assert!(args[1].ends_with("/data:/data:ro"));
    }

    #[test]
    fn test_mount_args_require_existing_host() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(
            dir.path(),
            vec![Mount {
                host: "missing".to_string(),
                guest: "/data".to_string(),
                mode: MountMode::Rw,
            }],
        );
        let err = DockerBackend.mount_args(&spec).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Validation(_))
        ));
    }
}

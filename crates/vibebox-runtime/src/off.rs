use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use vibebox_core::cancel::CancelToken;
use vibebox_core::progress::ProgressFn;
use vibebox_core::request::{ExecRequest, ExecResult, ProbeResult};

use crate::backend::{
    Backend, SessionBackend, SessionHandle, StartIo, merge_session_request,
};
use crate::jail::resolve_host_cwd;
use crate::shell;
use crate::spec::RuntimeSpec;

const BASH: &str = "/bin/bash";

/// Host environment variables forwarded into off-backend commands.
/// Fixed by design; request env overrides individual entries.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TMPDIR"];

/// The host-local fallback: `/bin/bash -lc` with a jailed cwd and a
/// sanitized environment. No isolation beyond that — it must be asked
/// for explicitly and is never chosen by auto-selection.
pub struct OffBackend;

fn sanitized_env(request_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    for (k, v) in request_env {
        env.insert(k.clone(), v.clone());
    }
    env
}

impl Backend for OffBackend {
    fn name(&self) -> &'static str {
        "off"
    }

    fn probe(&self) -> ProbeResult {
        if Path::new(BASH).exists() {
            ProbeResult::available()
        } else {
            ProbeResult::unavailable(
                format!("{} not found", BASH),
                vec!["install bash at /bin/bash".to_string()],
            )
        }
    }

    fn prepare(&self, _spec: &RuntimeSpec, _progress: &ProgressFn, _cancel: &CancelToken)
    -> Result<()> {
        Ok(())
    }

    fn exec(
        &self,
        spec: &RuntimeSpec,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        let cwd = resolve_host_cwd(&spec.project_root, &request.cwd)?;
        debug!(cwd = %cwd.display(), "off exec");

        let mut cmd = Command::new(BASH);
        cmd.args(["-lc", &request.command])
            .current_dir(&cwd)
            .env_clear()
            .envs(sanitized_env(&request.env));

        // Timeout 0 means unlimited for the off backend.
        let timeout = if request.timeout == Duration::ZERO {
            None
        } else {
            Some(request.timeout)
        };

        let output = shell::run_with_deadline(&mut cmd, timeout, cancel)?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn start(&self, spec: &RuntimeSpec, _io: StartIo, _cancel: &CancelToken) -> Result<()> {
        // Interactive shells run directly on the host tty.
        let status = Command::new(BASH)
            .arg("-l")
            .current_dir(&spec.project_root)
            .env_clear()
            .envs(sanitized_env(&BTreeMap::new()))
            .status()?;
        if !status.success() {
            anyhow::bail!("shell exited with {}", status.code().unwrap_or(-1));
        }
        Ok(())
    }

    fn sessions(&self) -> Option<&dyn SessionBackend> {
        Some(self)
    }
}

impl SessionBackend for OffBackend {
    fn open_session(&self, spec: &RuntimeSpec) -> Result<SessionHandle> {
        Ok(SessionHandle {
            cwd: spec.project_root.to_string_lossy().to_string(),
            env: BTreeMap::new(),
        })
    }

    fn exec_in_session(
        &self,
        spec: &RuntimeSpec,
        handle: &SessionHandle,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        let merged = merge_session_request(handle, request);
        self.exec(spec, &merged, cancel)
    }

    fn close_session(&self, _handle: &SessionHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vibebox_core::config::ProjectConfig;
    use vibebox_core::error::SandboxError;

    fn spec_in(dir: &Path) -> RuntimeSpec {
        RuntimeSpec::new(
            dir.to_path_buf(),
            ProjectConfig::default(),
            std::path::PathBuf::new(),
        )
    }

    #[test]
    fn test_probe_finds_bash() {
        assert!(OffBackend.probe().available);
    }

    #[test]
    fn test_exec_echo() {
        let dir = tempfile::tempdir().unwrap();
        let result = OffBackend
            .exec(
                &spec_in(dir.path()),
                &ExecRequest::new("echo vibebox-off"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "vibebox-off\n");
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn test_exec_preserves_exit_255() {
        let dir = tempfile::tempdir().unwrap();
        let result = OffBackend
            .exec(
                &spec_in(dir.path()),
                &ExecRequest::new("exit 255"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.exit_code, 255);
    }

    #[test]
    fn test_exec_separates_streams() {
        let dir = tempfile::tempdir().unwrap();
        let result = OffBackend
            .exec(
                &spec_in(dir.path()),
                &ExecRequest::new("echo out; echo err >&2"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn test_exec_runs_in_jailed_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut request = ExecRequest::new("pwd");
        request.cwd = "sub".to_string();
        let result = OffBackend
            .exec(&spec_in(dir.path()), &request, &CancelToken::new())
            .unwrap();
        assert!(result.stdout.trim().ends_with("/sub"));
    }

    #[test]
    fn test_exec_rejects_cwd_escape() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = ExecRequest::new("pwd");
        request.cwd = "../..".to_string();
        let err = OffBackend
            .exec(&spec_in(dir.path()), &request, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::PathEscape(_))
        ));
    }

    #[test]
    fn test_env_is_allowlisted() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test-only process env mutation.
        unsafe { std::env::set_var("VIBEBOX_TEST_SECRET", "leaky") };
        let result = OffBackend
            .exec(
                &spec_in(dir.path()),
                &ExecRequest::new("echo secret=${VIBEBOX_TEST_SECRET:-unset}"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.stdout, "secret=unset\n");
    }

    #[test]
    fn test_request_env_overrides_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = ExecRequest::new("echo $LANG");
        request
            .env
            .insert("LANG".to_string(), "xx_XX.UTF-8".to_string());
        let result = OffBackend
            .exec(&spec_in(dir.path()), &request, &CancelToken::new())
            .unwrap();
        assert_eq!(result.stdout, "xx_XX.UTF-8\n");
    }

    #[test]
    fn test_session_handle_defaults_to_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(dir.path());
        let handle = OffBackend.open_session(&spec).unwrap();
        let result = OffBackend
            .exec_in_session(
                &spec,
                &handle,
                &ExecRequest::new("echo session-ok"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "session-ok\n");
    }
}

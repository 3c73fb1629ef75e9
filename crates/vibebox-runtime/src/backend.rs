use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::Result;

use vibebox_core::cancel::CancelToken;
use vibebox_core::progress::ProgressFn;
use vibebox_core::request::{ExecRequest, ExecResult, ProbeResult};

use crate::spec::RuntimeSpec;

/// Stdio wiring for an interactive start. Backends that run the child
/// directly on the host tty ignore this and inherit.
pub struct StartIo {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
}

impl StartIo {
    /// The calling process's own stdio.
    pub fn host() -> Self {
        Self {
            stdin: Box::new(std::io::stdin()),
            stdout: Box::new(std::io::stdout()),
        }
    }
}

/// One execution backend. Implementations are stateless and shared;
/// all per-invocation state travels in the `RuntimeSpec`.
pub trait Backend: Send + Sync {
    /// Canonical provider name ("off", "docker", "apple-vm").
    fn name(&self) -> &'static str;

    /// Cheap availability check with actionable hints on failure.
    fn probe(&self) -> ProbeResult;

    /// Make the backend ready to execute for this project (pull an
    /// image, clone an instance disk, provision). Idempotent.
    fn prepare(&self, spec: &RuntimeSpec, progress: &ProgressFn, cancel: &CancelToken)
    -> Result<()>;

    /// Run one non-interactive command, capturing stdout/stderr/exit.
    fn exec(
        &self,
        spec: &RuntimeSpec,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult>;

    /// Run an interactive shell until the user's input ends.
    fn start(&self, spec: &RuntimeSpec, io: StartIo, cancel: &CancelToken) -> Result<()>;

    /// Optional session capability. Backends without reusable session
    /// state return `None` and the service falls back to plain exec.
    fn sessions(&self) -> Option<&dyn SessionBackend> {
        None
    }
}

/// Backend-specific session handle: a bag of defaults merged under
/// each request. Opaque to the service registry.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

/// Optional capability for backends that support reusable sessions.
pub trait SessionBackend: Sync {
    /// Open a session handle for the project.
    fn open_session(&self, spec: &RuntimeSpec) -> Result<SessionHandle>;

    /// Execute with the handle's defaults merged under the request
    /// (request values win).
    fn exec_in_session(
        &self,
        spec: &RuntimeSpec,
        handle: &SessionHandle,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult>;

    /// Release backend resources held by the handle. Idempotent.
    fn close_session(&self, handle: &SessionHandle) -> Result<()>;
}

/// Merge a request over session-handle defaults: handle supplies cwd
/// and env entries the request leaves unset.
pub fn merge_session_request(handle: &SessionHandle, request: &ExecRequest) -> ExecRequest {
    let mut merged = request.clone();
    if merged.cwd.is_empty() {
        merged.cwd = handle.cwd.clone();
    }
    for (k, v) in &handle.env {
        merged.env.entry(k.clone()).or_insert_with(|| v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_request_values() {
        let mut handle = SessionHandle::default();
        handle.cwd = "/workspace".to_string();
        handle.env.insert("A".to_string(), "handle".to_string());
        handle.env.insert("B".to_string(), "handle".to_string());

        let mut request = ExecRequest::new("true");
        request.cwd = "/elsewhere".to_string();
        request.env.insert("A".to_string(), "request".to_string());

        let merged = merge_session_request(&handle, &request);
        assert_eq!(merged.cwd, "/elsewhere");
        assert_eq!(merged.env["A"], "request");
        assert_eq!(merged.env["B"], "handle");
    }

    #[test]
    fn test_merge_fills_empty_cwd() {
        let mut handle = SessionHandle::default();
        handle.cwd = "/workspace".to_string();
        let merged = merge_session_request(&handle, &ExecRequest::new("true"));
        assert_eq!(merged.cwd, "/workspace");
    }
}

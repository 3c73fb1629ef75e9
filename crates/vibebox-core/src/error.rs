use thiserror::Error;

/// Error taxonomy for the sandbox launcher.
///
/// Every failure surfaced by the service maps onto exactly one of these
/// kinds. Callers attach them to `anyhow` chains; tests recover the kind
/// with `downcast_ref::<SandboxError>()`.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Invalid provider name, mount mode, cwd, required field, or image id.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// sha256 mismatch after download. The artifact has been removed.
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// Non-200/206 status or transport failure. Retryable by the user:
    /// a re-run resumes from the bytes already on disk.
    #[error("download failed: {0}")]
    Download(String),

    /// A requested backend failed its probe.
    #[error("backend '{name}' is unavailable: {reason}")]
    Unavailable {
        name: String,
        reason: String,
        fix_hints: Vec<String>,
    },

    /// Auto selection found no usable backend.
    #[error("no usable backend: apple-vm: {apple_reason}; docker: {docker_reason}")]
    AutoFailure {
        apple_reason: String,
        docker_reason: String,
    },

    /// The VM never reached the running state within its deadline.
    #[error("vm boot failed: {0}")]
    Boot(String),

    /// No login prompt or shell prompt appeared on the console in time.
    #[error("guest login timed out: {0}")]
    LoginTimeout(String),

    /// The virtiofs mount sequence failed or timed out.
    #[error("guest mount failed: {0}")]
    Mount(String),

    /// Exec produced no parsable exit marker. `tail` holds the last
    /// 512 characters of de-ANSI-escaped console output for diagnosis.
    #[error("no exit marker in console output; guest may have crashed. Last output: {tail}")]
    MarkerMissing { tail: String },

    /// Command timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A cwd or mount host path escapes the project root.
    #[error("path escapes project root: {0}")]
    PathEscape(String),

    /// Context cancellation (e.g. ctrl-c).
    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_carries_name_and_reason() {
        let err = SandboxError::Unavailable {
            name: "docker".to_string(),
            reason: "daemon not running".to_string(),
            fix_hints: vec!["start Docker Desktop".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("docker"));
        assert!(msg.contains("daemon not running"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = SandboxError::Cancelled.into();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Cancelled)
        ));
    }

    #[test]
    fn test_auto_failure_contains_both_reasons() {
        let err = SandboxError::AutoFailure {
            apple_reason: "missing entitlement".to_string(),
            docker_reason: "cli not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing entitlement"));
        assert!(msg.contains("cli not found"));
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Exec request/response
// ============================================================================

/// A single non-interactive command execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    /// Guest (or host, for the off backend) working directory. Empty
    /// means the backend default; relative paths resolve against the
    /// project-root mount.
    pub cwd: String,
    /// Extra environment, merged over the backend's defaults.
    pub env: BTreeMap<String, String>,
    /// Zero means the backend default.
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: String::new(),
            env: BTreeMap::new(),
            timeout: Duration::ZERO,
        }
    }
}

/// Captured output of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

// ============================================================================
// Probe & selection
// ============================================================================

/// Result of probing one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub available: bool,
    pub reason: String,
    pub fix_hints: Vec<String>,
}

impl ProbeResult {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: String::new(),
            fix_hints: Vec::new(),
        }
    }

    pub fn unavailable(reason: impl Into<String>, fix_hints: Vec<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
            fix_hints,
        }
    }
}

/// Outcome of provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    /// Canonical provider name of the chosen backend.
    pub provider: String,
    /// Probe results for every backend, by name.
    pub diagnostics: BTreeMap<String, ProbeResult>,
    /// True when auto fell back from the platform-preferred backend.
    pub was_fallback: bool,
    /// The backend fallen back from; empty when `was_fallback` is false.
    pub fallback_from: String,
}

// ============================================================================
// Sessions
// ============================================================================

/// Session lifecycle state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Public view of a service session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub provider: String,
    /// Selection diagnostics captured at session start.
    pub diagnostics: BTreeMap<String, ProbeResult>,
    pub created_at: String,
    pub state: SessionState,
}

impl Session {
    /// Fresh active session: generated id, UTC creation stamp to the
    /// second.
    pub fn new_active(provider: String, diagnostics: BTreeMap<String, ProbeResult>) -> Self {
        Self {
            id: crate::naming::generate_session_id(),
            provider,
            diagnostics,
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            state: SessionState::Active,
        }
    }
}

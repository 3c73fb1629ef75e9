//! JSON bridge objects: the single-object stdout contract consumed by
//! the agent runtime. camelCase keys, exit-code rules applied by the
//! caller.

use std::collections::BTreeMap;

use serde::Serialize;

use vibebox_core::request::{ExecResult, ProbeResult, Selection};

use crate::service::{ExecReport, SelectReport};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticBridge {
    pub available: bool,
    pub reason: String,
    pub fix_hints: Vec<String>,
}

impl From<&ProbeResult> for DiagnosticBridge {
    fn from(probe: &ProbeResult) -> Self {
        Self {
            available: probe.available,
            reason: probe.reason.clone(),
            fix_hints: probe.fix_hints.clone(),
        }
    }
}

fn bridge_diagnostics(
    diagnostics: &BTreeMap<String, ProbeResult>,
) -> BTreeMap<String, DiagnosticBridge> {
    diagnostics
        .iter()
        .map(|(name, probe)| (name.clone(), probe.into()))
        .collect()
}

/// Probe bridge object. Process exit code is 0 iff `ok`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeBridge {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub selected: String,
    pub was_fallback: bool,
    pub fallback_from: String,
    pub diagnostics: BTreeMap<String, DiagnosticBridge>,
}

impl ProbeBridge {
    pub fn from_report(report: &SelectReport) -> Self {
        match &report.selection {
            Ok(selection) => Self {
                ok: true,
                error: None,
                selected: selection.provider.clone(),
                was_fallback: selection.was_fallback,
                fallback_from: selection.fallback_from.clone(),
                diagnostics: bridge_diagnostics(&report.diagnostics),
            },
            Err(e) => Self {
                ok: false,
                error: Some(format!("{:#}", e)),
                selected: String::new(),
                was_fallback: false,
                fallback_from: String::new(),
                diagnostics: bridge_diagnostics(&report.diagnostics),
            },
        }
    }
}

/// Exec bridge object. On success the process exits with
/// `exit_code`; on bridge/selection failure it exits non-zero with
/// `ok=false`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecBridge {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub selected: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub diagnostics: BTreeMap<String, DiagnosticBridge>,
}

impl ExecBridge {
    pub fn from_report(report: &ExecReport) -> Self {
        let selected = report
            .selection
            .as_ref()
            .map(|s: &Selection| s.provider.clone())
            .unwrap_or_default();
        match &report.result {
            Ok(result) => Self {
                ok: true,
                error: None,
                selected,
                exit_code: result.exit_code,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                diagnostics: bridge_diagnostics(&report.diagnostics),
            },
            Err(e) => Self {
                ok: false,
                error: Some(format!("{:#}", e)),
                selected,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                diagnostics: bridge_diagnostics(&report.diagnostics),
            },
        }
    }

    pub fn from_result(selected: &str, result: &ExecResult) -> Self {
        Self {
            ok: true,
            error: None,
            selected: selected.to_string(),
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            diagnostics: BTreeMap::new(),
        }
    }
}

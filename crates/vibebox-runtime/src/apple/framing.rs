//! Command framing over the serial console.
//!
//! The guest is a blind shell on a single interleaved stream, so each
//! non-interactive exec is wrapped in one compound command that captures
//! stdout and stderr to temp files and replays them between literal
//! markers, followed by the exit code and a poweroff. Parsing works on
//! the LAST occurrence of each marker: the console echoes the command
//! itself (which contains every marker string), and user output may
//! embed them too.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

use vibebox_core::error::SandboxError;
use vibebox_core::request::ExecResult;

pub const STDOUT_BEGIN: &str = "__VIBEBOX_STDOUT_BEGIN__";
pub const STDOUT_END: &str = "__VIBEBOX_STDOUT_END__";
pub const STDERR_BEGIN: &str = "__VIBEBOX_STDERR_BEGIN__";
pub const STDERR_END: &str = "__VIBEBOX_STDERR_END__";
pub const EXIT_MARKER: &str = "__VIBEBOX_EXIT_CODE__";

/// Characters of de-escaped output attached to a MarkerMissing error.
const DIAGNOSIS_TAIL_CHARS: usize = 512;

/// Escape a literal for single-quoted shell context: ' becomes '\''.
pub fn shell_escape(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Key-sorted `export K='V';` pairs, space-joined. Stable ordering for
/// reproducibility. Empty env yields an empty string.
pub fn env_exports(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("export {}='{}';", k, shell_escape(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the compound console command for one exec. Sent as a single
/// line; the trailing poweroff ends the VM lifecycle.
pub fn build_exec_command(
    command: &str,
    guest_cwd: &str,
    env: &BTreeMap<String, String>,
) -> String {
    let exports = env_exports(env);
    let exports = if exports.is_empty() {
        String::new()
    } else {
        format!("{} ", exports)
    };
    format!(
        "tmp_out=$(mktemp); tmp_err=$(mktemp); \
         (cd '{cwd}' && {exports}bash -lc '{cmd}') > \"$tmp_out\" 2> \"$tmp_err\"; \
         rc=$?; \
         printf '{so_begin}\\n'; cat \"$tmp_out\"; printf '\\n{so_end}\\n'; \
         printf '{se_begin}\\n'; cat \"$tmp_err\"; printf '\\n{se_end}\\n'; \
         printf '{exit}%s\\n' \"$rc\"; \
         rm -f \"$tmp_out\" \"$tmp_err\"; \
         poweroff",
        cwd = shell_escape(guest_cwd),
        exports = exports,
        cmd = shell_escape(command),
        so_begin = STDOUT_BEGIN,
        so_end = STDOUT_END,
        se_begin = STDERR_BEGIN,
        se_end = STDERR_END,
        exit = EXIT_MARKER,
    )
}

/// Last occurrence of `marker` in `buffer` that is directly followed by
/// a decimal digit, together with the parsed digits.
fn last_exit_marker(buffer: &str) -> Option<(usize, i32)> {
    let mut found = None;
    for (idx, _) in buffer.match_indices(EXIT_MARKER) {
        let tail = &buffer[idx + EXIT_MARKER.len()..];
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            continue;
        }
        if let Ok(code) = digits.parse::<i32>() {
            found = Some((idx, code));
        }
    }
    found
}

/// True once the buffer holds a parsable exit marker (marker text
/// directly followed by digits). The echoed command contains the
/// marker followed by `%s`, which this rejects.
pub fn has_exit_marker(buffer: &str) -> bool {
    last_exit_marker(buffer).is_some()
}

/// Substring between the last `begin` and the following `end`. The
/// framing printf adds exactly one newline after the begin marker and
/// one before the end marker; both are trimmed so the captured stream
/// round-trips byte for byte.
fn last_section<'a>(buffer: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let begin_at = buffer.rfind(begin)?;
    let body_start = begin_at + begin.len();
    let end_rel = buffer[body_start..].find(end)?;
    let section = &buffer[body_start..body_start + end_rel];
    let section = section.strip_prefix('\n').unwrap_or(section);
    Some(section.strip_suffix('\n').unwrap_or(section))
}

/// Recover stdout, stderr, and exit code from the accumulated console
/// buffer.
///
/// Priority: the structured marker path, then the exit-marker-only
/// fallback (whole buffer as stdout, marker line stripped), then a
/// `MarkerMissing` error carrying the de-ANSI-escaped tail.
pub fn parse_exec_output(buffer: &str) -> Result<ExecResult> {
    let Some((exit_at, exit_code)) = last_exit_marker(buffer) else {
        return Err(SandboxError::MarkerMissing {
            tail: tail_chars(&strip_ansi(buffer), DIAGNOSIS_TAIL_CHARS),
        }
        .into());
    };

    let stdout = last_section(buffer, STDOUT_BEGIN, STDOUT_END);
    let stderr = last_section(buffer, STDERR_BEGIN, STDERR_END);

    if let (Some(stdout), Some(stderr)) = (stdout, stderr) {
        return Ok(ExecResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        });
    }

    // Fallback: exit marker only. Strip its line from the buffer and
    // hand the rest back as stdout.
    let line_start = buffer[..exit_at].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = buffer[exit_at..]
        .find('\n')
        .map(|i| exit_at + i + 1)
        .unwrap_or(buffer.len());
    let mut stdout = String::with_capacity(buffer.len());
    stdout.push_str(&buffer[..line_start]);
    stdout.push_str(&buffer[line_end..]);
    Ok(ExecResult {
        stdout,
        stderr: String::new(),
        exit_code,
    })
}

/// Remove ANSI escape sequences (CSI and OSC forms).
pub fn strip_ansi(s: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b(\[[0-9;?]*[A-Za-z]|\][^\x07]*\x07)").expect("static regex")
    });
    re.replace_all(s, "").to_string()
}

/// Last `n` characters of a string, char-boundary safe.
pub fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

//! Boot/login/mount state machine constants and the guest-side mount
//! plan. The serial prompt needles live here and nowhere else: new
//! guest images must be vetted against this closed set.

use std::time::Duration;

use crate::mounts::ShareBinding;

/// Shell prompt substrings accepted as "the guest is at a prompt".
pub const PROMPT_HINTS: &[&str] = &["~# ", ":~# ", ":/# ", "/workspace# ", "# "];

/// The serial login prompt.
pub const LOGIN_PROMPT: &str = "login: ";

/// User sent in response to the login prompt (no password).
pub const LOGIN_USER: &str = "root";

/// Virtiofs device tag the guest mounts.
pub const VIRTIOFS_TAG: &str = "vibebox-shared";

/// Guest staging point for the virtiofs device.
pub const SHARED_ROOT: &str = "/mnt/shared";

/// Deadline for the platform VM to reach "running".
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(90);
/// Deadline for a login or shell prompt to appear after boot.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(180);
/// Deadline for a prompt after sending the login user.
pub const POST_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the mount compound command.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the VM to reach "stopped" after poweroff/exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Command deadline when the request specifies none.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// VM lifecycle phase. Error is terminal; no step retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    Constructed,
    Booting,
    Running,
    LoggingIn,
    Mounting,
    Ready,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Constructed => "constructed",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::LoggingIn => "logging_in",
            Self::Mounting => "mounting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// The single compound command that stages the virtiofs device and
/// bind-mounts every share onto its guest target, remounting read-only
/// shares accordingly.
pub fn mount_command(bindings: &[ShareBinding]) -> String {
    let mut parts = vec![
        format!("mkdir -p {}", SHARED_ROOT),
        format!("mount -t virtiofs {} {}", VIRTIOFS_TAG, SHARED_ROOT),
    ];
    for binding in bindings {
        parts.push(format!("mkdir -p {}", binding.guest));
        parts.push(format!(
            "mount --bind {}/{} {}",
            SHARED_ROOT, binding.name, binding.guest
        ));
        if binding.read_only {
            parts.push(format!("mount -o remount,ro,bind {}", binding.guest));
        }
    }
    parts.join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn binding(name: &str, guest: &str, read_only: bool) -> ShareBinding {
        ShareBinding {
            name: name.to_string(),
            host: PathBuf::from("/host"),
            guest: guest.to_string(),
            read_only,
        }
    }

    #[test]
    fn test_mount_command_stages_then_binds() {
        let cmd = mount_command(&[binding("share0", "/workspace", false)]);
        assert_eq!(
            cmd,
            "mkdir -p /mnt/shared && mount -t virtiofs vibebox-shared /mnt/shared \
             && mkdir -p /workspace && mount --bind /mnt/shared/share0 /workspace"
        );
    }

    #[test]
    fn test_read_only_shares_get_remounted() {
        let cmd = mount_command(&[binding("share1", "/data", true)]);
        assert!(cmd.ends_with("mount -o remount,ro,bind /data"));
    }

    #[test]
    fn test_multiple_bindings_preserve_order() {
        let cmd = mount_command(&[
            binding("share0", "/workspace", false),
            binding("share1", "/data", true),
        ]);
        let ws = cmd.find("/mnt/shared/share0 /workspace").unwrap();
        let data = cmd.find("/mnt/shared/share1 /data").unwrap();
        assert!(ws < data);
    }

    #[test]
    fn test_prompt_hints_are_a_closed_set() {
        assert_eq!(PROMPT_HINTS.len(), 5);
        // The generic "# " hint must come last so specific hints are
        // listed (and documented) first.
        assert_eq!(*PROMPT_HINTS.last().unwrap(), "# ");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(VmPhase::LoggingIn.to_string(), "logging_in");
        assert_eq!(VmPhase::Ready.to_string(), "ready");
    }
}

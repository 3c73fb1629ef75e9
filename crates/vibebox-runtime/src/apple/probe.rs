//! Apple-VM availability probe.
//!
//! Three conditions, all of which must hold: the Virtualization
//! framework can construct an EFI boot loader, a code-signing
//! inspection tool exists, and the running binary carries the
//! virtualization entitlement.

use vibebox_core::request::ProbeResult;

/// Entitlement identifier searched for in the signed binary.
pub const VZ_ENTITLEMENT: &str = "com.apple.security.virtualization";

#[cfg(not(target_os = "macos"))]
pub fn probe() -> ProbeResult {
    ProbeResult::unavailable("apple-vm backend is only available on darwin", Vec::new())
}

#[cfg(target_os = "macos")]
pub fn probe() -> ProbeResult {
    use crate::shell::run_host;

    // 1. The framework itself.
    if let Err(reason) = super::vz::efi_boot_loader_supported() {
        return ProbeResult::unavailable(
            reason,
            vec!["apple-vm requires macOS 13+ built against a recent SDK".to_string()],
        );
    }

    // 2. The inspection tool.
    if which::which("codesign").is_err() {
        return ProbeResult::unavailable(
            "codesign not found on PATH",
            vec!["Install the Xcode command line tools: xcode-select --install".to_string()],
        );
    }

    // 3. The entitlement on the running executable.
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            return ProbeResult::unavailable(
                format!("cannot locate the running executable: {}", e),
                Vec::new(),
            );
        }
    };
    match run_host(
        "codesign",
        &["-d", "--entitlements", "-", &exe.to_string_lossy()],
    ) {
        Ok(out) => {
            // The entitlement blob (XML) lands on stdout, diagnostics
            // on stderr; search both.
            let blob = format!(
                "{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
            if out.status.success() && blob.contains(VZ_ENTITLEMENT) {
                ProbeResult::available()
            } else {
                ProbeResult::unavailable(
                    "vibebox binary is missing virtualization entitlement",
                    vec![format!(
                        "Re-sign the binary: codesign --force --sign - --entitlements \
                         vibebox.entitlements {}",
                        exe.display()
                    )],
                )
            }
        }
        Err(e) => ProbeResult::unavailable(format!("codesign failed: {}", e), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(target_os = "macos"))]
    fn test_probe_fails_off_darwin() {
        let result = probe();
        assert!(!result.available);
        assert_eq!(result.reason, "apple-vm backend is only available on darwin");
    }

    #[test]
    fn test_entitlement_identifier() {
        assert_eq!(VZ_ENTITLEMENT, "com.apple.security.virtualization");
    }
}

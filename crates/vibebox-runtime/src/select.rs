use std::collections::BTreeMap;

use anyhow::Result;
use tracing::debug;

use vibebox_core::config::{PROVIDER_APPLE_VM, PROVIDER_AUTO, PROVIDER_DOCKER, PROVIDER_OFF};
use vibebox_core::error::SandboxError;
use vibebox_core::request::{ProbeResult, Selection};

use crate::backend::Backend;

/// Probe every backend unconditionally so diagnostics are always
/// complete, whatever the requested provider.
pub fn probe_all(backends: &[&dyn Backend]) -> BTreeMap<String, ProbeResult> {
    backends
        .iter()
        .map(|b| {
            let probe = b.probe();
            debug!(backend = b.name(), available = probe.available, "probed");
            (b.name().to_string(), probe)
        })
        .collect()
}

/// Apply the selection table to a set of probe results. The requested
/// provider must already be canonical. `host_is_darwin` is injected so
/// the auto rows are testable off-platform.
pub fn decide(
    requested: &str,
    diagnostics: &BTreeMap<String, ProbeResult>,
    host_is_darwin: bool,
) -> Result<Selection> {
    let probe_of = |name: &str| {
        diagnostics.get(name).cloned().unwrap_or_else(|| {
            ProbeResult::unavailable(format!("backend {:?} was not probed", name), Vec::new())
        })
    };

    let selected = |provider: &str, was_fallback: bool, fallback_from: &str| Selection {
        provider: provider.to_string(),
        diagnostics: diagnostics.clone(),
        was_fallback,
        fallback_from: fallback_from.to_string(),
    };

    match requested {
        // Explicit requests fail hard; the service never downgrades a
        // named backend.
        PROVIDER_OFF | PROVIDER_APPLE_VM | PROVIDER_DOCKER => {
            let probe = probe_of(requested);
            if probe.available {
                Ok(selected(requested, false, ""))
            } else {
                Err(SandboxError::Unavailable {
                    name: requested.to_string(),
                    reason: probe.reason,
                    fix_hints: probe.fix_hints,
                }
                .into())
            }
        }
        // Auto never chooses "off"; it must be requested.
        PROVIDER_AUTO => {
            let apple = probe_of(PROVIDER_APPLE_VM);
            let docker = probe_of(PROVIDER_DOCKER);
            if host_is_darwin && apple.available {
                Ok(selected(PROVIDER_APPLE_VM, false, ""))
            } else if docker.available {
                if host_is_darwin {
                    Ok(selected(PROVIDER_DOCKER, true, PROVIDER_APPLE_VM))
                } else {
                    Ok(selected(PROVIDER_DOCKER, false, ""))
                }
            } else {
                Err(SandboxError::AutoFailure {
                    apple_reason: apple.reason,
                    docker_reason: docker.reason,
                }
                .into())
            }
        }
        other => Err(SandboxError::Validation(format!("unknown provider {:?}", other)).into()),
    }
}

/// Is this host darwin?
pub fn host_is_darwin() -> bool {
    cfg!(target_os = "macos")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diags(off: bool, apple: bool, docker: bool) -> BTreeMap<String, ProbeResult> {
        let mut map = BTreeMap::new();
        let entry = |ok: bool, reason: &str| {
            if ok {
                ProbeResult::available()
            } else {
                ProbeResult::unavailable(reason, vec![format!("fix: {}", reason)])
            }
        };
        map.insert("off".to_string(), entry(off, "no bash"));
        map.insert("apple-vm".to_string(), entry(apple, "no entitlement"));
        map.insert("docker".to_string(), entry(docker, "no daemon"));
        map
    }

    #[test]
    fn test_explicit_available_backend_is_selected() {
        for name in ["off", "apple-vm", "docker"] {
            let selection = decide(name, &diags(true, true, true), true).unwrap();
            assert_eq!(selection.provider, name);
            assert!(!selection.was_fallback);
            assert_eq!(selection.diagnostics.len(), 3);
        }
    }

    #[test]
    fn test_explicit_unavailable_backend_fails_hard() {
        // docker available, but apple-vm was asked for: no downgrade.
        let err = decide("apple-vm", &diags(true, false, true), true).unwrap_err();
        match err.downcast_ref::<SandboxError>() {
            Some(SandboxError::Unavailable {
                name,
                reason,
                fix_hints,
            }) => {
                assert_eq!(name, "apple-vm");
                assert_eq!(reason, "no entitlement");
                assert!(!fix_hints.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_auto_prefers_apple_vm_on_darwin() {
        let selection = decide("auto", &diags(true, true, true), true).unwrap();
        assert_eq!(selection.provider, "apple-vm");
        assert!(!selection.was_fallback);
    }

    #[test]
    fn test_auto_falls_back_to_docker_on_darwin() {
        let selection = decide("auto", &diags(true, false, true), true).unwrap();
        assert_eq!(selection.provider, "docker");
        assert!(selection.was_fallback);
        assert_eq!(selection.fallback_from, "apple-vm");
    }

    #[test]
    fn test_auto_on_linux_picks_docker_without_fallback_flag() {
        let selection = decide("auto", &diags(true, false, true), false).unwrap();
        assert_eq!(selection.provider, "docker");
        assert!(!selection.was_fallback);
        assert_eq!(selection.fallback_from, "");
    }

    #[test]
    fn test_auto_never_chooses_off() {
        let err = decide("auto", &diags(true, false, false), true).unwrap_err();
        match err.downcast_ref::<SandboxError>() {
            Some(SandboxError::AutoFailure {
                apple_reason,
                docker_reason,
            }) => {
                assert_eq!(apple_reason, "no entitlement");
                assert_eq!(docker_reason, "no daemon");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_provider_is_a_validation_error() {
        let err = decide("qemu", &diags(true, true, true), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Validation(_))
        ));
    }
}

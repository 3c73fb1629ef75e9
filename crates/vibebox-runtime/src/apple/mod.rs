//! The apple-vm backend: a Virtualization.framework VM booted from the
//! project's instance disk and commanded over its serial console.
//!
//! Each exec (and each interactive start) is one full VM lifecycle; no
//! guest agent, no SSH. On non-darwin hosts the module compiles to a
//! probe-fails stub.

pub mod boot;
pub mod console;
pub mod disk;
pub mod framing;
pub mod probe;
#[cfg(target_os = "macos")]
pub mod vz;

use anyhow::Result;

use vibebox_core::cancel::CancelToken;
use vibebox_core::progress::ProgressFn;
use vibebox_core::request::{ExecRequest, ExecResult, ProbeResult};

use crate::backend::{
    Backend, SessionBackend, SessionHandle, StartIo, merge_session_request,
};
use crate::spec::RuntimeSpec;

pub struct AppleVmBackend;

impl Backend for AppleVmBackend {
    fn name(&self) -> &'static str {
        "apple-vm"
    }

    fn probe(&self) -> ProbeResult {
        probe::probe()
    }

    #[cfg(target_os = "macos")]
    fn prepare(&self, spec: &RuntimeSpec, progress: &ProgressFn, cancel: &CancelToken)
    -> Result<()> {
        driver::ensure_instance_disk(self, spec, progress, cancel)
    }

    #[cfg(not(target_os = "macos"))]
    fn prepare(&self, _spec: &RuntimeSpec, _progress: &ProgressFn, _cancel: &CancelToken)
    -> Result<()> {
        Err(unsupported())
    }

    #[cfg(target_os = "macos")]
    fn exec(
        &self,
        spec: &RuntimeSpec,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        driver::vm_exec(spec, request, cancel)
    }

    #[cfg(not(target_os = "macos"))]
    fn exec(
        &self,
        _spec: &RuntimeSpec,
        _request: &ExecRequest,
        _cancel: &CancelToken,
    ) -> Result<ExecResult> {
        Err(unsupported())
    }

    #[cfg(target_os = "macos")]
    fn start(&self, spec: &RuntimeSpec, io: StartIo, cancel: &CancelToken) -> Result<()> {
        driver::vm_start(spec, io, cancel)
    }

    #[cfg(not(target_os = "macos"))]
    fn start(&self, _spec: &RuntimeSpec, _io: StartIo, _cancel: &CancelToken) -> Result<()> {
        Err(unsupported())
    }

    fn sessions(&self) -> Option<&dyn SessionBackend> {
        Some(self)
    }
}

/// Apple-vm sessions are compatibility-first: the handle carries only
/// defaults and each exec-in-session runs its own VM lifecycle. A
/// future persistent guest agent can reuse this surface unchanged.
impl SessionBackend for AppleVmBackend {
    fn open_session(&self, _spec: &RuntimeSpec) -> Result<SessionHandle> {
        Ok(SessionHandle::default())
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

#[cfg(not(target_os = "macos"))]
fn unsupported() -> anyhow::Error {
    vibebox_core::error::SandboxError::Unavailable {
        name: "apple-vm".to_string(),
        reason: "apple-vm backend is only available on darwin".to_string(),
        fix_hints: Vec::new(),
    }
    .into()
}

#[cfg(target_os = "macos")]
mod driver {
    use std::io::Read;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use objc2_virtualization::VZVirtualMachineState;
    use tracing::{debug, info, warn};

    use vibebox_core::cancel::CancelToken;
    use vibebox_core::error::SandboxError;
    use vibebox_core::paths;
    use vibebox_core::progress::{ProgressEvent, ProgressFn};
    use vibebox_core::request::{ExecRequest, ExecResult};

    use super::boot::{
        BOOT_TIMEOUT, DEFAULT_EXEC_TIMEOUT, LOGIN_PROMPT, LOGIN_TIMEOUT, LOGIN_USER,
        MOUNT_TIMEOUT, POST_LOGIN_TIMEOUT, PROMPT_HINTS, STOP_TIMEOUT, VmPhase, mount_command,
    };
    use super::console::ConsolePump;
    use super::disk::{InstanceLock, PROVISION_TIMEOUT, copy_bytewise, provision_command};
    use super::framing;
    use super::vz::{VzBootConfig, VzMachine};
    use crate::backend::Backend;
    use crate::mounts::{ShareBinding, resolve_guest_cwd, share_bindings, workspace_guest};
    use crate::spec::RuntimeSpec;

    /// Keep a cancellation error as-is; wrap anything else in the
    /// phase-appropriate error kind.
    fn phase_error(err: anyhow::Error, wrap: impl FnOnce(String) -> SandboxError) -> anyhow::Error {
        if matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Cancelled)
        ) {
            err
        } else {
            wrap(err.to_string()).into()
        }
    }

    /// Ensure the per-project instance disk exists, provisioning it on
    /// first creation. An existing disk is never touched, so guest
    /// provisioning survives across runs.
    pub(super) fn ensure_instance_disk(
        backend: &super::AppleVmBackend,
        spec: &RuntimeSpec,
        progress: &ProgressFn,
        cancel: &CancelToken,
    ) -> Result<()> {
        if spec.instance_raw_path.exists() {
            debug!(path = %spec.instance_raw_path.display(), "instance disk present");
            return Ok(());
        }
        if !spec.base_raw_path.exists() {
            return Err(SandboxError::Validation(format!(
                "base image missing at {}; run `vibebox init` first",
                spec.base_raw_path.display()
            ))
            .into());
        }

        let parent = spec
            .instance_raw_path
            .parent()
            .context("instance path has no parent")?;
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755))?;
        }

        (progress)(ProgressEvent::Phase {
            name: "clone instance disk".to_string(),
        });
        copy_bytewise(&spec.base_raw_path, &spec.instance_raw_path, progress, cancel)?;

        if let Some(script) = spec.config.vm.provision_script.clone() {
            (progress)(ProgressEvent::Phase {
                name: "provision instance".to_string(),
            });
            let mut request = ExecRequest::new(provision_command(&script));
            request.timeout = PROVISION_TIMEOUT;

            let outcome = backend.exec(spec, &request, cancel);
            let failed = match &outcome {
                Ok(result) if result.exit_code == 0 => false,
                _ => true,
            };
            if failed {
                // Remove the half-provisioned disk so the next run
                // starts from a clean clone.
                let _ = std::fs::remove_file(&spec.instance_raw_path);
                return match outcome {
                    Ok(result) => Err(anyhow::anyhow!(
                        "provisioning script exited with {}: {}",
                        result.exit_code,
                        framing::tail_chars(&result.stderr, 512)
                    )),
                    Err(e) => Err(e),
                };
            }
            info!("instance provisioned");
        }
        (progress)(ProgressEvent::Done);
        Ok(())
    }

    fn boot_machine(spec: &RuntimeSpec, bindings: &[ShareBinding]) -> Result<VzMachine> {
        VzMachine::build(&VzBootConfig {
            cpus: spec.config.vm.cpus as usize,
            memory_bytes: spec.config.vm.ram_mb as u64 * (1 << 20),
            instance_raw: &spec.instance_raw_path,
            efi_varstore: &paths::efi_varstore_path(&spec.project_root),
            bindings,
        })
    }

    /// Drive constructed→ready: boot, (maybe) login, mount shares.
    fn boot_to_ready(
        machine: &mut VzMachine,
        pump: &mut ConsolePump,
        bindings: &[ShareBinding],
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut phase = VmPhase::Booting;
        debug!(%phase, "vm lifecycle");
        machine
            .start(BOOT_TIMEOUT, cancel)
            .map_err(|e| phase_error(e, SandboxError::Boot))?;
        machine.release_guest_fds();
        phase = VmPhase::Running;
        debug!(%phase, "vm lifecycle");

        phase = VmPhase::LoggingIn;
        debug!(%phase, "vm lifecycle");
        let mut needles: Vec<&str> = vec![LOGIN_PROMPT];
        needles.extend_from_slice(PROMPT_HINTS);
        let matched = pump
            .wait_for_any(&needles, LOGIN_TIMEOUT, cancel)
            .map_err(|e| phase_error(e, SandboxError::LoginTimeout))?;
        if matched == LOGIN_PROMPT {
            pump.send_line(LOGIN_USER)?;
            pump.wait_for_any(PROMPT_HINTS, POST_LOGIN_TIMEOUT, cancel)
                .map_err(|e| phase_error(e, SandboxError::LoginTimeout))?;
        }

        phase = VmPhase::Mounting;
        debug!(%phase, "vm lifecycle");
        pump.send_line(&mount_command(bindings))?;
        pump.wait_for_any(PROMPT_HINTS, MOUNT_TIMEOUT, cancel)
            .map_err(|e| phase_error(e, SandboxError::Mount))?;

        phase = VmPhase::Ready;
        debug!(%phase, "vm lifecycle");
        Ok(())
    }

    /// Graceful→hard shutdown; tolerates everything. Uses a fresh
    /// token so a cancelled invocation still tears the VM down.
    fn shutdown_machine(machine: &VzMachine) {
        let teardown = CancelToken::new();
        if machine
            .wait_for_state(VZVirtualMachineState::Stopped, STOP_TIMEOUT, &teardown)
            .is_ok()
        {
            return;
        }
        if machine.request_stop() {
            if machine
                .wait_for_state(VZVirtualMachineState::Stopped, STOP_TIMEOUT, &teardown)
                .is_ok()
            {
                return;
            }
        }
        warn!("graceful stop failed, forcing");
        machine.force_stop(STOP_TIMEOUT);
    }

    /// One complete non-interactive exec: boot, frame, parse, stop.
    pub(super) fn vm_exec(
        spec: &RuntimeSpec,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        let _disk_lock = InstanceLock::acquire(&paths::instance_lock_path(&spec.project_root))?;

        let bindings = share_bindings(spec);
        let guest_cwd = resolve_guest_cwd(spec, &request.cwd)?;
        let framed = framing::build_exec_command(&request.command, &guest_cwd, &request.env);
        let timeout = if request.timeout == Duration::ZERO {
            DEFAULT_EXEC_TIMEOUT
        } else {
            request.timeout
        };

        let mut machine = boot_machine(spec, &bindings)?;
        let (reader, writer) = machine.take_host_io()?;
        let mut pump = ConsolePump::start(Box::new(reader), Box::new(writer), None);

        let outcome = (|| -> Result<()> {
            boot_to_ready(&mut machine, &mut pump, &bindings, cancel)?;
            pump.send_line(&framed)?;
            // The command ends in poweroff; the exit marker precedes it.
            pump.wait_until(timeout, cancel, framing::has_exit_marker)?;
            Ok(())
        })();

        debug!(phase = %VmPhase::Stopping, "vm lifecycle");
        shutdown_machine(&machine);
        let buffer = pump.snapshot();
        pump.shutdown();
        debug!(phase = %VmPhase::Stopped, "vm lifecycle");

        outcome?;
        framing::parse_exec_output(&buffer)
    }

    /// Interactive start: boot to ready, cd into the workspace, then
    /// pipe host stdin to the guest while the pump tees guest output
    /// to host stdout. EOF on stdin sends `exit`.
    pub(super) fn vm_start(
        spec: &RuntimeSpec,
        io: crate::backend::StartIo,
        cancel: &CancelToken,
    ) -> Result<()> {
        let _disk_lock = InstanceLock::acquire(&paths::instance_lock_path(&spec.project_root))?;

        let bindings = share_bindings(spec);
        let workspace = workspace_guest(spec);

        let mut machine = boot_machine(spec, &bindings)?;
        let (reader, writer) = machine.take_host_io()?;
        let mut pump = ConsolePump::start(Box::new(reader), Box::new(writer), Some(io.stdout));

        let outcome = (|| -> Result<()> {
            boot_to_ready(&mut machine, &mut pump, &bindings, cancel)?;
            pump.send_line(&format!("cd '{}'", framing::shell_escape(&workspace)))?;
            pump.wait_for_any(PROMPT_HINTS, POST_LOGIN_TIMEOUT, cancel)?;

            let mut stdin = io.stdin;
            let mut buf = [0u8; 4096];
            loop {
                cancel.check()?;
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => pump.send_raw(&buf[..n])?,
                }
            }
            pump.send_line("exit")?;
            Ok(())
        })();

        shutdown_machine(&machine);
        pump.shutdown();
        outcome
    }
}

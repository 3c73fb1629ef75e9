//! Instance disk management: the per-project mutable clone of the
//! cached base image, and the advisory lock that serializes VM
//! ownership of it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::info;

use vibebox_core::cancel::CancelToken;
use vibebox_core::progress::{ProgressFn, TransferReporter};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Heredoc terminator for the provisioning script.
const PROVISION_EOF: &str = "VIBEBOX_PROVISION_EOF";
/// Guest path the provisioning script is written to.
pub const PROVISION_SCRIPT_PATH: &str = "/tmp/vibebox-provision.sh";
/// Provisioning command deadline.
pub const PROVISION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45 * 60);

/// Copy `src` to `dst` bytewise, fsyncing at the end. Plain copy, no
/// sparsification or reflink.
pub fn copy_bytewise(
    src: &Path,
    dst: &Path,
    progress: &ProgressFn,
    cancel: &CancelToken,
) -> Result<()> {
    let mut reader =
        File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let total = reader.metadata()?.len();
    let mut writer =
        File::create(dst).with_context(|| format!("Failed to create {}", dst.display()))?;

    let mut reporter = TransferReporter::new(progress.clone(), 0, total);
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        reporter.add(n as u64);
    }
    writer.sync_all()?;
    reporter.finish();
    info!(src = %src.display(), dst = %dst.display(), bytes = total, "disk cloned");
    Ok(())
}

/// The command run (through the normal exec path) to provision a fresh
/// instance disk: heredoc the script into the guest, then run it under
/// bash with poweroff suppressed inside the script itself.
pub fn provision_command(script: &str) -> String {
    format!(
        "cat > {path} <<'{eof}'\n{script}\n{eof}\nVIBEBOX_PROVISION_POWEROFF=0 /bin/bash {path}",
        path = PROVISION_SCRIPT_PATH,
        eof = PROVISION_EOF,
        script = script,
    )
}

/// Exclusive advisory lock on the instance disk. Exactly one VM may
/// own the disk at a time; a second invocation against the same
/// project fails fast instead of corrupting it.
pub struct InstanceLock {
    file: File,
}

impl InstanceLock {
    /// The lock file itself is left in place; only the flock matters.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "another vibebox VM already owns this project's instance disk ({})",
                path.display()
            );
        }
        Ok(Self { file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vibebox_core::progress::noop_progress;

    #[test]
    fn test_copy_bytewise_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.raw");
        let dst = dir.path().join("instance.raw");
        let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();
        std::fs::write(&src, &payload).unwrap();

        copy_bytewise(&src, &dst, &noop_progress(), &CancelToken::new()).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), payload);
    }

    #[test]
    fn test_copy_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.raw");
        std::fs::write(&src, b"data").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(
            copy_bytewise(
                &src,
                &dir.path().join("instance.raw"),
                &noop_progress(),
                &cancel
            )
            .is_err()
        );
    }

    #[test]
    fn test_provision_command_heredocs_the_script() {
        let cmd = provision_command("apt-get update\napt-get install -y git");
        assert!(cmd.starts_with("cat > /tmp/vibebox-provision.sh <<'VIBEBOX_PROVISION_EOF'\n"));
        assert!(cmd.contains("apt-get install -y git\n"));
        assert!(cmd.ends_with("VIBEBOX_PROVISION_POWEROFF=0 /bin/bash /tmp/vibebox-provision.sh"));
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        let held = InstanceLock::acquire(&path).unwrap();
        assert!(InstanceLock::acquire(&path).is_err());
        drop(held);
        // Released on drop.
        let _again = InstanceLock::acquire(&path).unwrap();
    }
}

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use vibebox_core::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extract exactly one named member from a tar-style archive into
/// `dest` using the host `tar` binary (`tar -xOf <archive> <member>`,
/// stdout redirected). The partial output file is removed on failure.
pub fn extract_member(
    archive: &Path,
    member: &str,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    info!(archive = %archive.display(), member, dest = %dest.display(), "extracting");

    let out = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let result = run_tar(archive, member, out, cancel);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn run_tar(archive: &Path, member: &str, out: std::fs::File, cancel: &CancelToken) -> Result<()> {
    let mut child = Command::new("tar")
        .arg("-xOf")
        .arg(archive)
        .arg(member)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to run tar; is it installed?")?;

    // Poll so cancellation can kill the child.
    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            cancel.check()?;
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => std::thread::sleep(POLL_INTERVAL),
        }
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            use std::io::Read;
            let _ = pipe.read_to_string(&mut stderr);
        }
        bail!(
            "tar failed to extract {:?} from {} (exit {}): {}",
            member,
            archive.display(),
            status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Build a .tar.gz holding the given (name, contents) members.
    fn fixture_archive(dir: &Path, members: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join("fixture.tar.gz");
        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_extracts_the_named_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture_archive(
            dir.path(),
            &[("README", b"nope"), ("disk.raw", b"raw disk bytes")],
        );
        let dest = dir.path().join("base.raw");

        extract_member(&archive, "disk.raw", &dest, &CancelToken::new()).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"raw disk bytes");
    }

    #[test]
    fn test_missing_member_cleans_up_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let archive = fixture_archive(dir.path(), &[("disk.raw", b"raw disk bytes")]);
        let dest = dir.path().join("base.raw");

        let err = extract_member(&archive, "no-such-member", &dest, &CancelToken::new());
        assert!(err.is_err());
        assert!(!dest.exists());
    }
}

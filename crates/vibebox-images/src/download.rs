use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use vibebox_core::cancel::CancelToken;
use vibebox_core::error::SandboxError;
use vibebox_core::progress::{ProgressFn, TransferReporter};

const READ_BUF_SIZE: usize = 64 * 1024;
/// Per-read socket timeout. The overall transfer is unbounded; stalls
/// longer than this fail the request and leave the file resumable.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Download `url` into `dest`, resuming from whatever is already on
/// disk. Status 200 restarts from byte zero, 206 appends; anything else
/// is a hard failure carrying the server's status line.
///
/// `total_hint` is the expected final size (0 = unknown); it feeds the
/// progress reporter only.
pub fn fetch_resumable(
    url: &str,
    dest: &Path,
    total_hint: u64,
    progress: &ProgressFn,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    let mut existing = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);

    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .read_timeout(READ_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let mut request = client.get(url);
    if existing > 0 {
        debug!(existing, url, "resuming download");
        request = request.header(reqwest::header::RANGE, format!("bytes={}-", existing));
    }

    let mut response = request
        .send()
        .map_err(|e| SandboxError::Download(format!("GET {}: {}", url, e)))?;

    let file = match response.status().as_u16() {
        // Full body: rewrite from byte zero.
        200 => {
            existing = 0;
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(dest)
                .with_context(|| format!("Failed to open {}", dest.display()))?
        }
        // Partial body: append to what we have.
        206 => OpenOptions::new()
            .append(true)
            .create(true)
            .open(dest)
            .with_context(|| format!("Failed to open {}", dest.display()))?,
        _ => {
            return Err(SandboxError::Download(format!(
                "GET {}: unexpected status {}",
                url,
                response.status()
            ))
            .into());
        }
    };

    let total = if total_hint > 0 {
        total_hint
    } else {
        existing + response.content_length().unwrap_or(0)
    };

    let mut writer = std::io::BufWriter::new(file);
    let mut reporter = TransferReporter::new(progress.clone(), existing, total);
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        cancel.check()?;
        let n = response
            .read(&mut buf)
            .map_err(|e| SandboxError::Download(format!("GET {}: read: {}", url, e)))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        reporter.add(n as u64);
    }
    writer.flush()?;
    reporter.finish();

    info!(url, bytes = reporter.done(), "download complete");
    Ok(())
}

/// Streaming sha256 of a file, as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a file against an expected digest (case-insensitive hex).
/// On mismatch the file is removed and `SandboxError::Integrity` is
/// returned so the caller must re-download.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove corrupt {}", path.display()))?;
        return Err(SandboxError::Integrity {
            path: path.display().to_string(),
            expected: expected.to_lowercase(),
            actual,
        }
        .into());
    }
    Ok(())
}

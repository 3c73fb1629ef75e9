//! Serial console pump: the single channel into the guest.
//!
//! One reader thread blocks on the guest-output pipe and appends to a
//! shared buffer; waiters poll snapshots of that buffer for needle
//! substrings. No line discipline is assumed on the console.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::trace;

use vibebox_core::cancel::CancelToken;
use vibebox_core::error::SandboxError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_BUF_SIZE: usize = 4096;

pub struct ConsolePump {
    buffer: Arc<Mutex<Vec<u8>>>,
    writer: Box<dyn Write + Send>,
    reader_handle: Option<JoinHandle<()>>,
}

impl ConsolePump {
    /// Spawn the reader loop over the guest-output stream. Every chunk
    /// is forwarded to `tee` (interactive mode) before buffering. The
    /// loop exits cleanly on EOF or read error (closed pipe).
    pub fn start(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        tee: Option<Box<dyn Write + Send>>,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let shared = buffer.clone();
        let handle = std::thread::spawn(move || {
            let mut reader = reader;
            let mut tee = tee;
            let mut chunk = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Some(ref mut tee) = tee {
                            let _ = tee.write_all(&chunk[..n]);
                            let _ = tee.flush();
                        }
                        shared.lock().unwrap().extend_from_slice(&chunk[..n]);
                    }
                }
            }
            trace!("console reader loop ended");
        });
        Self {
            buffer,
            writer,
            reader_handle: Some(handle),
        }
    }

    /// Write a line to guest stdin.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .context("console write failed")?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Write raw bytes to guest stdin (interactive piping).
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).context("console write failed")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Lossy snapshot of everything the guest has written so far.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    /// Poll the buffer at 100 ms granularity until one of the needles
    /// appears (substring match over the whole aggregated stream),
    /// returning the first needle found. Times out with
    /// `SandboxError::Timeout`.
    pub fn wait_for_any(
        &self,
        needles: &[&str],
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<String> {
        let started = Instant::now();
        loop {
            cancel.check()?;
            let snap = self.snapshot();
            for needle in needles {
                if snap.contains(needle) {
                    return Ok(needle.to_string());
                }
            }
            if started.elapsed() > deadline {
                return Err(SandboxError::Timeout(format!(
                    "no match for {:?} within {}s",
                    needles,
                    deadline.as_secs()
                ))
                .into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Poll the buffer at 100 ms granularity until the predicate
    /// accepts a snapshot. Same timeout semantics as `wait_for_any`.
    pub fn wait_until(
        &self,
        deadline: Duration,
        cancel: &CancelToken,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            cancel.check()?;
            if predicate(&self.snapshot()) {
                return Ok(());
            }
            if started.elapsed() > deadline {
                return Err(SandboxError::Timeout(format!(
                    "console output condition not met within {}s",
                    deadline.as_secs()
                ))
                .into());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drop the writer (guest sees EOF on its stdin) and join the
    /// reader once the guest side closes.
    pub fn shutdown(self) {
        let Self {
            writer,
            reader_handle,
            ..
        } = self;
        drop(writer);
        if let Some(handle) = reader_handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Shared Vec writer for observing pump output in tests.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reader_fills_buffer_until_eof() {
        let pump = ConsolePump::start(
            Box::new(Cursor::new(b"ubuntu login: ".to_vec())),
            Box::new(SharedSink::default()),
            None,
        );
        let found = pump
            .wait_for_any(&["login: "], Duration::from_secs(2), &CancelToken::new())
            .unwrap();
        assert_eq!(found, "login: ");
        pump.shutdown();
    }

    #[test]
    fn test_wait_returns_first_matching_needle() {
        let pump = ConsolePump::start(
            Box::new(Cursor::new(b"root@box:~# ".to_vec())),
            Box::new(SharedSink::default()),
            None,
        );
        let found = pump
            .wait_for_any(
                &["login: ", ":~# "],
                Duration::from_secs(2),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(found, ":~# ");
        pump.shutdown();
    }

    #[test]
    fn test_wait_times_out() {
        let pump = ConsolePump::start(
            Box::new(Cursor::new(b"nothing useful".to_vec())),
            Box::new(SharedSink::default()),
            None,
        );
        let err = pump
            .wait_for_any(&["login: "], Duration::from_millis(150), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Timeout(_))
        ));
        pump.shutdown();
    }

    #[test]
    fn test_wait_honors_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let pump = ConsolePump::start(
            Box::new(Cursor::new(Vec::new())),
            Box::new(SharedSink::default()),
            None,
        );
        let err = pump
            .wait_for_any(&["login: "], Duration::from_secs(5), &cancel)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Cancelled)
        ));
        pump.shutdown();
    }

    #[test]
    fn test_tee_receives_chunks_before_buffering() {
        let tee = SharedSink::default();
        let observed = tee.clone();
        let pump = ConsolePump::start(
            Box::new(Cursor::new(b"guest output".to_vec())),
            Box::new(SharedSink::default()),
            Some(Box::new(tee)),
        );
        pump.wait_for_any(&["guest output"], Duration::from_secs(2), &CancelToken::new())
            .unwrap();
        assert_eq!(&*observed.0.lock().unwrap(), b"guest output");
        pump.shutdown();
    }

    #[test]
    fn test_send_line_appends_newline() {
        let sink = SharedSink::default();
        let observed = sink.clone();
        let mut pump = ConsolePump::start(
            Box::new(Cursor::new(Vec::new())),
            Box::new(sink),
            None,
        );
        pump.send_line("root").unwrap();
        assert_eq!(&*observed.0.lock().unwrap(), b"root\n");
        pump.shutdown();
    }
}

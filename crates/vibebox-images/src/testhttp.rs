//! Minimal single-purpose HTTP stub for download tests. Serves one
//! fixed body with Range support (200/206) on a loopback listener.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

pub(crate) struct StubServer {
    port: u16,
    // Held so the accept loop ends when the test drops the server.
    _handle: thread::JoinHandle<()>,
}

impl StubServer {
    /// Serve `body` at every path, honoring `Range: bytes=<n>-`.
    pub(crate) fn serve(body: Vec<u8>) -> Self {
        Self::spawn(move |stream, range| respond_with_body(stream, &body, range))
    }

    /// Respond 404 to everything.
    pub(crate) fn not_found() -> Self {
        Self::spawn(|stream, _range| {
            let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        })
    }

    fn spawn(handler: impl Fn(&mut TcpStream, Option<u64>) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let range = read_request_range(&mut stream);
                handler(&mut stream, range);
            }
        });
        Self {
            port,
            _handle: handle,
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}

/// Consume the request head and return the Range start offset, if any.
fn read_request_range(stream: &mut TcpStream) -> Option<u64> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("range: bytes=") {
            range = rest.trim().trim_end_matches('-').parse::<u64>().ok();
        }
    }
    range
}

fn respond_with_body(stream: &mut TcpStream, body: &[u8], range: Option<u64>) {
    match range {
        Some(start) if start > 0 && (start as usize) < body.len() => {
            let tail = &body[start as usize..];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                tail.len(),
                start,
                body.len() - 1,
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(tail);
        }
        _ => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(body);
        }
    }
    let _ = stream.flush();
}

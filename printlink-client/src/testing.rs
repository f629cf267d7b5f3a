//! A fake printer for tests.
//!
//! Listens on `127.0.0.1:0`, serves one connection at a time and answers the
//! commands this client sends with the frames a real printer would.

use bytes::BytesMut;
use parking_lot::Mutex;
use printlink_protocol::frame::wrap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the fake printer treats its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Answer every recognised command.
    Reply,
    /// Record what arrives, never answer.
    Silent,
    /// Reset the first connection on accept, then answer like `Reply`.
    ResetFirst,
}

#[derive(Default)]
struct Shared {
    received: Mutex<Vec<u8>>,
    connections: AtomicUsize,
}

pub(crate) struct FakePrinter {
    addr: SocketAddr,
    shared: Arc<Shared>,
    push_tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl FakePrinter {
    pub(crate) async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(listener, mode, shared.clone(), push_rx));
        Self {
            addr,
            shared,
            push_tx,
            task,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every byte received so far, across connections.
    pub(crate) fn received(&self) -> Vec<u8> {
        self.shared.received.lock().clone()
    }

    /// Number of connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Sends an unsolicited frame on the current connection.
    pub(crate) fn push(&self, body: &str) {
        let _ = self.push_tx.send(body.to_string());
    }

    /// Waits until `count` connections were accepted.
    pub(crate) async fn wait_for_connections(&self, count: usize) {
        while self.connections() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for FakePrinter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    listener: TcpListener,
    mode: Mode,
    shared: Arc<Shared>,
    mut push_rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let accepted = shared.connections.fetch_add(1, Ordering::SeqCst) + 1;

        if mode == Mode::ResetFirst && accepted == 1 {
            reset(stream);
            continue;
        }
        serve(stream, mode, &shared, &mut push_rx).await;
    }
}

#[allow(deprecated)]
fn reset(stream: TcpStream) {
    let _ = stream.set_linger(Some(Duration::ZERO));
    drop(stream);
}

async fn serve(
    mut stream: TcpStream,
    mode: Mode,
    shared: &Shared,
    push_rx: &mut mpsc::UnboundedReceiver<String>,
) {
    let mut session = Session::default();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                shared.received.lock().extend_from_slice(&buf[..n]);

                let replies = session.feed(&buf[..n]);
                if mode == Mode::Silent {
                    continue;
                }
                for body in replies {
                    if stream.write_all(&framed(&body)).await.is_err() {
                        return;
                    }
                }
            }
            Some(body) = push_rx.recv() => {
                if stream.write_all(&framed(&body)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Printer-side parser: framed commands, plus raw data after `filestart`.
#[derive(Default)]
struct Session {
    buffer: Vec<u8>,
    upload_remaining: u64,
    z_offset: f64,
}

impl Session {
    fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut replies = Vec::new();

        loop {
            if self.upload_remaining > 0 {
                let take = self.buffer.len().min(self.upload_remaining as usize);
                if take == 0 {
                    break;
                }
                self.buffer.drain(..take);
                self.upload_remaining -= take as u64;
                if self.upload_remaining == 0 {
                    replies.push("filepercent:100".to_string());
                    replies.push("fend;".to_string());
                }
                continue;
            }

            let Some(start) = find(&self.buffer, b"@#") else {
                break;
            };
            let Some(len) = find(&self.buffer[start + 2..], b"#@") else {
                break;
            };
            let body = String::from_utf8_lossy(&self.buffer[start + 2..start + 2 + len]).into_owned();
            self.buffer.drain(..start + len + 4);

            if let Some(reply) = self.respond(&body) {
                replies.push(reply);
            }
        }
        replies
    }

    fn respond(&mut self, body: &str) -> Option<String> {
        if body == "GetZOffsetValue;" {
            return Some(format!("ZOffsetValue:{:.2}", self.z_offset));
        }
        if let Some(value) = body.strip_prefix("extruderminoffset:") {
            self.z_offset = value.trim_end_matches(';').parse().ok()?;
            return Some(format!("ZOffsetValue:{:.2}", self.z_offset));
        }
        if body.starts_with("gcode:") {
            return Some("gcodedone;".to_string());
        }
        if let Some(rest) = body.strip_prefix("filestart;") {
            let size = rest.split(';').next()?.parse().ok()?;
            self.upload_remaining = size;
            return (size == 0).then(|| "fend;".to_string());
        }
        if let Some(name) = body.strip_prefix("startprint;fn:") {
            return Some(format!("printstartsuccess;fn:{}", name.trim_end_matches(';')));
        }
        if let Some(position) = body.strip_prefix("setcurposition:") {
            return Some(format!("curposition:{position}"));
        }
        match body {
            "stop;" => Some("stopped;".to_string()),
            "getprinterinfor;" => {
                Some("getprinterinfor;id:FAKE01;state:0;modelprinting:none;".to_string())
            }
            _ => None,
        }
    }
}

fn framed(body: &str) -> BytesMut {
    let mut out = BytesMut::new();
    wrap(body.as_bytes(), &mut out);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

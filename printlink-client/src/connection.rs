//! Connection management.
//!
//! A [`Connection`] owns one TCP socket to the printer and exposes plain
//! [`send`](Connection::send) / [`receive`](Connection::receive) calls. When
//! either hits a transient socket error, the connection reconnects to the same
//! endpoint behind the same call, so callers never see the swap. Reconnects
//! are serialized, bounded and separated by a fixed backoff.
//!
//! Sends and receives are not serialized against each other outside of a
//! reconnect. Callers that write from several tasks must sequence their
//! writes themselves, or two commands' bytes may interleave on the wire.

use crate::error::ClientError;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default pause before each reconnect attempt.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Printer address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout applied to one-shot requests. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Reconnect attempts allowed between two successful I/O operations.
    pub max_reconnect_attempts: u32,
    /// Pause before each reconnect attempt.
    pub reconnect_backoff: Duration,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }
}

/// A resilient connection to the printer.
pub struct Connection {
    config: ConnectionConfig,
    /// Current socket. `None` before connect, after close, and while a
    /// reconnect is in progress.
    stream: parking_lot::Mutex<Option<Arc<TcpStream>>>,
    /// Bumped every time the socket is replaced or dropped.
    generation: watch::Sender<u64>,
    /// Reconnect attempts since the last successful I/O.
    attempts: AtomicU32,
    /// Held for the whole reconnect critical section.
    reconnect_lock: Mutex<()>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            config,
            stream: parking_lot::Mutex::new(None),
            generation,
            attempts: AtomicU32::new(0),
            reconnect_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the printer.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);
        let stream = self.open().await.map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            if e.kind() == io::ErrorKind::TimedOut {
                ClientError::Timeout
            } else {
                ClientError::Io(e)
            }
        })?;

        self.install(stream);
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("Connected to {}", self.config.addr);
        Ok(())
    }

    /// Reads available bytes into `buf`, reconnecting on transient errors.
    ///
    /// Returns `Ok(0)` when the printer closed the connection.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, ClientError> {
        self.receive_tagged(buf).await.map(|(n, _)| n)
    }

    /// Like [`receive`](Self::receive), also returning the generation of the
    /// socket the bytes came from. The generation changes on every reconnect.
    pub async fn receive_tagged(&self, buf: &mut [u8]) -> Result<(usize, u64), ClientError> {
        loop {
            let (stream, generation) = self.acquire().await?;
            let mut replaced = self.generation.subscribe();

            let result = tokio::select! {
                result = read_some(&stream, buf) => result,
                // The socket was swapped or closed underneath this read.
                _ = replaced.changed() => continue,
            };

            match result {
                Ok(0) => return Ok((0, generation)),
                Ok(n) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return Ok((n, generation));
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("Receive failed ({}), reconnecting", e);
                    self.recover(generation, e).await?;
                }
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
    }

    /// Writes some bytes of `buf`, reconnecting on transient errors.
    pub async fn send(&self, buf: &[u8]) -> Result<usize, ClientError> {
        loop {
            let (stream, generation) = self.acquire().await?;

            match write_some(&stream, buf).await {
                Ok(n) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return Ok(n);
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("Send failed ({}), reconnecting", e);
                    self.recover(generation, e).await?;
                }
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
    }

    /// Writes all of `buf`.
    ///
    /// A reconnect in the middle of the buffer resumes with the unwritten
    /// remainder on the new socket.
    pub async fn send_all(&self, mut buf: &[u8]) -> Result<(), ClientError> {
        while !buf.is_empty() {
            let n = self.send(buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Reconnect attempts made since the last successful I/O.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Closes the connection. Blocked receives return
    /// [`ClientError::ConnectionClosed`].
    pub fn close(&self) {
        tracing::debug!("Closing connection...");
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let stream = self.stream.lock().take();
        self.generation.send_modify(|g| *g += 1);
        drop(stream);
        tracing::debug!("Connection closed");
    }

    async fn open(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    fn install(&self, stream: TcpStream) {
        let mut current = self.stream.lock();
        *current = Some(Arc::new(stream));
        self.generation.send_modify(|g| *g += 1);
    }

    /// Returns the socket generation, bumped on every connect, reconnect
    /// and close.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Returns the current socket and its generation.
    ///
    /// An empty slot while connected means a reconnect is running or was
    /// abandoned by a cancelled caller; either way this call joins or
    /// resumes it.
    async fn acquire(&self) -> Result<(Arc<TcpStream>, u64), ClientError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::ConnectionClosed);
            }
            if !self.is_connected() {
                return Err(ClientError::NotConnected);
            }
            let generation = {
                let current = self.stream.lock();
                let generation = self.generation();
                if let Some(stream) = current.as_ref() {
                    return Ok((stream.clone(), generation));
                }
                generation
            };
            let cause = io::Error::new(io::ErrorKind::NotConnected, "reconnect interrupted");
            self.recover(generation, cause).await?;
        }
    }

    /// Replaces the socket that failed at `generation`.
    ///
    /// If another caller already replaced it, returns immediately so the
    /// failed operation retries on the new socket. Dropping the returned
    /// future leaves the slot empty; the next [`acquire`](Self::acquire)
    /// picks the reconnect up again.
    async fn recover(&self, generation: u64, cause: io::Error) -> Result<(), ClientError> {
        let _guard = self.reconnect_lock.lock().await;
        if *self.generation.borrow() != generation || !self.is_connected() {
            return Ok(());
        }

        let max = self.config.max_reconnect_attempts;
        let mut last_error = cause;
        loop {
            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= max {
                tracing::warn!(
                    "Giving up on {} after {} reconnect attempts",
                    self.config.addr,
                    attempt
                );
                self.connected.store(false, Ordering::SeqCst);
                self.stream.lock().take();
                self.generation.send_modify(|g| *g += 1);
                return Err(ClientError::ReconnectExhausted {
                    attempts: attempt,
                    source: last_error,
                });
            }

            self.attempts.store(attempt + 1, Ordering::SeqCst);
            self.stream.lock().take();
            tokio::time::sleep(self.config.reconnect_backoff).await;

            tracing::info!(
                "Reconnecting to {} (attempt {}/{})",
                self.config.addr,
                attempt + 1,
                max
            );
            match self.open().await {
                Ok(stream) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(ClientError::ConnectionClosed);
                    }
                    self.install(stream);
                    tracing::info!("Reconnected to {}", self.config.addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("Reconnect attempt failed: {}", e);
                    last_error = e;
                }
            }
        }
    }
}

/// Errors after which reconnecting to the same endpoint may help.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

async fn read_some(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_some(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    loop {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

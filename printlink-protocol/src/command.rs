//! Outgoing command encoding.
//!
//! Commands are written as framed text (`@#<body>#@`). A [`CommandChain`]
//! batches several commands into one write, or hands them out one chunk at a
//! time. A [`FileUpload`] produces a framed preamble followed by raw file data
//! in fixed-size chunks.

use crate::error::ProtocolError;
use crate::frame::{FRAME_END, FRAME_START};
use crate::UPLOAD_CHUNK_SIZE;
use bytes::{Bytes, BytesMut};
use std::fmt::{self, Write as _};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Default capacity of a command chain buffer (4 KiB).
pub const DEFAULT_CHAIN_CAPACITY: usize = 4 * 1024;

/// A command sent to the printer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `GetZOffsetValue;`
    GetZOffset,
    /// `extruderminoffset:<value>;` with two decimals.
    SetZOffset(f64),
    /// `gcode:<line>\n<line>;`
    GCode(Vec<String>),
    /// `startprint;fn:<name>;`
    StartPrint(String),
    /// `stop;`
    StopPrint,
    /// `getprinterinfor;`
    GetPrinterInfo,
    /// `setcurposition:<x>;<y>;<z>;` with two decimals.
    SetPosition { x: f64, y: f64, z: f64 },
    /// `filestart;<size>;<name>;`, announcing raw file data.
    FileStart { size: u64, name: String },
}

impl Command {
    /// Appends the framed command to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.extend_from_slice(&FRAME_START);
        // Writing into a BytesMut only grows it; it cannot fail.
        let _ = write!(out, "{self}");
        out.extend_from_slice(&FRAME_END);
    }

    /// Encodes the framed command into a new buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64);
        self.encode_into(&mut out);
        out.freeze()
    }
}

/// Writes the unframed body.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetZOffset => write!(f, "GetZOffsetValue;"),
            Command::SetZOffset(value) => write!(f, "extruderminoffset:{value:.2};"),
            Command::GCode(lines) => write!(f, "gcode:{};", lines.join("\n")),
            Command::StartPrint(name) => write!(f, "startprint;fn:{name};"),
            Command::StopPrint => write!(f, "stop;"),
            Command::GetPrinterInfo => write!(f, "getprinterinfor;"),
            Command::SetPosition { x, y, z } => write!(f, "setcurposition:{x:.2};{y:.2};{z:.2};"),
            Command::FileStart { size, name } => write!(f, "filestart;{size};{name};"),
        }
    }
}

/// An ordered batch of commands sharing one fixed-capacity buffer.
#[derive(Debug)]
pub struct CommandChain {
    commands: Vec<Command>,
    buffer: BytesMut,
    capacity: usize,
}

impl CommandChain {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHAIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::new(),
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a command to the chain.
    pub fn push(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Encodes every command, in order, into one contiguous buffer.
    pub fn encode(&mut self) -> Result<Bytes, ProtocolError> {
        self.buffer.clear();
        for command in &self.commands {
            command.encode_into(&mut self.buffer);
            if self.buffer.len() > self.capacity {
                let size = self.buffer.len();
                self.buffer.clear();
                return Err(ProtocolError::CommandTooLarge {
                    size,
                    capacity: self.capacity,
                });
            }
        }
        Ok(self.buffer.split().freeze())
    }

    /// Lazily encodes each command as its own chunk, in order.
    pub fn chunks(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        let buffer = &mut self.buffer;
        self.commands.iter().map(move |command| {
            command.encode_into(buffer);
            buffer.split().freeze()
        })
    }
}

impl Default for CommandChain {
    fn default() -> Self {
        Self::new()
    }
}

/// A file being uploaded in fixed-size chunks.
///
/// Chunks are read into one reusable buffer. Once the caller drops a chunk,
/// the next read reclaims its allocation instead of allocating again.
#[derive(Debug)]
pub struct FileUpload {
    file: File,
    name: String,
    size: u64,
    sent: u64,
    chunk_size: usize,
    buffer: BytesMut,
}

impl FileUpload {
    /// Opens `path` and measures it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        Self::open_with_chunk_size(path, UPLOAD_CHUNK_SIZE).await
    }

    pub async fn open_with_chunk_size(
        path: impl AsRef<Path>,
        chunk_size: usize,
    ) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let name = upload_name(path)?;
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();

        Ok(Self {
            file,
            name,
            size,
            sent: 0,
            chunk_size: chunk_size.max(1),
            buffer: BytesMut::with_capacity(chunk_size),
        })
    }

    /// File name announced to the printer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of data chunks the file splits into.
    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size as u64)
    }

    /// Returns the framed `filestart` announcement.
    pub fn preamble(&self) -> Bytes {
        Command::FileStart {
            size: self.size,
            name: self.name.clone(),
        }
        .encode()
    }

    /// Reads the next data chunk, or `None` once the whole file was read.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let remaining = self.size - self.sent;
        if remaining == 0 {
            return Ok(None);
        }

        let len = remaining.min(self.chunk_size as u64) as usize;
        self.buffer.clear();
        self.buffer.resize(len, 0);

        if let Err(e) = self.file.read_exact(&mut self.buffer[..]).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(ProtocolError::UploadTruncated {
                    expected: self.size,
                    actual: self.sent,
                });
            }
            return Err(e.into());
        }

        self.sent += len as u64;
        Ok(Some(self.buffer.split().freeze()))
    }
}

fn upload_name(path: &Path) -> Result<String, ProtocolError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ProtocolError::InvalidFileName(path.display().to_string()))?;

    // The name travels inside a ';'-delimited framed body.
    if name.contains(';') || name.contains("#@") {
        return Err(ProtocolError::InvalidFileName(name.to_string()));
    }
    Ok(name.to_string())
}

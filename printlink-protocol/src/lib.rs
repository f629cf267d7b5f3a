//! # printlink-protocol
//!
//! Wire protocol implementation for the printer's text protocol.
//!
//! This crate provides:
//! - Marker framing (`@#<body>#@`) over a streaming byte source
//! - Schema-driven positional decoding of message bodies into typed records
//! - Command encoding, command chains and chunked file uploads

pub mod command;
pub mod error;
pub mod frame;
pub mod record;
pub mod schema;

pub use command::{Command, CommandChain, FileUpload};
pub use error::ProtocolError;
pub use frame::{FrameScanner, FRAME_END, FRAME_START};
pub use record::{
    FilePercentRecord, GCodeDoneRecord, PositionRecord, PrintStartRecord, PrintStopRecord,
    PrinterInfoRecord, Record, StateRecord, UploadRecord, ZOffsetRecord,
};
pub use schema::{Schema, SchemaBuilder};

/// Maximum body size accepted between two markers (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of each raw data chunk written during a file upload (20 KiB).
pub const UPLOAD_CHUNK_SIZE: usize = 20 * 1024;

//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors raised while encoding commands or preparing uploads.
///
/// Decoding never fails with an error: a body that does not match a schema
/// produces a record whose success flag is false.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command chain too large: {size} bytes (capacity {capacity})")]
    CommandTooLarge { size: usize, capacity: usize },

    #[error("invalid upload file name: {0}")]
    InvalidFileName(String),

    #[error("upload file changed size: expected {expected} bytes, read {actual}")]
    UploadTruncated { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

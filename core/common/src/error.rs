//! Common error types for vaultferry.

use std::io;
use thiserror::Error;

/// Top-level error type for storage and transfer operations.
///
/// Every adapter maps its client's failures onto these kinds with a fixed,
/// shallow mapping. Nothing is retried at this layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Object or file is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The configured credential lacks permission.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Transport or I/O error while reading.
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Transport or I/O error while writing.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Session or handshake could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Null or empty required parameter.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Wiring or client construction failed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Cryptographic transform failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of a transfer an I/O error happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

impl Error {
    /// Map an I/O error onto the taxonomy.
    ///
    /// An error that was wrapped with [`Error::into_io`] further upstream
    /// (a failing transform behind a reader, for example) is unwrapped and
    /// returned as-is rather than being re-labelled. A lookup that runs
    /// into a regular file where a directory is expected (`a.txt/b` with
    /// `a.txt` a file) reads as `NotFound`.
    pub fn from_io(err: io::Error, context: impl AsRef<str>, direction: IoDirection) -> Self {
        let kind = err.kind();
        let err = match err.into_inner() {
            Some(inner) => match inner.downcast::<Error>() {
                Ok(ours) => return *ours,
                Err(other) => io::Error::new(kind, other),
            },
            None => io::Error::from(kind),
        };

        let message = format!("{}: {}", context.as_ref(), err);
        match kind {
            io::ErrorKind::NotFound => Error::NotFound(message),
            io::ErrorKind::NotADirectory if direction == IoDirection::Read => Error::NotFound(message),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(message),
            _ => match direction {
                IoDirection::Read => Error::ReadFailed(message),
                IoDirection::Write => Error::WriteFailed(message),
            },
        }
    }

    /// Wrap this error so it can travel through `Read`/`AsyncRead` adapters.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::NotFound(_) => io::ErrorKind::NotFound,
            Error::AccessDenied(_) => io::ErrorKind::PermissionDenied,
            Error::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            Error::Crypto(_) | Error::Serialization(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

//! Source and Destination capability traits.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncRead;

use vaultferry_common::{Result, StorageLocation};

/// Readable byte stream handed between capabilities.
///
/// The party that opened it owns it and drops it when done.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Lazy, one-pass listing of container-relative leaf paths.
pub type PathStream = BoxStream<'static, Result<String>>;

/// How an adapter manages its connection to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    /// Plain syscalls, no connection at all.
    Direct,
    /// A fresh session is opened and closed around every call.
    PerOperation,
    /// One thread-safe client is built once and shared by all calls.
    Pooled,
}

impl fmt::Display for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPolicy::Direct => "direct",
            ConnectionPolicy::PerOperation => "per-operation",
            ConnectionPolicy::Pooled => "pooled",
        };
        f.write_str(name)
    }
}

/// Read side of a storage backend.
///
/// Implementations must be safe to share between tasks; callers hold them
/// as `Arc<dyn SourceProvider>`.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Backend kind (e.g. "local", "sftp", "s3").
    fn name(&self) -> &str;

    /// Connection lifecycle this adapter follows.
    fn connection_policy(&self) -> ConnectionPolicy;

    /// Check whether an object exists.
    ///
    /// # Postconditions
    /// - Returns `Ok(false)` for a missing object, never `NotFound`
    ///
    /// # Errors
    /// - Access, transport or connection failures
    async fn exists(&self, location: &StorageLocation) -> Result<bool>;

    /// Size of an object in bytes.
    ///
    /// # Errors
    /// - `NotFound` if the object is absent
    async fn size(&self, location: &StorageLocation) -> Result<u64>;

    /// Open an object for reading.
    ///
    /// # Postconditions
    /// - The returned reader is positioned at offset 0
    ///
    /// # Errors
    /// - `NotFound`, `AccessDenied`, `ReadFailed`, `ConnectionFailed`
    async fn open_read(&self, location: &StorageLocation) -> Result<ByteReader>;

    /// List leaf paths in `container`, recursively, that match `prefix`.
    ///
    /// A missing prefix matches everything. Directory markers and in-flight
    /// temporary uploads are never yielded. Failures end the stream with an
    /// `Err` item.
    fn list(&self, container: &str, prefix: Option<&str>) -> PathStream;
}

/// Write side of a storage backend.
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    /// Backend kind (e.g. "local", "sftp", "s3").
    fn name(&self) -> &str;

    /// Connection lifecycle this adapter follows.
    fn connection_policy(&self) -> ConnectionPolicy;

    /// Create or replace an object with the full content of `input`.
    ///
    /// # Postconditions
    /// - On success the object holds exactly the bytes read from `input`
    /// - On failure no partial object is visible at `location`
    /// - Returns the number of bytes written
    ///
    /// # Errors
    /// - `WriteFailed` on transport errors
    /// - Errors raised while reading `input` are returned unchanged
    async fn set_stream(&self, input: ByteReader, location: &StorageLocation) -> Result<u64>;

    /// Delete an object. Deleting an absent object succeeds.
    async fn delete(&self, location: &StorageLocation) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_policy_display() {
        assert_eq!(ConnectionPolicy::PerOperation.to_string(), "per-operation");
        assert_eq!(ConnectionPolicy::Pooled.to_string(), "pooled");
    }
}

//! SFTP storage provider.
//!
//! Every operation opens its own session, runs on a blocking task and
//! closes the session before returning, whatever the outcome. No session
//! is ever kept on the provider.
//!
//! The container is a remote directory (absolute, or relative to the login
//! directory); paths below it use `/`.

mod dir;
mod session;
#[cfg(feature = "sftp")]
mod ssh;

pub use dir::DirectoryConnector;
pub use session::{RemoteEntry, RemoteSession, RemoteStat, SessionGuard, SftpConnector};
#[cfg(feature = "sftp")]
pub use ssh::Ssh2Connector;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

use crate::local::{is_partial_name, partial_name};
use crate::provider::{ByteReader, ConnectionPolicy, DestinationProvider, PathStream, SourceProvider};
use crate::stream::copy_blocking;
use session::{ensure_dirs, remote_join};
use vaultferry_common::{Error, IoDirection, ListFilter, Result, StorageLocation};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default connect and I/O timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Largest object `open_read` will buffer in memory by default (64 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 64 * 1024 * 1024;

/// Listing entries queued between the walking task and the consumer.
const LIST_CHANNEL_CAPACITY: usize = 256;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_buffer_bytes() -> u64 {
    DEFAULT_MAX_BUFFER_BYTES
}

/// Configuration for an SFTP backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key file.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    /// Expected SHA-256 host key fingerprint, base64 (as printed by
    /// `ssh-keygen -l`, with or without the `SHA256:` prefix).
    #[serde(default)]
    pub host_fingerprint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: u64,
}

impl SftpConfig {
    /// Password-authenticated configuration with default settings.
    pub fn with_password(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: Some(password.into()),
            private_key: None,
            private_key_passphrase: None,
            host_fingerprint: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty host or username
    /// - `Configuration` when neither a password nor a key is given
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidArgument("SFTP host cannot be empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::InvalidArgument("SFTP username cannot be empty".to_string()));
        }
        if self.password.is_none() && self.private_key.is_none() {
            return Err(Error::Configuration(format!(
                "SFTP backend {} needs a password or a private key",
                self.host
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key)
            .field("host_fingerprint", &self.host_fingerprint)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_buffer_bytes", &self.max_buffer_bytes)
            .finish()
    }
}

/// SFTP storage provider.
pub struct SftpProvider {
    connector: Arc<dyn SftpConnector>,
    max_buffer_bytes: u64,
}

impl SftpProvider {
    /// Create a provider that connects with `ssh2`.
    ///
    /// # Errors
    /// - Invalid configuration, see [`SftpConfig::validate`]
    pub fn new(config: SftpConfig) -> Result<Self> {
        config.validate()?;
        let max_buffer_bytes = config.max_buffer_bytes;

        #[cfg(feature = "sftp")]
        {
            Ok(Self::with_connector(Arc::new(Ssh2Connector::new(config)), max_buffer_bytes))
        }

        #[cfg(not(feature = "sftp"))]
        {
            let _ = max_buffer_bytes;
            Err(Error::Configuration(
                "SFTP support is not compiled in (enable the `sftp` feature)".to_string(),
            ))
        }
    }

    /// Create a provider around any connector.
    pub fn with_connector(connector: Arc<dyn SftpConnector>, max_buffer_bytes: u64) -> Self {
        Self {
            connector,
            max_buffer_bytes,
        }
    }

    /// Run `op` against a fresh session on a blocking task.
    async fn with_session<T, F>(&self, direction: IoDirection, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RemoteSession) -> Result<T> + Send + 'static,
    {
        let connector = self.connector.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = SessionGuard::open(connector.as_ref())?;
            op(guard.session())
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("SFTP task failed: {}", e);
                Err(match direction {
                    IoDirection::Read => Error::ReadFailed(message),
                    IoDirection::Write => Error::WriteFailed(message),
                })
            }
        }
    }
}

fn remote_path(location: &StorageLocation) -> String {
    remote_join(location.container(), location.path())
}

fn read_buffered(session: &mut dyn RemoteSession, remote: &str, limit: u64) -> Result<Vec<u8>> {
    let stat = session.stat(remote)?;
    if stat.is_dir {
        return Err(Error::NotFound(format!("{} is a directory", remote)));
    }
    if stat.size > limit {
        return Err(Error::ReadFailed(format!(
            "{} is {} bytes, above the {} byte buffer limit",
            remote, stat.size, limit
        )));
    }

    let mut data = Vec::with_capacity(stat.size as usize);
    session
        .open_read(remote)?
        .take(limit.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| Error::from_io(e, format!("read {}", remote), IoDirection::Read))?;

    // The file may have grown since the stat.
    if data.len() as u64 > limit {
        return Err(Error::ReadFailed(format!(
            "{} exceeds the {} byte buffer limit",
            remote, limit
        )));
    }
    Ok(data)
}

fn upload_and_commit(
    session: &mut dyn RemoteSession,
    input: &mut dyn Read,
    temp: &str,
    target: &str,
) -> Result<u64> {
    let context = format!("upload {}", target);
    let written = {
        let mut remote = session.create(temp)?;
        copy_blocking(input, &mut remote, &context)?
    };
    session.rename(temp, target)?;
    Ok(written)
}

fn walk(
    session: &mut dyn RemoteSession,
    container: &str,
    filter: &ListFilter,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    // The container itself has to exist; the prefix directory does not.
    let root = session.stat(container)?;
    if !root.is_dir {
        return Err(Error::NotFound(format!("container {} is not a directory", container)));
    }

    let mut pending = vec![filter.base_dir().to_string()];
    while let Some(relative) = pending.pop() {
        let entries = match session.read_dir(&remote_join(container, &relative)) {
            Ok(entries) => entries,
            Err(Error::NotFound(_)) if !relative.is_empty() => continue,
            Err(e) => return Err(e),
        };

        for entry in entries {
            let child = remote_join(&relative, &entry.name);
            if entry.is_dir {
                pending.push(child);
            } else if !is_partial_name(&entry.name) && filter.matches(&child) {
                // The consumer dropped the stream.
                if tx.blocking_send(Ok(child)).is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl SourceProvider for SftpProvider {
    fn name(&self) -> &str {
        "sftp"
    }

    fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::PerOperation
    }

    async fn exists(&self, location: &StorageLocation) -> Result<bool> {
        let remote = remote_path(location);
        self.with_session(IoDirection::Read, move |session| match session.stat(&remote) {
            Ok(stat) => Ok(!stat.is_dir),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn size(&self, location: &StorageLocation) -> Result<u64> {
        let remote = remote_path(location);
        self.with_session(IoDirection::Read, move |session| {
            let stat = session.stat(&remote)?;
            if stat.is_dir {
                return Err(Error::NotFound(format!("{} is a directory", remote)));
            }
            Ok(stat.size)
        })
        .await
    }

    async fn open_read(&self, location: &StorageLocation) -> Result<ByteReader> {
        let remote = remote_path(location);
        let limit = self.max_buffer_bytes;
        let data = self
            .with_session(IoDirection::Read, move |session| read_buffered(session, &remote, limit))
            .await?;

        debug!(location = %location, bytes = data.len(), "Downloaded SFTP file");
        Ok(Box::pin(Cursor::new(data)))
    }

    fn list(&self, container: &str, prefix: Option<&str>) -> PathStream {
        let connector = self.connector.clone();
        let container = container.to_string();
        let filter = ListFilter::new(prefix);

        // The walk starts when the stream is first polled.
        let start = async move {
            let (tx, rx) = mpsc::channel(LIST_CHANNEL_CAPACITY);
            debug!(container = %container, base = %filter.base_dir(), "Listing SFTP directory");

            tokio::task::spawn_blocking(move || {
                let result = SessionGuard::open(connector.as_ref())
                    .and_then(|mut guard| walk(guard.session(), &container, &filter, &tx));
                if let Err(e) = result {
                    let _ = tx.blocking_send(Err(e));
                }
            });

            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        };

        stream::once(start).flatten().boxed()
    }
}

#[async_trait]
impl DestinationProvider for SftpProvider {
    fn name(&self) -> &str {
        "sftp"
    }

    fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::PerOperation
    }

    async fn set_stream(&self, input: ByteReader, location: &StorageLocation) -> Result<u64> {
        let container = location.container().to_string();
        let parent = location.parent().unwrap_or_default().to_string();
        let target = remote_path(location);
        let temp = remote_join(&remote_join(&container, &parent), &partial_name(location.file_name()));
        let mut input = SyncIoBridge::new(input);

        let written = self
            .with_session(IoDirection::Write, move |session| {
                ensure_dirs(session, &container, &parent)?;

                let result = upload_and_commit(session, &mut input, &temp, &target);
                if result.is_err() {
                    match session.remove(&temp) {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => warn!(path = %temp, error = %e, "Failed to remove partial upload"),
                    }
                }
                result
            })
            .await?;

        debug!(location = %location, bytes = written, "Uploaded SFTP file");
        Ok(written)
    }

    async fn delete(&self, location: &StorageLocation) -> Result<()> {
        let remote = remote_path(location);
        self.with_session(IoDirection::Write, move |session| match session.remove(&remote) {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        })
        .await?;

        debug!(location = %location, "Deleted SFTP file");
        Ok(())
    }
}

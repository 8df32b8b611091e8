//! Blocking session interface and the guard that scopes a session to one
//! operation.

use std::io::{Read, Write};
use tracing::{debug, warn};

use vaultferry_common::{Error, Result};

/// Attributes of a remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub is_dir: bool,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// File name without any directory part.
    pub name: String,
    pub is_dir: bool,
}

/// An open, authenticated SFTP session.
///
/// All calls block; the provider only uses sessions from blocking tasks.
/// Paths are remote paths with `/` separators.
pub trait RemoteSession: Send {
    /// Attributes of `path`. `NotFound` if it does not exist.
    fn stat(&mut self, path: &str) -> Result<RemoteStat>;

    /// Open `path` for reading from offset 0.
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + '_>>;

    /// Create or truncate `path` for writing.
    fn create(&mut self, path: &str) -> Result<Box<dyn Write + '_>>;

    /// Create a single directory.
    fn mkdir(&mut self, path: &str) -> Result<()>;

    /// Entries of a directory, excluding `.` and `..`.
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Rename `from` to `to`, replacing `to` if it exists.
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Remove a file.
    fn remove(&mut self, path: &str) -> Result<()>;

    /// End the session. Called exactly once, by [`SessionGuard`].
    fn close(&mut self);
}

/// Opens fresh sessions.
pub trait SftpConnector: Send + Sync {
    /// Connect, verify the host and authenticate.
    ///
    /// # Errors
    /// - `ConnectionFailed` if any step of the handshake fails
    fn connect(&self) -> Result<Box<dyn RemoteSession>>;
}

/// A session that is closed when the guard goes out of scope, on every
/// exit path.
pub struct SessionGuard {
    session: Box<dyn RemoteSession>,
}

impl SessionGuard {
    /// Open a new session through `connector`.
    pub fn open(connector: &dyn SftpConnector) -> Result<Self> {
        let session = connector.connect()?;
        debug!("SFTP session opened");
        Ok(Self { session })
    }

    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
        debug!("SFTP session closed");
    }
}

/// Join a container and a container-relative path into a remote path.
pub(crate) fn remote_join(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Create every missing directory of `relative_dir` below `base`.
pub(crate) fn ensure_dirs(session: &mut dyn RemoteSession, base: &str, relative_dir: &str) -> Result<()> {
    let mut current = String::new();
    for segment in relative_dir.split('/').filter(|s| !s.is_empty()) {
        current = remote_join(&current, segment);
        let remote = remote_join(base, &current);
        match session.stat(&remote) {
            Ok(stat) if stat.is_dir => continue,
            Ok(_) => {
                return Err(Error::WriteFailed(format!("{} exists and is not a directory", remote)));
            }
            Err(Error::NotFound(_)) => {
                if let Err(e) = session.mkdir(&remote) {
                    // Another writer may have created it in the meantime.
                    match session.stat(&remote) {
                        Ok(stat) if stat.is_dir => {}
                        _ => {
                            warn!(path = %remote, error = %e, "Failed to create remote directory");
                            return Err(e);
                        }
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/upload", "a/b.txt"), "/upload/a/b.txt");
        assert_eq!(remote_join("/upload/", "b.txt"), "/upload/b.txt");
        assert_eq!(remote_join("inbox", ""), "inbox");
        assert_eq!(remote_join("", "x"), "x");
    }
}

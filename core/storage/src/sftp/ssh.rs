//! `ssh2` implementation of the session interface.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ssh2::{ErrorCode, HashType, RenameFlags, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::session::{RemoteEntry, RemoteSession, RemoteStat, SftpConnector};
use super::SftpConfig;
use vaultferry_common::{Error, IoDirection, Result};

// libssh2 SFTP status codes.
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;

/// Connects to a real SSH server.
pub struct Ssh2Connector {
    config: SftpConfig,
}

impl Ssh2Connector {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }

    fn tcp_connect(&self) -> Result<TcpStream> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let addrs = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| connection_failed(&self.config, e))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => connection_failed(&self.config, e),
            None => connection_failed(&self.config, "host did not resolve"),
        })
    }

    fn verify_host(&self, session: &Session) -> Result<()> {
        let Some(expected) = &self.config.host_fingerprint else {
            return Ok(());
        };

        let actual = session
            .host_key_hash(HashType::Sha256)
            .map(|hash| STANDARD_NO_PAD.encode(hash))
            .ok_or_else(|| connection_failed(&self.config, "server offered no host key"))?;

        let expected = expected.trim().trim_start_matches("SHA256:").trim_end_matches('=');
        if actual != expected {
            return Err(connection_failed(&self.config, "host key fingerprint mismatch"));
        }
        Ok(())
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        let config = &self.config;
        let result = match (&config.private_key, &config.password) {
            (Some(key), _) => session.userauth_pubkey_file(
                &config.username,
                None,
                Path::new(key),
                config.private_key_passphrase.as_deref(),
            ),
            (None, Some(password)) => session.userauth_password(&config.username, password),
            (None, None) => {
                return Err(Error::Configuration("SFTP backend has no credential".to_string()));
            }
        };
        result.map_err(|e| connection_failed(config, e))?;

        if !session.authenticated() {
            return Err(connection_failed(config, "authentication rejected"));
        }
        Ok(())
    }
}

impl SftpConnector for Ssh2Connector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        let tcp = self.tcp_connect()?;

        let mut session = Session::new().map_err(|e| connection_failed(&self.config, e))?;
        session.set_timeout(self.config.timeout_secs.saturating_mul(1000).min(u32::MAX as u64) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| connection_failed(&self.config, e))?;

        self.verify_host(&session)?;
        self.authenticate(&session)?;

        let sftp = session.sftp().map_err(|e| connection_failed(&self.config, e))?;
        debug!(host = %self.config.host, port = self.config.port, "SSH handshake complete");
        Ok(Box::new(Ssh2Session { session, sftp }))
    }
}

fn connection_failed(config: &SftpConfig, err: impl std::fmt::Display) -> Error {
    Error::ConnectionFailed(format!("{}@{}:{}: {}", config.username, config.host, config.port, err))
}

fn map_sftp_error(err: ssh2::Error, context: &str, direction: IoDirection) -> Error {
    let message = format!("{}: {}", context, err);
    match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => Error::NotFound(message),
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => Error::AccessDenied(message),
        _ => match direction {
            IoDirection::Read => Error::ReadFailed(message),
            IoDirection::Write => Error::WriteFailed(message),
        },
    }
}

struct Ssh2Session {
    session: Session,
    sftp: Sftp,
}

impl RemoteSession for Ssh2Session {
    fn stat(&mut self, path: &str) -> Result<RemoteStat> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| map_sftp_error(e, &format!("stat {}", path), IoDirection::Read))?;
        Ok(RemoteStat {
            size: stat.size.unwrap_or(0),
            is_dir: stat.is_dir(),
        })
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + '_>> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_sftp_error(e, &format!("open {}", path), IoDirection::Read))?;
        Ok(Box::new(file))
    }

    fn create(&mut self, path: &str) -> Result<Box<dyn Write + '_>> {
        let file = self
            .sftp
            .create(Path::new(path))
            .map_err(|e| map_sftp_error(e, &format!("create {}", path), IoDirection::Write))?;
        Ok(Box::new(file))
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.sftp
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| map_sftp_error(e, &format!("mkdir {}", path), IoDirection::Write))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| map_sftp_error(e, &format!("list {}", path), IoDirection::Read))?;

        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_str()?.to_string();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteEntry {
                    name,
                    is_dir: stat.is_dir(),
                })
            })
            .collect())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let flags = Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE);
        let context = format!("rename {} to {}", from, to);

        match self.sftp.rename(Path::new(from), Path::new(to), flags) {
            Ok(()) => Ok(()),
            // SFTPv3 servers refuse to rename over an existing file.
            Err(first) => {
                if self.sftp.stat(Path::new(to)).is_err() {
                    return Err(map_sftp_error(first, &context, IoDirection::Write));
                }
                self.sftp
                    .unlink(Path::new(to))
                    .map_err(|e| map_sftp_error(e, &context, IoDirection::Write))?;
                self.sftp
                    .rename(Path::new(from), Path::new(to), flags)
                    .map_err(|e| map_sftp_error(e, &context, IoDirection::Write))
            }
        }
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| map_sftp_error(e, &format!("remove {}", path), IoDirection::Write))
    }

    fn close(&mut self) {
        if let Err(e) = self.session.disconnect(None, "transfer complete", None) {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

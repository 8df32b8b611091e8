//! Session interface served from a local directory.
//!
//! Behaves like an SFTP server whose filesystem root is a local directory.
//! Used for tests and offline dry runs; counts the sessions it hands out so
//! callers can check that every session was closed.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::session::{RemoteEntry, RemoteSession, RemoteStat, SftpConnector};
use vaultferry_common::{Error, IoDirection, Result};

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    refuse: AtomicBool,
}

/// Connector backed by a local directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryConnector {
    root: PathBuf,
    counters: Arc<Counters>,
}

impl DirectoryConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Sessions handed out so far.
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Sessions closed so far.
    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Make further `connect` calls fail with `ConnectionFailed`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.counters.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl SftpConnector for DirectoryConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        if self.counters.refuse.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed(format!(
                "connection to {} refused",
                self.root.display()
            )));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DirectorySession {
            root: self.root.clone(),
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

struct DirectorySession {
    root: PathBuf,
    counters: Arc<Counters>,
    closed: bool,
}

impl DirectorySession {
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if self.closed {
            return Err(Error::ConnectionFailed("session already closed".to_string()));
        }
        let mut resolved = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                return Err(Error::AccessDenied(format!("{} escapes the server root", path)));
            }
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

impl RemoteSession for DirectorySession {
    fn stat(&mut self, path: &str) -> Result<RemoteStat> {
        let meta = fs::metadata(self.resolve(path)?)
            .map_err(|e| Error::from_io(e, format!("stat {}", path), IoDirection::Read))?;
        Ok(RemoteStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + '_>> {
        let file = fs::File::open(self.resolve(path)?)
            .map_err(|e| Error::from_io(e, format!("open {}", path), IoDirection::Read))?;
        Ok(Box::new(file))
    }

    fn create(&mut self, path: &str) -> Result<Box<dyn Write + '_>> {
        let file = fs::File::create(self.resolve(path)?)
            .map_err(|e| Error::from_io(e, format!("create {}", path), IoDirection::Write))?;
        Ok(Box::new(file))
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        fs::create_dir(self.resolve(path)?)
            .map_err(|e| Error::from_io(e, format!("mkdir {}", path), IoDirection::Write))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let context = format!("list {}", path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)
            .map_err(|e| Error::from_io(e, &context, IoDirection::Read))?
        {
            let entry = entry.map_err(|e| Error::from_io(e, &context, IoDirection::Read))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_dir = entry
                .file_type()
                .map_err(|e| Error::from_io(e, &context, IoDirection::Read))?
                .is_dir();
            entries.push(RemoteEntry { name, is_dir });
        }
        Ok(entries)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)
            .map_err(|e| Error::from_io(e, format!("rename {} to {}", from, to), IoDirection::Write))
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        // A server reports no such file when a parent is a regular file.
        fs::remove_file(self.resolve(path)?).map_err(|e| match e.kind() {
            io::ErrorKind::NotADirectory => Error::NotFound(format!("remove {}: {}", path, e)),
            _ => Error::from_io(e, format!("remove {}", path), IoDirection::Write),
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

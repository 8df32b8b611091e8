//! Capability contract tests.
//!
//! Every adapter that can run in-process (local filesystem, in-memory
//! object store, SFTP over a directory-backed connector) must behave the
//! same way for the properties below.

use futures::TryStreamExt;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use vaultferry_common::{Error, Result, StorageLocation};
use vaultferry_storage::{
    ByteReader, DestinationProvider, DirectoryConnector, LocalConfig, LocalProvider, MemoryBuckets,
    ObjectProvider, SftpProvider, SourceProvider,
};

const CONTAINER: &str = "box";

struct Backend {
    label: &'static str,
    source: Arc<dyn SourceProvider>,
    destination: Arc<dyn DestinationProvider>,
    sftp: Option<DirectoryConnector>,
    _dir: Option<TempDir>,
}

impl Backend {
    fn sessions_balanced(&self) {
        if let Some(connector) = &self.sftp {
            assert_eq!(connector.opened(), connector.closed(), "{}: session leak", self.label);
        }
    }
}

fn local() -> Backend {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(CONTAINER)).unwrap();
    let config = LocalConfig {
        root: Some(dir.path().to_path_buf()),
    };
    Backend {
        label: "local",
        source: Arc::new(LocalProvider::new(config.clone())),
        destination: Arc::new(LocalProvider::new(config)),
        sftp: None,
        _dir: Some(dir),
    }
}

fn memory() -> Backend {
    let buckets = MemoryBuckets::new();
    Backend {
        label: "memory",
        source: Arc::new(ObjectProvider::in_memory(buckets.clone())),
        destination: Arc::new(ObjectProvider::in_memory(buckets)),
        sftp: None,
        _dir: None,
    }
}

fn sftp() -> Backend {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(CONTAINER)).unwrap();
    let connector = DirectoryConnector::new(dir.path());
    let limit = 16 * 1024 * 1024;
    Backend {
        label: "sftp",
        source: Arc::new(SftpProvider::with_connector(Arc::new(connector.clone()), limit)),
        destination: Arc::new(SftpProvider::with_connector(Arc::new(connector.clone()), limit)),
        sftp: Some(connector),
        _dir: Some(dir),
    }
}

fn backends() -> Vec<Backend> {
    vec![local(), memory(), sftp()]
}

fn loc(path: &str) -> StorageLocation {
    StorageLocation::new(CONTAINER, path).unwrap()
}

fn reader(data: Vec<u8>) -> ByteReader {
    Box::pin(Cursor::new(data))
}

async fn read_all(source: &dyn SourceProvider, location: &StorageLocation) -> Vec<u8> {
    let mut out = Vec::new();
    source
        .open_read(location)
        .await
        .unwrap()
        .read_to_end(&mut out)
        .await
        .unwrap();
    out
}

async fn listed(source: &dyn SourceProvider, prefix: Option<&str>) -> Result<Vec<String>> {
    let mut paths: Vec<String> = source.list(CONTAINER, prefix).try_collect().await?;
    paths.sort();
    Ok(paths)
}

/// Yields some bytes, then fails like a transform would.
struct FailingAfter {
    remaining: usize,
}

impl AsyncRead for FailingAfter {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(Error::Crypto("chunk 2 failed authentication".to_string()).into_io()));
        }
        let n = self.remaining.min(buf.remaining()).min(1024);
        buf.put_slice(&vec![0xEE; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn exists_tracks_writes_and_deletes() {
    for backend in backends() {
        let location = loc("docs/report.txt");

        assert!(!backend.source.exists(&location).await.unwrap(), "{}", backend.label);
        backend.destination.set_stream(reader(b"hello".to_vec()), &location).await.unwrap();
        assert!(backend.source.exists(&location).await.unwrap(), "{}", backend.label);

        backend.destination.delete(&location).await.unwrap();
        assert!(!backend.source.exists(&location).await.unwrap(), "{}", backend.label);
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn round_trip_small_and_large() {
    for backend in backends() {
        let small = b"a few bytes".to_vec();
        let large: Vec<u8> = (0..(2 * 1024 * 1024 + 3)).map(|i| (i % 251) as u8).collect();

        for (name, payload) in [("small.bin", small), ("large.bin", large)] {
            let location = loc(name);
            let written = backend
                .destination
                .set_stream(reader(payload.clone()), &location)
                .await
                .unwrap();
            assert_eq!(written, payload.len() as u64, "{}", backend.label);
            assert_eq!(read_all(backend.source.as_ref(), &location).await, payload, "{}", backend.label);
        }
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn write_replaces_whole_object() {
    for backend in backends() {
        let location = loc("replace.txt");
        backend.destination.set_stream(reader(vec![1u8; 4096]), &location).await.unwrap();
        backend.destination.set_stream(reader(vec![2u8; 10]), &location).await.unwrap();

        assert_eq!(read_all(backend.source.as_ref(), &location).await, vec![2u8; 10], "{}", backend.label);
    }
}

#[tokio::test]
async fn delete_is_idempotent() {
    for backend in backends() {
        let location = loc("gone.txt");
        backend.destination.set_stream(reader(b"x".to_vec()), &location).await.unwrap();

        backend.destination.delete(&location).await.unwrap();
        backend.destination.delete(&location).await.unwrap();
        backend.destination.delete(&loc("never-existed.txt")).await.unwrap();
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn size_of_absent_and_present_objects() {
    for backend in backends() {
        let err = backend.source.size(&loc("absent.txt")).await.unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.label);

        let location = loc("present.txt");
        let written = backend
            .destination
            .set_stream(reader(vec![7u8; 1234]), &location)
            .await
            .unwrap();
        assert_eq!(backend.source.size(&location).await.unwrap(), written, "{}", backend.label);

        let err = backend.source.open_read(&loc("absent.txt")).await.err().unwrap();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn list_prefix_yields_exact_set() {
    for backend in backends() {
        for path in ["a/x", "a/y", "ab/z", "b/x", "top.txt"] {
            backend.destination.set_stream(reader(path.as_bytes().to_vec()), &loc(path)).await.unwrap();
        }

        assert_eq!(listed(backend.source.as_ref(), Some("a/")).await.unwrap(), vec!["a/x", "a/y"], "{}", backend.label);
        assert_eq!(
            listed(backend.source.as_ref(), None).await.unwrap(),
            vec!["a/x", "a/y", "ab/z", "b/x", "top.txt"],
            "{}",
            backend.label
        );
        assert_eq!(
            listed(backend.source.as_ref(), Some("*")).await.unwrap(),
            listed(backend.source.as_ref(), None).await.unwrap(),
            "{}",
            backend.label
        );
        assert_eq!(listed(backend.source.as_ref(), Some("*/x")).await.unwrap(), vec!["a/x", "b/x"], "{}", backend.label);
        assert!(listed(backend.source.as_ref(), Some("zzz/")).await.unwrap().is_empty(), "{}", backend.label);
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn concurrent_writers_leave_one_full_payload() {
    for backend in backends() {
        let location = loc("contended.bin");
        let first = vec![0xAAu8; 300 * 1024];
        let second = vec![0xBBu8; 200 * 1024];

        let (a, b) = tokio::join!(
            backend.destination.set_stream(reader(first.clone()), &location),
            backend.destination.set_stream(reader(second.clone()), &location),
        );
        a.unwrap();
        b.unwrap();

        let stored = read_all(backend.source.as_ref(), &location).await;
        assert!(stored == first || stored == second, "{}: interleaved write", backend.label);
        assert_eq!(listed(backend.source.as_ref(), None).await.unwrap(), vec!["contended.bin"], "{}", backend.label);
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn failed_input_leaves_no_visible_object() {
    for backend in backends() {
        let location = loc("out/partial.bin");
        let input: ByteReader = Box::pin(FailingAfter { remaining: 10_000 });

        let err = backend.destination.set_stream(input, &location).await.unwrap_err();
        assert!(matches!(err, Error::Crypto(_)), "{}: {err}", backend.label);
        assert!(!backend.source.exists(&location).await.unwrap(), "{}", backend.label);
        assert!(listed(backend.source.as_ref(), None).await.unwrap().is_empty(), "{}", backend.label);
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn invalid_locations_are_rejected_up_front() {
    assert!(matches!(StorageLocation::new("", "a.txt"), Err(Error::InvalidArgument(_))));
    assert!(matches!(StorageLocation::new(CONTAINER, ""), Err(Error::InvalidArgument(_))));
    assert!(matches!(StorageLocation::new(CONTAINER, "../etc/passwd"), Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn file_typed_parent_reads_as_absent() {
    for backend in backends() {
        backend.destination.set_stream(reader(b"plain file".to_vec()), &loc("a.txt")).await.unwrap();
        let below_file = loc("a.txt/b");

        assert!(!backend.source.exists(&below_file).await.unwrap(), "{}", backend.label);
        let err = backend.source.size(&below_file).await.unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
        let err = backend.source.open_read(&below_file).await.err().unwrap();
        assert!(err.is_not_found(), "{}: {err}", backend.label);
        backend.destination.delete(&below_file).await.unwrap();

        assert_eq!(read_all(backend.source.as_ref(), &loc("a.txt")).await, b"plain file", "{}", backend.label);
        backend.sessions_balanced();
    }
}

#[tokio::test]
async fn containers_cannot_reach_outside_the_backend() {
    for backend in backends() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("key.txt"), b"secret").unwrap();
        let sibling = format!("../{}", outside.path().file_name().unwrap().to_str().unwrap());
        let absolute = outside.path().display().to_string();

        for container in [sibling.as_str(), absolute.as_str()] {
            let secret = StorageLocation::new(container, "key.txt").unwrap();
            let seen = backend.source.exists(&secret).await;
            assert!(!matches!(seen, Ok(true)), "{}: {container} reached outside", backend.label);

            let listed: Result<Vec<String>> = backend.source.list(container, None).try_collect().await;
            assert!(!matches!(listed, Ok(ref paths) if !paths.is_empty()), "{}: {container} listed", backend.label);

            let planted = StorageLocation::new(container, "planted.txt").unwrap();
            let _ = backend.destination.set_stream(reader(b"planted".to_vec()), &planted).await;
            let _ = backend.destination.delete(&secret).await;
        }

        assert!(!outside.path().join("planted.txt").exists(), "{}", backend.label);
        assert_eq!(std::fs::read(outside.path().join("key.txt")).unwrap(), b"secret", "{}", backend.label);
        backend.sessions_balanced();
    }
}

//! Local filesystem storage provider.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::{ByteReader, ConnectionPolicy, DestinationProvider, PathStream, SourceProvider};
use crate::stream::copy_to_writer;
use vaultferry_common::{Error, IoDirection, ListFilter, Result, StorageLocation};

/// Suffix of in-flight uploads; such files are never listed.
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

/// Configuration for [`LocalProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory that containers are resolved against. Without a root, the
    /// container is used as a directory path as given.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Local filesystem storage provider.
///
/// A container is a directory, an object a file below it. There is no
/// connection: every operation is a direct filesystem call.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: Option<PathBuf>,
}

impl LocalProvider {
    /// Create a new local provider.
    ///
    /// Nothing is touched on disk until the first operation.
    pub fn new(config: LocalConfig) -> Self {
        Self { root: config.root }
    }

    /// Directory of `container`.
    ///
    /// With a root configured, the container must stay below it: absolute
    /// containers and `..` segments are rejected.
    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(container));
        };

        let confined = Path::new(container)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !confined || container.starts_with(['/', '\\']) {
            return Err(Error::InvalidArgument(format!(
                "container '{}' must be a relative path below the root",
                container
            )));
        }
        Ok(root.join(container))
    }

    /// Convert a location to a filesystem path.
    fn to_fs_path(&self, location: &StorageLocation) -> Result<PathBuf> {
        let mut fs_path = self.container_dir(location.container())?;
        for segment in location.path().split('/') {
            fs_path.push(segment);
        }
        Ok(fs_path)
    }

    async fn file_metadata(&self, location: &StorageLocation) -> Result<std::fs::Metadata> {
        let fs_path = self.to_fs_path(location)?;
        let meta = fs::metadata(&fs_path)
            .await
            .map_err(|e| Error::from_io(e, format!("stat {}", location), IoDirection::Read))?;

        if meta.is_dir() {
            return Err(Error::NotFound(format!("{} is a directory", location)));
        }
        Ok(meta)
    }
}

/// Errors meaning "nothing at this path": the path itself is missing, or
/// one of its parents is a regular file.
fn is_absent(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

/// Name of the hidden sibling an upload is staged in.
pub(crate) fn partial_name(file_name: &str) -> String {
    format!(".{}.{}{}", file_name, Uuid::new_v4().simple(), PARTIAL_SUFFIX)
}

pub(crate) fn is_partial_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(PARTIAL_SUFFIX)
}

#[async_trait]
impl SourceProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::Direct
    }

    async fn exists(&self, location: &StorageLocation) -> Result<bool> {
        match fs::metadata(self.to_fs_path(location)?).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if is_absent(&e) => Ok(false),
            Err(e) => Err(Error::from_io(e, format!("stat {}", location), IoDirection::Read)),
        }
    }

    async fn size(&self, location: &StorageLocation) -> Result<u64> {
        Ok(self.file_metadata(location).await?.len())
    }

    async fn open_read(&self, location: &StorageLocation) -> Result<ByteReader> {
        self.file_metadata(location).await?;

        let file = fs::File::open(self.to_fs_path(location)?)
            .await
            .map_err(|e| Error::from_io(e, format!("open {}", location), IoDirection::Read))?;

        debug!(location = %location, "Opened local file");
        Ok(Box::pin(file))
    }

    fn list(&self, container: &str, prefix: Option<&str>) -> PathStream {
        let filter = ListFilter::new(prefix);
        let container_dir = match self.container_dir(container) {
            Ok(dir) => dir,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        debug!(container = %container, base = %filter.base_dir(), "Listing local directory");

        let mut pending_dirs = Vec::new();
        let start = if filter.base_dir().is_empty() {
            container_dir.clone()
        } else {
            container_dir.join(filter.base_dir())
        };
        pending_dirs.push((start, filter.base_dir().to_string()));

        let walk = Walk {
            container_dir,
            filter,
            pending_dirs,
            ready: VecDeque::new(),
            started: false,
        };

        stream::try_unfold(walk, next_listed).boxed()
    }
}

#[async_trait]
impl DestinationProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::Direct
    }

    async fn set_stream(&self, mut input: ByteReader, location: &StorageLocation) -> Result<u64> {
        let target = self.to_fs_path(location)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::InvalidArgument(format!("no parent directory for {}", location)))?;

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::from_io(e, format!("create directory for {}", location), IoDirection::Write))?;

        let temp = parent.join(partial_name(location.file_name()));
        let result = write_and_commit(&mut input, &temp, &target, location).await;

        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), error = %e, "Failed to remove partial upload");
                }
            }
        }

        let written = result?;
        debug!(location = %location, bytes = written, "Wrote local file");
        Ok(written)
    }

    async fn delete(&self, location: &StorageLocation) -> Result<()> {
        match fs::remove_file(self.to_fs_path(location)?).await {
            Ok(()) => {
                debug!(location = %location, "Deleted local file");
                Ok(())
            }
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(Error::from_io(e, format!("delete {}", location), IoDirection::Write)),
        }
    }
}

async fn write_and_commit(
    input: &mut ByteReader,
    temp: &Path,
    target: &Path,
    location: &StorageLocation,
) -> Result<u64> {
    let context = format!("write {}", location);
    let mut file = fs::File::create(temp)
        .await
        .map_err(|e| Error::from_io(e, &context, IoDirection::Write))?;

    let written = copy_to_writer(input, &mut file, &context).await?;
    file.sync_all()
        .await
        .map_err(|e| Error::from_io(e, &context, IoDirection::Write))?;
    drop(file);

    fs::rename(temp, target)
        .await
        .map_err(|e| Error::from_io(e, &context, IoDirection::Write))?;
    Ok(written)
}

/// State of a lazy directory walk: one directory is read per refill.
struct Walk {
    container_dir: PathBuf,
    filter: ListFilter,
    pending_dirs: Vec<(PathBuf, String)>,
    ready: VecDeque<String>,
    started: bool,
}

async fn next_listed(mut walk: Walk) -> Result<Option<(String, Walk)>> {
    if !walk.started {
        walk.started = true;
        match fs::metadata(&walk.container_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::NotFound(format!(
                    "container {} is not a directory",
                    walk.container_dir.display()
                )))
            }
            Err(e) => {
                return Err(Error::from_io(
                    e,
                    format!("list {}", walk.container_dir.display()),
                    IoDirection::Read,
                ))
            }
        }
    }

    loop {
        if let Some(path) = walk.ready.pop_front() {
            return Ok(Some((path, walk)));
        }

        let Some((dir, relative)) = walk.pending_dirs.pop() else {
            return Ok(None);
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // The base directory of a prefix does not have to exist.
            Err(e) if is_absent(&e) => continue,
            Err(e) => {
                return Err(Error::from_io(e, format!("list {}", dir.display()), IoDirection::Read))
            }
        };

        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| Error::from_io(e, format!("list {}", dir.display()), IoDirection::Read))?;
            let Some(entry) = entry else { break };

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                continue;
            };
            let child = if relative.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", relative, name)
            };

            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            // Symlinked files are listed; symlinked directories are not
            // descended into, so link cycles cannot repeat the walk.
            let is_file = if file_type.is_dir() {
                walk.pending_dirs.push((entry.path(), child));
                continue;
            } else if file_type.is_symlink() {
                matches!(fs::metadata(entry.path()).await, Ok(meta) if meta.is_file())
            } else {
                file_type.is_file()
            };

            if is_file && !is_partial_name(&name) && walk.filter.matches(&child) {
                walk.ready.push_back(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn provider(temp: &TempDir) -> LocalProvider {
        LocalProvider::new(LocalConfig {
            root: Some(temp.path().to_path_buf()),
        })
    }

    fn reader(data: &[u8]) -> ByteReader {
        Box::pin(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_local_write_read() {
        let temp = TempDir::new().unwrap();
        let provider = provider(&temp);
        let loc = StorageLocation::new("box", "docs/test.txt").unwrap();

        let written = provider.set_stream(reader(b"Hello, Local!"), &loc).await.unwrap();
        assert_eq!(written, 13);

        let mut out = Vec::new();
        provider.open_read(&loc).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"Hello, Local!");
        assert_eq!(provider.size(&loc).await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_local_replace_leaves_no_partial_files() {
        let temp = TempDir::new().unwrap();
        let provider = provider(&temp);
        let loc = StorageLocation::new("box", "a.txt").unwrap();

        provider.set_stream(reader(b"first version"), &loc).await.unwrap();
        provider.set_stream(reader(b"second"), &loc).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp.path().join("box"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt".to_string()]);
        assert_eq!(std::fs::read(temp.path().join("box/a.txt")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_local_missing_object() {
        let temp = TempDir::new().unwrap();
        let provider = provider(&temp);
        let loc = StorageLocation::new("box", "nope.txt").unwrap();

        assert!(!provider.exists(&loc).await.unwrap());
        assert!(provider.size(&loc).await.unwrap_err().is_not_found());
        assert!(provider.open_read(&loc).await.err().unwrap().is_not_found());
        provider.delete(&loc).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_directory_is_not_an_object() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("box/dir")).unwrap();
        let provider = provider(&temp);
        let loc = StorageLocation::new("box", "dir").unwrap();

        assert!(!provider.exists(&loc).await.unwrap());
        assert!(provider.size(&loc).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_local_list_recursive_and_filtered() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("box");
        std::fs::create_dir_all(root.join("a/deep")).unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("a/x.txt"), b"1").unwrap();
        std::fs::write(root.join("a/deep/y.csv"), b"2").unwrap();
        std::fs::write(root.join("b/z.txt"), b"3").unwrap();
        std::fs::write(root.join("a/.x.txt.0123.partial"), b"in flight").unwrap();
        let provider = provider(&temp);

        let mut all: Vec<String> = provider.list("box", None).try_collect().await.unwrap();
        all.sort();
        assert_eq!(all, vec!["a/deep/y.csv", "a/x.txt", "b/z.txt"]);

        let txt: Vec<String> = provider.list("box", Some("a/*.txt")).try_collect().await.unwrap();
        assert_eq!(txt, vec!["a/x.txt"]);

        let none: Vec<String> = provider.list("box", Some("missing/")).try_collect().await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_local_list_missing_container_fails() {
        let temp = TempDir::new().unwrap();
        let provider = provider(&temp);

        let result: Result<Vec<String>> = provider.list("ghost", None).try_collect().await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_local_file_typed_parent_is_absent() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("box")).unwrap();
        std::fs::write(temp.path().join("box/a.txt"), b"file").unwrap();
        let provider = provider(&temp);
        let loc = StorageLocation::new("box", "a.txt/b").unwrap();

        assert!(!provider.exists(&loc).await.unwrap());
        assert!(provider.size(&loc).await.unwrap_err().is_not_found());
        provider.delete(&loc).await.unwrap();

        let under_file: Vec<String> = provider.list("box", Some("a.txt/")).try_collect().await.unwrap();
        assert!(under_file.is_empty());
    }

    #[tokio::test]
    async fn test_local_container_stays_below_root() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("root");
        std::fs::create_dir_all(root.join("box")).unwrap();
        std::fs::create_dir_all(parent.path().join("secret")).unwrap();
        std::fs::write(parent.path().join("secret/key.txt"), b"hidden").unwrap();
        let provider = LocalProvider::new(LocalConfig { root: Some(root) });

        let outside = parent.path().join("secret").display().to_string();
        for container in ["../secret", "box/../../secret", outside.as_str()] {
            let loc = StorageLocation::new(container, "key.txt").unwrap();
            assert!(matches!(provider.exists(&loc).await, Err(Error::InvalidArgument(_))), "{container}");
            assert!(matches!(
                provider.set_stream(reader(b"planted"), &loc).await,
                Err(Error::InvalidArgument(_))
            ));
            assert!(matches!(provider.delete(&loc).await, Err(Error::InvalidArgument(_))));

            let listed: Result<Vec<String>> = provider.list(container, None).try_collect().await;
            assert!(matches!(listed, Err(Error::InvalidArgument(_))));
        }
        assert_eq!(std::fs::read(parent.path().join("secret/key.txt")).unwrap(), b"hidden");

        let nested = StorageLocation::new("box/./inner", "ok.txt").unwrap();
        provider.set_stream(reader(b"ok"), &nested).await.unwrap();
        assert!(provider.exists(&nested).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_without_root_takes_container_as_given() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(LocalConfig::default());
        let container = temp.path().display().to_string();
        let loc = StorageLocation::new(container.as_str(), "a.txt").unwrap();

        provider.set_stream(reader(b"abs"), &loc).await.unwrap();
        assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"abs");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_list_skips_symlinked_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("box");
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::write(root.join("a/x.txt"), b"1").unwrap();
        std::os::unix::fs::symlink(&root, root.join("a/loop")).unwrap();
        std::os::unix::fs::symlink(root.join("a/x.txt"), root.join("alias.txt")).unwrap();
        let provider = provider(&temp);

        let mut all: Vec<String> = provider.list("box", None).try_collect().await.unwrap();
        all.sort();
        assert_eq!(all, vec!["a/x.txt", "alias.txt"]);
    }

    #[test]
    fn test_partial_names() {
        let name = partial_name("report.csv");
        assert!(name.starts_with(".report.csv."));
        assert!(is_partial_name(&name));
        assert!(!is_partial_name("report.csv"));
    }
}

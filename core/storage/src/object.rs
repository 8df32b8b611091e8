//! Object store provider (S3, Azure Blob, in-memory).
//!
//! Wraps the `object_store` clients. A container is a bucket or a blob
//! container; one client is built per container on first use and shared by
//! every later call.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::buffered::BufWriter;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, ObjectStoreExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::provider::{ByteReader, ConnectionPolicy, DestinationProvider, PathStream, SourceProvider};
use crate::stream::copy_to_writer;
use vaultferry_common::{Error, IoDirection, ListFilter, Result, StorageLocation};

/// Default S3 region.
pub const DEFAULT_REGION: &str = "eu-west-2";

/// Uploads below this size go out as a single put, larger ones as multipart.
pub const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 10 * 1024 * 1024;

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_upload_chunk_bytes() -> usize {
    DEFAULT_UPLOAD_CHUNK_BYTES
}

/// Configuration for an S3 or S3-compatible object store.
///
/// Credentials left unset are resolved from the environment
/// (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, instance metadata).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible services (e.g. `http://localhost:9000`).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "[REDACTED]"))
            .field("endpoint", &self.endpoint)
            .field("upload_chunk_bytes", &self.upload_chunk_bytes)
            .finish()
    }
}

/// Configuration for an Azure Blob Storage account.
///
/// Credentials left unset are resolved from the environment
/// (`AZURE_STORAGE_*`, managed identity).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobConfig {
    /// `https://<account>.blob.core.windows.net`
    #[serde(default)]
    pub account_url: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    /// Talk to a local Azurite emulator.
    #[serde(default)]
    pub use_emulator: bool,
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,
}

impl fmt::Debug for BlobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobConfig")
            .field("account_url", &self.account_url)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .field("use_emulator", &self.use_emulator)
            .finish()
    }
}

/// In-process buckets. Clones share the same buckets, so a source and a
/// destination built from one `MemoryBuckets` see each other's writes.
#[derive(Clone, Default)]
pub struct MemoryBuckets {
    buckets: Arc<Mutex<HashMap<String, Arc<InMemory>>>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, name: &str) -> Arc<InMemory> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemory::new()))
            .clone()
    }
}

impl fmt::Debug for MemoryBuckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MemoryBuckets")
    }
}

/// Which client family an [`ObjectProvider`] builds.
#[derive(Debug, Clone)]
pub enum ObjectConnector {
    S3(S3Config),
    Blob(BlobConfig),
    Memory(MemoryBuckets),
}

impl ObjectConnector {
    fn kind(&self) -> &'static str {
        match self {
            ObjectConnector::S3(_) => "s3",
            ObjectConnector::Blob(_) => "blob",
            ObjectConnector::Memory(_) => "memory",
        }
    }

    fn upload_chunk_bytes(&self) -> usize {
        let configured = match self {
            ObjectConnector::S3(config) => config.upload_chunk_bytes,
            ObjectConnector::Blob(config) => config.upload_chunk_bytes,
            ObjectConnector::Memory(_) => DEFAULT_UPLOAD_CHUNK_BYTES,
        };
        configured.max(1)
    }

    /// Build a client bound to `container`.
    fn build(&self, container: &str) -> Result<Arc<dyn ObjectStore>> {
        match self {
            ObjectConnector::S3(config) => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_region(config.region.clone())
                    .with_bucket_name(container);

                if let Some(key_id) = &config.access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                if let Some(endpoint) = &config.endpoint {
                    let allow_http = endpoint.starts_with("http://");
                    builder = builder.with_endpoint(endpoint).with_allow_http(allow_http);
                }

                let store = builder
                    .build()
                    .map_err(|e| Error::Configuration(format!("S3 client for {}: {}", container, e)))?;
                Ok(Arc::new(store))
            }
            ObjectConnector::Blob(config) => {
                let mut builder = MicrosoftAzureBuilder::from_env().with_container_name(container);

                if let Some(url) = &config.account_url {
                    builder = builder.with_url(url);
                }
                if let Some(tenant_id) = &config.tenant_id {
                    builder = builder.with_tenant_id(tenant_id);
                }
                if let Some(client_id) = &config.client_id {
                    builder = builder.with_client_id(client_id);
                }
                if let Some(secret) = &config.client_secret {
                    builder = builder.with_client_secret(secret);
                }
                if let Some(access_key) = &config.access_key {
                    builder = builder.with_access_key(access_key);
                }
                if config.use_emulator {
                    builder = builder.with_use_emulator(true);
                }

                let store = builder
                    .build()
                    .map_err(|e| Error::Configuration(format!("Blob client for {}: {}", container, e)))?;
                Ok(Arc::new(store))
            }
            ObjectConnector::Memory(buckets) => Ok(buckets.bucket(container)),
        }
    }
}

/// Object store provider.
///
/// Clients are thread-safe and pooled per container for the lifetime of
/// the provider.
pub struct ObjectProvider {
    connector: ObjectConnector,
    clients: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectProvider {
    /// Create a provider. Clients are built lazily, per container.
    pub fn new(connector: ObjectConnector) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Provider backed by shared in-process buckets.
    pub fn in_memory(buckets: MemoryBuckets) -> Self {
        Self::new(ObjectConnector::Memory(buckets))
    }

    /// Client for `container`, built and cached on first use.
    fn client(&self, container: &str) -> Result<Arc<dyn ObjectStore>> {
        {
            let clients = self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(client) = clients.get(container) {
                return Ok(client.clone());
            }
        }

        let client = self.connector.build(container)?;
        let mut clients = self.clients.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let client = clients.entry(container.to_string()).or_insert(client).clone();
        debug!(kind = self.connector.kind(), container = %container, "Built object store client");
        Ok(client)
    }
}

/// Map an `object_store` failure onto the common taxonomy.
fn map_store_error(err: object_store::Error, location: &StorageLocation, direction: IoDirection) -> Error {
    let message = format!("{}: {}", location, err);
    match err {
        object_store::Error::NotFound { .. } => Error::NotFound(message),
        object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. } => {
            Error::AccessDenied(message)
        }
        _ => match direction {
            IoDirection::Read => Error::ReadFailed(message),
            IoDirection::Write => Error::WriteFailed(message),
        },
    }
}

fn is_marker(key: &str) -> bool {
    key.ends_with('/')
}

#[async_trait]
impl SourceProvider for ObjectProvider {
    fn name(&self) -> &str {
        self.connector.kind()
    }

    fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::Pooled
    }

    async fn exists(&self, location: &StorageLocation) -> Result<bool> {
        let client = self.client(location.container())?;
        match client.head(&ObjectPath::from(location.path())).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_store_error(e, location, IoDirection::Read)),
        }
    }

    async fn size(&self, location: &StorageLocation) -> Result<u64> {
        let client = self.client(location.container())?;
        let meta = client
            .head(&ObjectPath::from(location.path()))
            .await
            .map_err(|e| map_store_error(e, location, IoDirection::Read))?;
        Ok(meta.size)
    }

    async fn open_read(&self, location: &StorageLocation) -> Result<ByteReader> {
        let client = self.client(location.container())?;
        let result = client
            .get(&ObjectPath::from(location.path()))
            .await
            .map_err(|e| map_store_error(e, location, IoDirection::Read))?;

        let context = location.clone();
        let body = result.into_stream().map_err(move |e| {
            map_store_error(e, &context, IoDirection::Read).into_io()
        });

        debug!(location = %location, "Opened object stream");
        Ok(Box::pin(StreamReader::new(body)))
    }

    fn list(&self, container: &str, prefix: Option<&str>) -> PathStream {
        let filter = ListFilter::new(prefix);
        let client = match self.client(container) {
            Ok(client) => client,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        debug!(container = %container, base = %filter.base_dir(), "Listing objects");
        let base = if filter.base_dir().is_empty() {
            None
        } else {
            Some(ObjectPath::from(filter.base_dir()))
        };

        let container = container.to_string();
        client
            .list(base.as_ref())
            .map_err(move |e| {
                let message = format!("list {}: {}", container, e);
                match e {
                    object_store::Error::NotFound { .. } => Error::NotFound(message),
                    object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. } => Error::AccessDenied(message),
                    _ => Error::ReadFailed(message),
                }
            })
            .try_filter_map(move |meta| {
                let key = meta.location.to_string();
                let keep = !is_marker(&key) && filter.matches(&key);
                futures::future::ready(Ok(keep.then_some(key)))
            })
            .boxed()
    }
}

#[async_trait]
impl DestinationProvider for ObjectProvider {
    fn name(&self) -> &str {
        self.connector.kind()
    }

    fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::Pooled
    }

    async fn set_stream(&self, mut input: ByteReader, location: &StorageLocation) -> Result<u64> {
        let client = self.client(location.container())?;
        let path = ObjectPath::from(location.path());
        let context = format!("upload {}", location);

        let mut writer = BufWriter::with_capacity(client, path, self.connector.upload_chunk_bytes());

        let result = match copy_to_writer(&mut input, &mut writer, &context).await {
            Ok(written) => writer
                .shutdown()
                .await
                .map(|()| written)
                .map_err(|e| Error::from_io(e, &context, IoDirection::Write)),
            Err(e) => Err(e),
        };

        match result {
            Ok(written) => {
                debug!(location = %location, bytes = written, "Uploaded object");
                Ok(written)
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(location = %location, error = %abort_err, "Failed to abort upload");
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, location: &StorageLocation) -> Result<()> {
        let client = self.client(location.container())?;
        match client.delete(&ObjectPath::from(location.path())).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                debug!(location = %location, "Deleted object");
                Ok(())
            }
            Err(e) => Err(map_store_error(e, location, IoDirection::Write)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn reader(data: &[u8]) -> ByteReader {
        Box::pin(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_memory_buckets_are_shared() {
        let buckets = MemoryBuckets::new();
        let destination = ObjectProvider::in_memory(buckets.clone());
        let source = ObjectProvider::in_memory(buckets);
        let loc = StorageLocation::new("bucket", "a/b.txt").unwrap();

        destination.set_stream(reader(b"shared"), &loc).await.unwrap();

        assert!(source.exists(&loc).await.unwrap());
        let mut out = Vec::new();
        source.open_read(&loc).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"shared");
    }

    #[tokio::test]
    async fn test_multipart_upload_above_chunk_size() {
        let provider = ObjectProvider::in_memory(MemoryBuckets::new());
        let loc = StorageLocation::new("bucket", "big.bin").unwrap();
        let data = vec![0x5Au8; DEFAULT_UPLOAD_CHUNK_BYTES + 4096];

        let written = provider.set_stream(reader(&data), &loc).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(provider.size(&loc).await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_missing_object_mapping() {
        let provider = ObjectProvider::in_memory(MemoryBuckets::new());
        let loc = StorageLocation::new("bucket", "missing.txt").unwrap();

        assert!(!provider.exists(&loc).await.unwrap());
        assert!(provider.size(&loc).await.unwrap_err().is_not_found());
        assert!(provider.open_read(&loc).await.err().unwrap().is_not_found());
        provider.delete(&loc).await.unwrap();
    }

    #[test]
    fn test_client_is_cached_per_container() {
        let provider = ObjectProvider::in_memory(MemoryBuckets::new());
        let first = provider.client("one").unwrap();
        let again = provider.client("one").unwrap();
        let other = provider.client("two").unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_s3_client_builds_with_explicit_settings() {
        let connector = ObjectConnector::S3(S3Config {
            region: DEFAULT_REGION.to_string(),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            endpoint: Some("http://localhost:9000".to_string()),
            upload_chunk_bytes: DEFAULT_UPLOAD_CHUNK_BYTES,
        });
        assert!(connector.build("bucket").is_ok());
    }

    #[test]
    fn test_secrets_redacted_in_debug() {
        let config = BlobConfig {
            client_secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}

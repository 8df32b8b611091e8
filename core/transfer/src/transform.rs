//! Byte stream transforms applied between source and destination.

use tokio::io::AsyncReadExt;
use tracing::debug;

use vaultferry_common::{Error, IoDirection, Result, StorageLocation};
use vaultferry_crypto::{decrypt_reader, encrypt_reader, DataKey, KeyFile, DEFAULT_CHUNK_SIZE};
use vaultferry_storage::{ByteReader, SourceProvider};

/// Where key files conventionally live inside a container.
pub const DEFAULT_KEY_PATH: &str = "Keys/key.json";

/// Suffix appended to encrypted object names.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Key files are tiny; anything larger is not a key file.
const MAX_KEY_FILE_BYTES: u64 = 64 * 1024;

/// A stream-to-stream transformation.
///
/// `apply` only wires the transform up; the work happens as the returned
/// reader is consumed, and failures surface as read errors carrying the
/// original [`Error`].
pub trait StreamTransform: Send + Sync {
    /// Short name for logs (e.g. "encrypt").
    fn name(&self) -> &str;

    /// Wrap `input`.
    fn apply(&self, input: ByteReader) -> Result<ByteReader>;
}

/// Encrypts with a data key.
pub struct EncryptTransform {
    key: DataKey,
    chunk_size: usize,
}

impl EncryptTransform {
    pub fn new(key: DataKey) -> Self {
        Self {
            key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Use a non-default chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl StreamTransform for EncryptTransform {
    fn name(&self) -> &str {
        "encrypt"
    }

    fn apply(&self, input: ByteReader) -> Result<ByteReader> {
        Ok(Box::pin(encrypt_reader(input, self.key.clone(), self.chunk_size)?))
    }
}

/// Decrypts data produced by [`EncryptTransform`] with the same key.
pub struct DecryptTransform {
    key: DataKey,
}

impl DecryptTransform {
    pub fn new(key: DataKey) -> Self {
        Self { key }
    }
}

impl StreamTransform for DecryptTransform {
    fn name(&self) -> &str {
        "decrypt"
    }

    fn apply(&self, input: ByteReader) -> Result<ByteReader> {
        Ok(Box::pin(decrypt_reader(input, self.key.clone())))
    }
}

/// Read a key file through a source capability and open it.
///
/// # Errors
/// - `NotFound` if there is no key file at `location`
/// - `Serialization` if the object is not a key file
/// - `InvalidArgument` if the key is sealed and no passphrase is given
/// - `Crypto` for a wrong passphrase
pub async fn load_key(
    source: &dyn SourceProvider,
    location: &StorageLocation,
    passphrase: Option<&[u8]>,
) -> Result<DataKey> {
    let reader = source.open_read(location).await?;

    let mut bytes = Vec::new();
    reader
        .take(MAX_KEY_FILE_BYTES + 1)
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| Error::from_io(e, format!("read key file {}", location), IoDirection::Read))?;

    if bytes.len() as u64 > MAX_KEY_FILE_BYTES {
        return Err(Error::Serialization(format!("{} is too large to be a key file", location)));
    }

    let key_file = KeyFile::from_json(&bytes)?;
    let key = key_file.open(passphrase)?;
    debug!(location = %location, sealed = key_file.is_sealed(), "Loaded key file");
    Ok(key)
}

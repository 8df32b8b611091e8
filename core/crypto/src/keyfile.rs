//! Portable key files.
//!
//! A key file is a small JSON document that can live on any storage
//! backend next to the data it protects (for example `Keys/key.json` in the
//! source container). It either carries the key in the clear or sealed
//! under an Argon2id-derived wrapping key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::aead::{decrypt, encrypt};
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{DataKey, Salt, KEY_LENGTH, SALT_LENGTH};
use vaultferry_common::{Error, Result};

/// Current key file format version.
pub const KEYFILE_VERSION: u32 = 1;

/// How the key is stored inside the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protection", rename_all = "lowercase")]
pub enum KeyMaterial {
    /// Key stored base64-encoded. Protect the file itself.
    Plain { key: String },
    /// Key encrypted under a passphrase-derived key.
    Sealed {
        salt: String,
        kdf_params: KdfParams,
        wrapped_key: String,
    },
}

/// Serialized key file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    /// Fingerprint of the data key, see [`DataKey::fingerprint`].
    pub fingerprint: String,
    #[serde(flatten)]
    pub material: KeyMaterial,
}

impl KeyFile {
    /// Key file holding `key` in the clear.
    pub fn plain(key: &DataKey) -> Self {
        Self {
            version: KEYFILE_VERSION,
            fingerprint: key.fingerprint(),
            material: KeyMaterial::Plain {
                key: STANDARD.encode(key.as_bytes()),
            },
        }
    }

    /// Key file holding `key` sealed under `passphrase`.
    ///
    /// # Errors
    /// - Empty passphrase
    /// - Invalid KDF parameters
    pub fn sealed(key: &DataKey, passphrase: &[u8], params: KdfParams) -> Result<Self> {
        let salt = Salt::generate();
        let wrapping = derive_key(passphrase, &salt, &params)?;
        let wrapped = encrypt(wrapping.as_bytes(), key.as_bytes())?;

        Ok(Self {
            version: KEYFILE_VERSION,
            fingerprint: key.fingerprint(),
            material: KeyMaterial::Sealed {
                salt: STANDARD.encode(salt.as_bytes()),
                kdf_params: params,
                wrapped_key: STANDARD.encode(wrapped),
            },
        })
    }

    /// Whether a passphrase is needed to open this file.
    pub fn is_sealed(&self) -> bool {
        matches!(self.material, KeyMaterial::Sealed { .. })
    }

    /// Recover the data key.
    ///
    /// # Errors
    /// - `InvalidArgument` if the file is sealed and no passphrase is given
    /// - `Crypto` if the passphrase is wrong or the fingerprint does not match
    pub fn open(&self, passphrase: Option<&[u8]>) -> Result<DataKey> {
        if self.version != KEYFILE_VERSION {
            return Err(Error::Crypto(format!(
                "Unsupported key file version: {}",
                self.version
            )));
        }

        let key = match &self.material {
            KeyMaterial::Plain { key } => {
                let mut bytes = decode_b64(key, "key")?;
                let key = to_key(&bytes);
                bytes.zeroize();
                key?
            }
            KeyMaterial::Sealed {
                salt,
                kdf_params,
                wrapped_key,
            } => {
                let passphrase = passphrase.ok_or_else(|| {
                    Error::InvalidArgument("key file is sealed, a passphrase is required".to_string())
                })?;

                let salt_bytes = decode_b64(salt, "salt")?;
                let salt: [u8; SALT_LENGTH] = salt_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Serialization("salt has the wrong length".to_string()))?;

                let wrapping = derive_key(passphrase, &Salt::from_bytes(salt), kdf_params)?;
                let wrapped = decode_b64(wrapped_key, "wrapped_key")?;
                let mut bytes = decrypt(wrapping.as_bytes(), &wrapped)
                    .map_err(|_| Error::Crypto("wrong passphrase for key file".to_string()))?;
                let key = to_key(&bytes);
                bytes.zeroize();
                key?
            }
        };

        if !key.matches_fingerprint(&self.fingerprint) {
            return Err(Error::Crypto("key does not match its recorded fingerprint".to_string()));
        }
        Ok(key)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(format!("invalid key file: {}", e)))
    }
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::Serialization(format!("key file field '{}': {}", field, e)))
}

fn to_key(bytes: &[u8]) -> Result<DataKey> {
    let array: [u8; KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("key has the wrong length".to_string()))?;
    Ok(DataKey::from_bytes(array))
}

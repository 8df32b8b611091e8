//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of a KDF salt in bytes.
pub const SALT_LENGTH: usize = 32;

/// Symmetric key used by the stream transform.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_LENGTH],
}

impl DataKey {
    /// Create a data key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Generate a random data key.
    pub fn generate() -> Self {
        let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&generated);
        Self { key }
    }

    /// Short public identifier of this key (BLAKE2b-128, base64url).
    ///
    /// Stored in key files so a wrong key is reported as such instead of
    /// as an authentication failure halfway through a stream.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Blake2b::<U16>::new();
        hasher.update(b"vaultferry-key-id");
        hasher.update(self.key);
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Constant-time check against a stored fingerprint.
    pub fn matches_fingerprint(&self, fingerprint: &str) -> bool {
        let ours = self.fingerprint();
        ours.as_bytes().ct_eq(fingerprint.as_bytes()).into()
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// Key derived from a passphrase, used only to wrap a [`DataKey`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    key: [u8; KEY_LENGTH],
}

impl WrappingKey {
    /// Create a wrapping key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappingKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

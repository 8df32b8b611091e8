//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{Salt, WrappingKey, KEY_LENGTH};
use vaultferry_common::{Error, Result};

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Explicit parameters.
    pub fn new(memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            memory_cost,
            time_cost,
            parallelism,
        }
    }

    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self::new(65536, 3, 4)
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self::new(262144, 4, 4)
    }

    /// Create moderate parameters for constrained hosts.
    pub fn moderate() -> Self {
        Self::new(32768, 3, 2)
    }

    /// Look up a named preset.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "interactive" => Ok(Self::interactive()),
            "moderate" => Ok(Self::moderate()),
            "sensitive" => Ok(Self::sensitive()),
            other => Err(Error::InvalidArgument(format!(
                "unknown KDF strength '{}', use interactive, moderate or sensitive",
                other
            ))),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a wrapping key from a passphrase and salt using Argon2id.
///
/// # Preconditions
/// - `passphrase` must not be empty
/// - `params` must have valid Argon2id parameters
///
/// # Errors
/// - Returns `InvalidArgument` if the passphrase is empty
/// - Returns `Crypto` if Argon2id parameters are invalid
pub fn derive_key(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<WrappingKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidArgument("Passphrase cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(passphrase, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(WrappingKey::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams::new(64, 1, 1)
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::from_bytes([42u8; 32]);

        let key1 = derive_key(b"test-password-123", &salt, &fast()).unwrap();
        let key2 = derive_key(b"test-password-123", &salt, &fast()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_salt() {
        let key1 = derive_key(b"pw", &Salt::from_bytes([1u8; 32]), &fast()).unwrap();
        let key2 = derive_key(b"pw", &Salt::from_bytes([2u8; 32]), &fast()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_empty_password_fails() {
        let result = derive_key(b"", &Salt::generate(), &fast());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_named_presets() {
        assert_eq!(KdfParams::from_name("moderate").unwrap(), KdfParams::moderate());
        assert!(KdfParams::from_name("extreme").is_err());
    }
}

//! Cryptographic transform for vaultferry transfers.
//!
//! This module provides:
//! - Key derivation using Argon2id (for passphrase-sealed key files)
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Key files that can be stored next to the data on any backend
//! - Chunked streaming encryption over `AsyncRead`
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time comparison for key fingerprints

pub mod aead;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod stream;

pub use aead::{decrypt, encrypt};
pub use kdf::{derive_key, KdfParams};
pub use keyfile::{KeyFile, KeyMaterial};
pub use keys::{DataKey, Salt, WrappingKey};
pub use stream::{decrypt_reader, encrypt_reader, CipherReader, DEFAULT_CHUNK_SIZE};

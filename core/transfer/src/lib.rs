//! Streaming transfers between storage backends.
//!
//! A pipeline reads an object through the source capability, optionally
//! passes the byte stream through a transform (encryption or decryption),
//! and hands the result to the destination capability. Objects move one at
//! a time and are never buffered whole by the pipeline itself.

pub mod pipeline;
pub mod transform;

pub use pipeline::{BatchFailure, TransferPipeline, TransferReport};
pub use transform::{
    load_key, DecryptTransform, EncryptTransform, StreamTransform, DEFAULT_KEY_PATH, ENCRYPTED_SUFFIX,
};

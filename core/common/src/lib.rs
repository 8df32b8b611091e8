//! Common utilities and types shared across vaultferry modules.
//!
//! This module provides the error taxonomy every storage adapter maps onto
//! and the backend-neutral addressing types.

pub mod error;
pub mod types;

pub use error::{Error, IoDirection, Result};
pub use types::{ListFilter, StorageLocation};

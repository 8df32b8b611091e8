//! Storage capability abstraction for vaultferry.
//!
//! This module provides the Source and Destination capability traits, the
//! backend adapters that implement them (local filesystem, SFTP, S3 and
//! Azure Blob through `object_store`) and a registry that wires adapters to
//! roles from configuration.
//!
//! # Design Principles
//! - Capability split: reading and writing are separate traits, wired
//!   independently
//! - Async operations: all I/O operations are async
//! - Streaming support: objects move as `AsyncRead` streams, listings as
//!   lazy streams
//! - Unified error semantics: every adapter maps onto the common taxonomy

pub mod config;
pub mod local;
pub mod object;
pub mod provider;
pub mod registry;
pub mod sftp;
pub mod stream;

pub use config::{BackendConfig, BackendEntry, FerryConfig, Role};
pub use local::{LocalConfig, LocalProvider};
pub use object::{BlobConfig, MemoryBuckets, ObjectConnector, ObjectProvider, S3Config};
pub use provider::{ByteReader, ConnectionPolicy, DestinationProvider, PathStream, SourceProvider};
pub use registry::{create_default_registry, BackendFactory, ProviderRegistry, Wiring};
pub use sftp::{DirectoryConnector, RemoteSession, SftpConfig, SftpConnector, SftpProvider};

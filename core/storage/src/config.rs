//! Backend configuration.
//!
//! A configuration file lists backends and the role(s) each one plays:
//!
//! ```json
//! {
//!   "backends": [
//!     { "name": "inbox", "kind": "sftp", "roles": ["source"],
//!       "host": "sftp.example.com", "username": "ferry", "password": "..." },
//!     { "name": "vault", "kind": "s3", "roles": ["destination"],
//!       "region": "eu-west-2" }
//!   ]
//! }
//! ```
//!
//! Values are only checked for presence here; anything malformed surfaces
//! from the backend client on first use.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::local::LocalConfig;
use crate::object::{BlobConfig, S3Config};
use crate::sftp::SftpConfig;
use vaultferry_common::{Error, Result};

/// Capability a backend is wired into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Destination => f.write_str("destination"),
        }
    }
}

/// Backend kind and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalConfig),
    Sftp(SftpConfig),
    S3(S3Config),
    Blob(BlobConfig),
    /// In-process buckets, shared by every memory backend of one registry.
    Memory,
}

impl BackendConfig {
    /// Registry key for this backend kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Local(_) => "local",
            BackendConfig::Sftp(_) => "sftp",
            BackendConfig::S3(_) => "s3",
            BackendConfig::Blob(_) => "blob",
            BackendConfig::Memory => "memory",
        }
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    pub roles: Vec<Role>,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

impl BackendEntry {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    pub backends: Vec<BackendEntry>,
}

impl FerryConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate JSON configuration text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::Serialization(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check names and roles.
    ///
    /// # Errors
    /// - `Configuration` for duplicate or empty names, an entry without
    ///   roles, or a role that is not served by exactly one backend
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for entry in &self.backends {
            if entry.name.trim().is_empty() {
                return Err(Error::Configuration("backend name cannot be empty".to_string()));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(Error::Configuration(format!("duplicate backend name '{}'", entry.name)));
            }
            if entry.roles.is_empty() {
                return Err(Error::Configuration(format!(
                    "backend '{}' must request the source role, the destination role or both",
                    entry.name
                )));
            }
        }

        for role in [Role::Source, Role::Destination] {
            self.backend_for(role)?;
        }
        Ok(())
    }

    /// The backend serving `role`.
    pub fn backend_for(&self, role: Role) -> Result<&BackendEntry> {
        let mut matching = self.backends.iter().filter(|entry| entry.has_role(role));
        let first = matching
            .next()
            .ok_or_else(|| Error::Configuration(format!("no backend serves the {} role", role)))?;
        if let Some(second) = matching.next() {
            return Err(Error::Configuration(format!(
                "backends '{}' and '{}' both serve the {} role",
                first.name, second.name, role
            )));
        }
        Ok(first)
    }
}

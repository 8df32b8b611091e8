//! Provider registry and role wiring.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{BackendConfig, BackendEntry, FerryConfig, Role};
use crate::local::LocalProvider;
use crate::object::{MemoryBuckets, ObjectConnector, ObjectProvider};
use crate::provider::{DestinationProvider, SourceProvider};
use crate::sftp::SftpProvider;
use vaultferry_common::{Error, Result};

/// Builds a source adapter from configuration.
pub type SourceFactory = Box<dyn Fn(&BackendConfig) -> Result<Arc<dyn SourceProvider>> + Send + Sync>;

/// Builds a destination adapter from configuration.
pub type DestinationFactory =
    Box<dyn Fn(&BackendConfig) -> Result<Arc<dyn DestinationProvider>> + Send + Sync>;

/// Factories for both roles of one backend kind.
pub struct BackendFactory {
    source: SourceFactory,
    destination: DestinationFactory,
}

impl BackendFactory {
    pub fn new(source: SourceFactory, destination: DestinationFactory) -> Self {
        Self { source, destination }
    }

    /// Factory pair from one constructor of a type that serves both roles.
    ///
    /// Each call builds a fresh, independent instance.
    pub fn from_constructor<P, F>(constructor: F) -> Self
    where
        P: SourceProvider + DestinationProvider + 'static,
        F: Fn(&BackendConfig) -> Result<P> + Send + Sync + 'static,
    {
        let constructor = Arc::new(constructor);
        let for_destination = constructor.clone();

        Self {
            source: Box::new(move |config| {
                let provider: Arc<dyn SourceProvider> = Arc::new(constructor(config)?);
                Ok(provider)
            }),
            destination: Box::new(move |config| {
                let provider: Arc<dyn DestinationProvider> = Arc::new(for_destination(config)?);
                Ok(provider)
            }),
        }
    }
}

/// Registry for backend factories.
///
/// Allows dynamic registration and resolution of adapters by backend kind
/// and role.
pub struct ProviderRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Errors
    /// - Returns `Configuration` if the name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Register a backend whose adapter serves both roles.
    pub fn register_backend<P, F>(&mut self, name: impl Into<String>, constructor: F) -> Result<()>
    where
        P: SourceProvider + DestinationProvider + 'static,
        F: Fn(&BackendConfig) -> Result<P> + Send + Sync + 'static,
    {
        self.register(name, BackendFactory::from_constructor(constructor))
    }

    fn factory(&self, kind: &str) -> Result<&BackendFactory> {
        self.factories
            .get(kind)
            .ok_or_else(|| Error::Configuration(format!("Backend '{}' is not registered", kind)))
    }

    /// Build a source adapter for `entry`.
    ///
    /// # Errors
    /// - Entry does not request the source role
    /// - Backend kind not registered
    /// - Configuration rejected by the adapter
    pub fn resolve_source(&self, entry: &BackendEntry) -> Result<Arc<dyn SourceProvider>> {
        require_role(entry, Role::Source)?;
        (self.factory(entry.backend.kind())?.source)(&entry.backend)
    }

    /// Build a destination adapter for `entry`.
    ///
    /// # Errors
    /// Same as [`resolve_source`](Self::resolve_source), for the
    /// destination role.
    pub fn resolve_destination(&self, entry: &BackendEntry) -> Result<Arc<dyn DestinationProvider>> {
        require_role(entry, Role::Destination)?;
        (self.factory(entry.backend.kind())?.destination)(&entry.backend)
    }

    /// Get list of registered backend kinds.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a backend kind is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

fn require_role(entry: &BackendEntry, role: Role) -> Result<()> {
    if entry.has_role(role) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "backend '{}' is not configured for the {} role",
            entry.name, role
        )))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatch(expected: &str, config: &BackendConfig) -> Error {
    Error::Configuration(format!(
        "{} factory cannot build a '{}' backend",
        expected,
        config.kind()
    ))
}

/// Create a registry with the built-in backends.
///
/// Every `memory` backend built from this registry shares one set of
/// in-process buckets.
pub fn create_default_registry() -> ProviderRegistry {
    let buckets = MemoryBuckets::new();
    let mut registry = ProviderRegistry::new();

    let builtin: [(&str, BackendFactory); 5] = [
        (
            "local",
            BackendFactory::from_constructor(|config| match config {
                BackendConfig::Local(local) => Ok(LocalProvider::new(local.clone())),
                other => Err(mismatch("local", other)),
            }),
        ),
        (
            "sftp",
            BackendFactory::from_constructor(|config| match config {
                BackendConfig::Sftp(sftp) => SftpProvider::new(sftp.clone()),
                other => Err(mismatch("sftp", other)),
            }),
        ),
        (
            "s3",
            BackendFactory::from_constructor(|config| match config {
                BackendConfig::S3(s3) => Ok(ObjectProvider::new(ObjectConnector::S3(s3.clone()))),
                other => Err(mismatch("s3", other)),
            }),
        ),
        (
            "blob",
            BackendFactory::from_constructor(|config| match config {
                BackendConfig::Blob(blob) => Ok(ObjectProvider::new(ObjectConnector::Blob(blob.clone()))),
                other => Err(mismatch("blob", other)),
            }),
        ),
        (
            "memory",
            BackendFactory::from_constructor(move |config| match config {
                BackendConfig::Memory => Ok(ObjectProvider::in_memory(buckets.clone())),
                other => Err(mismatch("memory", other)),
            }),
        ),
    ];

    for (name, factory) in builtin {
        registry.factories.insert(name.to_string(), factory);
    }
    registry
}

/// Adapters wired to the source and destination roles.
pub struct Wiring {
    pub source: Arc<dyn SourceProvider>,
    pub destination: Arc<dyn DestinationProvider>,
    /// Name of the configured backend serving the source role.
    pub source_backend: String,
    /// Name of the configured backend serving the destination role.
    pub destination_backend: String,
}

impl Wiring {
    /// Instantiate the adapters a configuration asks for.
    ///
    /// A backend serving both roles yields two independent instances.
    /// Only requested roles are ever built.
    pub fn from_config(registry: &ProviderRegistry, config: &FerryConfig) -> Result<Self> {
        config.validate()?;

        let source_entry = config.backend_for(Role::Source)?;
        let source = registry.resolve_source(source_entry)?;
        debug!(backend = %source_entry.name, kind = source.name(), policy = %source.connection_policy(), "Wired source");

        let destination_entry = config.backend_for(Role::Destination)?;
        let destination = registry.resolve_destination(destination_entry)?;
        debug!(
            backend = %destination_entry.name,
            kind = destination.name(),
            policy = %destination.connection_policy(),
            "Wired destination"
        );

        Ok(Self {
            source,
            destination,
            source_backend: source_entry.name.clone(),
            destination_backend: destination_entry.name.clone(),
        })
    }

    /// Whether one backend serves both roles, so that equal locations on
    /// either side name the same object.
    pub fn shares_backend(&self) -> bool {
        self.source_backend == self.destination_backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalConfig;
    use crate::provider::ConnectionPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(name: &str, roles: &[Role], backend: BackendConfig) -> BackendEntry {
        BackendEntry {
            name: name.to_string(),
            roles: roles.to_vec(),
            backend,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ProviderRegistry::new();
        registry
            .register_backend("local", |_| Ok(LocalProvider::new(LocalConfig::default())))
            .unwrap();

        let disk = entry(
            "disk",
            &[Role::Source, Role::Destination],
            BackendConfig::Local(LocalConfig::default()),
        );
        assert_eq!(registry.resolve_source(&disk).unwrap().name(), "local");
        assert_eq!(registry.resolve_destination(&disk).unwrap().name(), "local");
    }

    #[test]
    fn test_resolve_respects_roles() {
        let registry = create_default_registry();

        let inbox = entry("inbox", &[Role::Source], BackendConfig::Memory);
        assert!(registry.resolve_source(&inbox).is_ok());
        match registry.resolve_destination(&inbox) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("inbox")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("source-only backend resolved as a destination"),
        }

        let outbox = entry("outbox", &[Role::Destination], BackendConfig::Memory);
        assert!(registry.resolve_destination(&outbox).is_ok());
        assert!(matches!(registry.resolve_source(&outbox), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();
        registry
            .register_backend("local", |_| Ok(LocalProvider::new(LocalConfig::default())))
            .unwrap();

        let result = registry.register_backend("local", |_| Ok(LocalProvider::new(LocalConfig::default())));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = ProviderRegistry::new();
        let result = registry.resolve_source(&entry("m", &[Role::Source], BackendConfig::Memory));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_default_registry_kinds() {
        let registry = create_default_registry();
        for kind in ["local", "sftp", "s3", "blob", "memory"] {
            assert!(registry.has_provider(kind), "missing {kind}");
        }
        assert_eq!(registry.providers().len(), 5);
    }

    #[test]
    fn test_wiring_builds_only_requested_roles() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();

        let mut registry = ProviderRegistry::new();
        registry
            .register_backend("memory", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ObjectProvider::in_memory(MemoryBuckets::new()))
            })
            .unwrap();

        let config = FerryConfig::from_json(
            r#"{ "backends": [ { "name": "m", "kind": "memory", "roles": ["source", "destination"] } ] }"#,
        )
        .unwrap();

        let wiring = Wiring::from_config(&registry, &config).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(wiring.shares_backend());
        assert_eq!(wiring.source.connection_policy(), ConnectionPolicy::Pooled);
        assert_eq!(wiring.destination.name(), "memory");
    }

    #[test]
    fn test_invalid_sftp_config_fails_at_wiring() {
        let registry = create_default_registry();
        let config = FerryConfig::from_json(
            r#"{ "backends": [
                { "name": "src", "kind": "sftp", "roles": ["source"], "host": "", "username": "u", "password": "p" },
                { "name": "dst", "kind": "memory", "roles": ["destination"] }
            ] }"#,
        )
        .unwrap();

        let result = Wiring::from_config(&registry, &config);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_wiring_records_backend_names() {
        let registry = create_default_registry();
        let config = FerryConfig::from_json(
            r#"{ "backends": [
                { "name": "in", "kind": "memory", "roles": ["source"] },
                { "name": "out", "kind": "memory", "roles": ["destination"] }
            ] }"#,
        )
        .unwrap();

        let wiring = Wiring::from_config(&registry, &config).unwrap();
        assert_eq!(wiring.source_backend, "in");
        assert_eq!(wiring.destination_backend, "out");
        assert!(!wiring.shares_backend());
    }
}

//! # Configuration
//!
//! `mergegraph.toml` loading. Every section is optional; missing keys fall
//! back to their defaults and CLI flags override whatever the file says.
//!
//! ```toml
//! [storage]
//! backend = "redb"          # or "memory"
//! path = "mergegraph.db"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 50
//! max_backoff_ms = 2000
//! verbose = false
//!
//! [schema]
//! path = "schema.toml"      # optional, replaces the built-in registry
//!
//! [identity]
//! cache_capacity = 10000
//! ```

use mergegraph_core::primitives::DEFAULT_CACHE_CAPACITY;
use mergegraph_core::{
    MemoryGraph, MergeGraphError, RedbGraph, RetryPolicy, SchemaRegistry, Session, StorageBackend,
};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default database path when neither the file nor the flags name one.
pub const DEFAULT_DATABASE: &str = "mergegraph.db";

// =============================================================================
// SECTIONS
// =============================================================================

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Volatile, lives for one command.
    Memory,
    /// redb database file.
    #[default]
    Redb,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redb => f.write_str("redb"),
        }
    }
}

impl FromStr for Backend {
    type Err = MergeGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "redb" => Ok(Self::Redb),
            other => Err(MergeGraphError::InvalidRequest(format!(
                "unknown backend '{other}', expected memory or redb"
            ))),
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: Backend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: PathBuf::from(DEFAULT_DATABASE),
        }
    }
}

/// `[schema]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaConfig {
    /// Entity schema document replacing the built-in registry.
    pub path: Option<PathBuf>,
}

/// `[identity]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    pub cache_capacity: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub retry: RetryPolicy,
    pub schema: SchemaConfig,
    pub identity: IdentityConfig,
}

impl Config {
    /// Parse a configuration document.
    pub fn from_toml(source: &str) -> Result<Self, MergeGraphError> {
        toml::from_str(source)
            .map_err(|e| MergeGraphError::InvalidRequest(format!("invalid config: {e}")))
    }

    /// Load the file at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, MergeGraphError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MergeGraphError::InvalidRequest(format!(
                "cannot read config '{}': {e}",
                path.display()
            ))
        })?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), backend = %config.storage.backend, "loaded config");
        Ok(config)
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(
        mut self,
        database: Option<PathBuf>,
        backend: Option<Backend>,
        verbose: bool,
    ) -> Self {
        if let Some(database) = database {
            self.storage.path = database;
        }
        if let Some(backend) = backend {
            self.storage.backend = backend;
        }
        self.retry.verbose |= verbose;
        self
    }

    /// The configured schema registry.
    pub fn schemas(&self) -> Result<SchemaRegistry, MergeGraphError> {
        match &self.schema.path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    MergeGraphError::InvalidRequest(format!(
                        "cannot read schema '{}': {e}",
                        path.display()
                    ))
                })?;
                SchemaRegistry::from_toml(&raw)
            }
            None => SchemaRegistry::builtin(),
        }
    }

    /// Open a session with the configured store, schema, retry policy and
    /// cache.
    pub fn open_session(&self) -> Result<Session, MergeGraphError> {
        let store = match self.storage.backend {
            Backend::Memory => StorageBackend::InMemory(MemoryGraph::new()),
            Backend::Redb => StorageBackend::Persistent(RedbGraph::open(&self.storage.path)?),
        };
        Ok(Session::new(store, self.schemas()?)
            .with_retry_policy(self.retry.clone())
            .with_cache_capacity(self.identity.cache_capacity))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_toml("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.storage.backend, Backend::Redb);
        assert_eq!(config.identity.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn full_document() {
        let config = Config::from_toml(
            r#"
            [storage]
            backend = "memory"
            path = "/tmp/graph.db"

            [retry]
            max_attempts = 5
            verbose = true

            [identity]
            cache_capacity = 12
            "#,
        )
        .expect("parse");

        assert_eq!(config.storage.backend, Backend::Memory);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/graph.db"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 50);
        assert!(config.retry.verbose);
        assert_eq!(config.identity.cache_capacity, 12);
        assert!(config.schema.path.is_none());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(Config::from_toml("[storage]\nbackend = \"redb\"\nport = 1\n").is_err());
        assert!(Config::from_toml("[storage]\nbackend = \"postgres\"\n").is_err());
    }

    #[test]
    fn flags_override_file() {
        let config = Config::default().with_overrides(
            Some(PathBuf::from("other.db")),
            Some(Backend::Memory),
            true,
        );
        assert_eq!(config.storage.path, PathBuf::from("other.db"));
        assert_eq!(config.storage.backend, Backend::Memory);
        assert!(config.retry.verbose);
    }

    #[test]
    fn backend_from_str() {
        assert_eq!("redb".parse::<Backend>().expect("parse"), Backend::Redb);
        assert!(matches!(
            "file".parse::<Backend>(),
            Err(MergeGraphError::InvalidRequest(_))
        ));
    }

    #[test]
    fn missing_schema_file_is_reported() {
        let mut config = Config::default();
        config.schema.path = Some(PathBuf::from("/nonexistent/schema.toml"));
        assert!(matches!(
            config.schemas(),
            Err(MergeGraphError::InvalidRequest(_))
        ));
    }

    #[test]
    fn memory_session_opens() {
        let config = Config::default().with_overrides(None, Some(Backend::Memory), false);
        let session = config.open_session().expect("session");
        assert!(!session.is_persistent());
    }
}

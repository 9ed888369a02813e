// Engine Configuration
// JSON settings for the engine plus the on-disk list of saved connections

use crate::db::{AdapterRegistry, CallOptions, Connection, ConnectionParams, DatabaseError};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per page when a caller does not pick a size
    pub page_size: usize,
    /// Rows buffered between a backend's producer task and the reader
    pub row_buffer: usize,
    pub log: LogConfig,
    /// Defaults for every call started through a configured connection
    pub call: CallOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            row_buffer: 256,
            log: LogConfig::default(),
            call: CallOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&json)?;
        debug!(path = %path.as_ref().display(), "loaded engine configuration");
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "page_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.row_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "row_buffer",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.call.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call.batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Built-in adapters sized by this configuration
    pub fn adapter_registry(&self) -> AdapterRegistry {
        AdapterRegistry::with_row_buffer(self.row_buffer)
    }

    /// Build a (not yet connected) connection that runs calls with these defaults
    pub fn connection(&self, params: ConnectionParams, registry: &AdapterRegistry) -> ConfigResult<Connection> {
        Ok(Connection::from_registry(params, registry)?.with_call_options(self.call.clone()))
    }
}

/// Saved connections, kept as a JSON array of unexpanded [`ConnectionParams`]
pub struct ConnectionStore {
    path: PathBuf,
    connections: Vec<ConnectionParams>,
}

impl ConnectionStore {
    /// Load the store at `path`. A missing file is an empty store; entries
    /// without an id get a fresh one.
    pub fn load(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let mut connections: Vec<ConnectionParams> = match std::fs::read_to_string(&path) {
            Ok(json) if json.trim().is_empty() => Vec::new(),
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        for params in connections.iter_mut().filter(|p| p.id.is_empty()) {
            params.id = uuid::Uuid::new_v4().to_string();
        }

        info!(path = %path.display(), count = connections.len(), "loaded saved connections");
        Ok(Self { path, connections })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[ConnectionParams] {
        &self.connections
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionParams> {
        self.connections.iter().find(|p| p.id == id)
    }

    /// Add or replace (matched by id) a saved connection and persist the store
    pub fn upsert(&mut self, mut params: ConnectionParams) -> ConfigResult<String> {
        if params.id.is_empty() {
            params.id = uuid::Uuid::new_v4().to_string();
        }
        let id = params.id.clone();

        match self.connections.iter_mut().find(|p| p.id == id) {
            Some(existing) => *existing = params,
            None => self.connections.push(params),
        }
        self.save()?;
        Ok(id)
    }

    /// Remove a saved connection and persist the store
    pub fn remove(&mut self, id: &str) -> ConfigResult<ConnectionParams> {
        let index = self
            .connections
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ConfigError::NotFound(id.to_string()))?;
        let removed = self.connections.remove(index);
        self.save()?;
        Ok(removed)
    }

    pub fn save(&self) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.connections)?;
        std::fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), count = self.connections.len(), "saved connections");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DrainMode;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = EngineConfig::from_json(r#"{"page_size": 50}"#).unwrap();

        assert_eq!(config.page_size, 50);
        assert_eq!(config.row_buffer, 256);
        assert_eq!(config.call, CallOptions::default());
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_nested_sections() {
        let config = EngineConfig::from_json(
            r#"{"log": {"level": "debug"}, "call": {"drain": "background", "row_limit": 1000}}"#,
        )
        .unwrap();

        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.call.drain, DrainMode::Background);
        assert_eq!(config.call.row_limit, Some(1000));
        assert_eq!(config.call.batch_size, CallOptions::default().batch_size);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"page_size": 0}"#),
            Err(ConfigError::InvalidValue { field: "page_size", .. })
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"call": {"batch_size": 0}}"#),
            Err(ConfigError::InvalidValue { field: "call.batch_size", .. })
        ));
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"row_buffer": 8}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.row_buffer, 8);
        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_connection_uses_registry_and_call_defaults() {
        let config = EngineConfig::default();
        let registry = config.adapter_registry();

        let conn = config
            .connection(ConnectionParams::new("local", "sqlite", "sqlite::memory:"), &registry)
            .unwrap();
        assert_eq!(conn.kind(), "sqlite");

        let unknown = config.connection(ConnectionParams::new("x", "oracle", "oracle://db"), &registry);
        assert!(matches!(
            unknown,
            Err(ConfigError::Database(DatabaseError::UnknownBackend(_)))
        ));
    }

    #[test]
    fn test_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ConnectionStore::load(dir.path().join("connections.json")).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_store_assigns_missing_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "local", "type": "sqlite", "url": "sqlite::memory:"},
                {"id": "fixed", "name": "pg", "type": "postgres", "url": "postgres://{{ env \"PGHOST\" }}/app"}
            ]"#,
        )
        .unwrap();

        let store = ConnectionStore::load(&path).unwrap();
        assert_eq!(store.list().len(), 2);
        assert!(!store.list()[0].id.is_empty());
        // Templated URLs are kept as written
        assert_eq!(store.get("fixed").unwrap().url, "postgres://{{ env \"PGHOST\" }}/app");
    }

    #[test]
    fn test_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("connections.json");

        let mut store = ConnectionStore::load(&path).unwrap();
        let id = store
            .upsert(ConnectionParams::new("local", "sqlite", "sqlite::memory:"))
            .unwrap();
        store
            .upsert(ConnectionParams::new("other", "sqlite", "sqlite:///tmp/other.db"))
            .unwrap();

        let mut renamed = store.get(&id).unwrap().clone();
        renamed.name = "renamed".to_string();
        store.upsert(renamed).unwrap();

        let reloaded = ConnectionStore::load(&path).unwrap();
        assert_eq!(reloaded.list().len(), 2);
        assert_eq!(reloaded.get(&id).unwrap().name, "renamed");

        let mut reloaded = reloaded;
        reloaded.remove(&id).unwrap();
        assert!(matches!(reloaded.remove(&id), Err(ConfigError::NotFound(_))));
        assert_eq!(ConnectionStore::load(&path).unwrap().list().len(), 1);
    }
}

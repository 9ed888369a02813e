// Adapter Registry
// Maps backend type names (and their aliases) to the adapters that connect to them

use crate::db::drivers::{MssqlAdapter, PostgresAdapter, SqliteAdapter};
use crate::db::traits::{Adapter, DatabaseError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Registry for resolving backend types to adapters.
///
/// Populated once at start-up and shared by `Arc` afterwards. Keys are
/// case-insensitive.
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the sqlite, postgres and sqlserver adapters
    pub fn with_builtin_adapters() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SqliteAdapter::new()), "sqlite", &["sqlite3"]);
        registry.register(Arc::new(PostgresAdapter::new()), "postgres", &["postgresql", "pg"]);
        registry.register(Arc::new(MssqlAdapter::new()), "sqlserver", &["mssql"]);
        registry
    }

    /// Built-in adapters, with `row_buffer` rows buffered between the
    /// backends that produce rows on their own task and the reader
    pub fn with_row_buffer(row_buffer: usize) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SqliteAdapter::with_row_buffer(row_buffer)), "sqlite", &["sqlite3"]);
        registry.register(Arc::new(PostgresAdapter::new()), "postgres", &["postgresql", "pg"]);
        registry.register(Arc::new(MssqlAdapter::with_row_buffer(row_buffer)), "sqlserver", &["mssql"]);
        registry
    }

    /// Register `adapter` under `name` and every alias.
    ///
    /// # Panics
    ///
    /// If any of the keys is already taken. Registration happens while the
    /// process is wiring itself up, so a clash is a programming error.
    pub fn register(&self, adapter: Arc<dyn Adapter>, name: &str, aliases: &[&str]) {
        if let Err(e) = self.try_register(adapter, name, aliases) {
            panic!("{}", e);
        }
    }

    /// Like [`register`](Self::register), but reports a clash instead of
    /// panicking. Nothing is registered when any key clashes.
    pub fn try_register(
        &self,
        adapter: Arc<dyn Adapter>,
        name: &str,
        aliases: &[&str],
    ) -> Result<(), DatabaseError> {
        let keys: Vec<String> = std::iter::once(name)
            .chain(aliases.iter().copied())
            .map(normalize)
            .collect();

        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        if let Some(taken) = keys.iter().find(|key| adapters.contains_key(*key)) {
            return Err(DatabaseError::DuplicateAdapter(taken.clone()));
        }

        for key in keys {
            adapters.insert(key, Arc::clone(&adapter));
        }
        debug!(name, ?aliases, "registered adapter");
        Ok(())
    }

    /// Adapter registered for `kind`
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn Adapter>, DatabaseError> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        adapters
            .get(&normalize(kind))
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownBackend(kind.to_string()))
    }

    /// Check if an adapter is registered for a given type
    pub fn has_adapter(&self, kind: &str) -> bool {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        adapters.contains_key(&normalize(kind))
    }

    /// Every registered name and alias, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = adapters.keys().cloned().collect();
        types.sort();
        types
    }

    /// Remove a single key (useful for testing)
    pub fn unregister(&self, kind: &str) -> bool {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        adapters.remove(&normalize(kind)).is_some()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(kind: &str) -> String {
    kind.trim().to_lowercase()
}

// Driver Capability Model
// Defines the contracts every database backend must satisfy, plus optional capabilities

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::db::stream::ResultStream;

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection not established")]
    NotConnected,

    #[error("Database switching not supported")]
    SwitchingNotSupported,

    #[error("No such backend type: {0}")]
    UnknownBackend(String),

    #[error("Adapter already registered under name: {0}")]
    DuplicateAdapter(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Query execution error: {0}")]
    QueryError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("{operation}: {source}")]
    Context {
        operation: &'static str,
        #[source]
        source: Box<DatabaseError>,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("MS-SQL error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DatabaseError {
    /// Wrap this error with the name of the operation that produced it
    pub fn context(self, operation: &'static str) -> Self {
        DatabaseError::Context {
            operation,
            source: Box::new(self),
        }
    }

    /// True when the failure means "capability missing", not "operation failed"
    pub fn is_not_supported(&self) -> bool {
        match self {
            DatabaseError::SwitchingNotSupported => true,
            DatabaseError::Context { source, .. } => source.is_not_supported(),
            _ => false,
        }
    }

    /// Innermost error with any operation context stripped
    pub fn root(&self) -> &DatabaseError {
        match self {
            DatabaseError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Cell value in a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(String),
    Binary(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Plain-text rendering used by formatters; `None` for NULL
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(v) => Some(v.to_string()),
            CellValue::Int(v) => Some(v.to_string()),
            CellValue::Float(v) => Some(v.to_string()),
            CellValue::String(v) | CellValue::DateTime(v) => Some(v.clone()),
            CellValue::Binary(bytes) => Some(
                bytes
                    .iter()
                    .fold(String::from("0x"), |mut acc, b| {
                        acc.push_str(&format!("{:02x}", b));
                        acc
                    }),
            ),
        }
    }
}

/// One row of a result set, in cursor column order
pub type Row = Vec<CellValue>;

/// Classification of a schema object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StructureType {
    #[default]
    None,
    Table,
    View,
    Materialized,
    StreamingTable,
    Sink,
    Source,
    Manager,
}

impl StructureType {
    /// Map a backend's object kind ("BASE TABLE", "VIEW", ...) to a StructureType
    pub fn from_kind(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "table" | "base table" | "user_table" => StructureType::Table,
            "view" => StructureType::View,
            "materialized view" | "materialized_view" | "materialized" => {
                StructureType::Materialized
            }
            "streaming table" | "streaming_table" => StructureType::StreamingTable,
            "sink" => StructureType::Sink,
            "source" => StructureType::Source,
            _ => StructureType::None,
        }
    }
}

/// A node of the browsable schema tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub name: String,
    pub schema: String,
    #[serde(rename = "type")]
    pub kind: StructureType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Structure>,
}

impl Structure {
    pub fn new(name: impl Into<String>, schema: impl Into<String>, kind: StructureType) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            kind,
            children: Vec::new(),
        }
    }

    /// Group flat (schema, object) entries into one parent node per schema
    pub fn group_by_schema(entries: Vec<Structure>) -> Vec<Structure> {
        let mut schemas: Vec<Structure> = Vec::new();
        for entry in entries {
            match schemas.iter_mut().find(|s| s.name == entry.schema) {
                Some(parent) => parent.children.push(entry),
                None => {
                    let mut parent = Structure::new(&entry.schema, &entry.schema, StructureType::None);
                    parent.children.push(entry);
                    schemas.push(parent);
                }
            }
        }
        schemas
    }
}

/// Column information returned by introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Options for gathering information about a specific table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub materialization: StructureType,
}

impl TableOptions {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            materialization: StructureType::Table,
        }
    }

    /// Both schema and table are known
    pub fn is_qualified(&self) -> bool {
        !self.schema.is_empty() && !self.table.is_empty()
    }
}

/// Forward-only cursor implemented by each backend
///
/// `close` releases the backend resources held by the cursor (statement,
/// portal, worker thread). Callers go through [`ResultStream`], which makes
/// sure `close` runs exactly once.
#[async_trait::async_trait]
pub trait RowStream: Send {
    /// Column names, in row order
    fn columns(&self) -> &[String];

    /// Next row, or `None` once the cursor is exhausted
    async fn next_row(&mut self) -> Result<Option<Row>, DatabaseError>;

    fn close(&mut self);
}

/// Database driver trait - one live instance per connected target
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Run a query. Implementations must stop waiting on the backend once
    /// `cancel` fires.
    async fn query(
        &self,
        cancel: CancellationToken,
        query: &str,
    ) -> Result<ResultStream, DatabaseError>;

    /// Browsable schema tree
    async fn structure(&self) -> Result<Vec<Structure>, DatabaseError>;

    /// Columns of the table named by `opts`
    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>, DatabaseError>;

    /// Release the backend session
    async fn close(&self);

    /// Database switching capability, if this backend has one
    fn as_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        None
    }
}

/// Optional capability for drivers that can switch the active database
#[async_trait::async_trait]
pub trait DatabaseSwitcher: Send + Sync {
    async fn select_database(&self, name: &str) -> Result<(), DatabaseError>;

    /// Returns the current database and every database available to switch to
    async fn list_databases(&self) -> Result<(String, Vec<String>), DatabaseError>;
}

/// Stateless factory producing drivers for one backend type
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Driver>, DatabaseError>;

    /// Ready-to-run helper queries (helper name -> query text) for a table
    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String>;
}

/// Quote a string as a SQL literal, doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_type_from_kind() {
        assert_eq!(StructureType::from_kind("BASE TABLE"), StructureType::Table);
        assert_eq!(StructureType::from_kind("view"), StructureType::View);
        assert_eq!(StructureType::from_kind("MATERIALIZED VIEW"), StructureType::Materialized);
        assert_eq!(StructureType::from_kind("something else"), StructureType::None);
    }

    #[test]
    fn test_error_context_keeps_cause() {
        let err = DatabaseError::ConnectionFailed("refused".to_string()).context("adapter.connect");
        assert_eq!(err.to_string(), "adapter.connect: Connection failed: refused");
        assert!(matches!(err.root(), DatabaseError::ConnectionFailed(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_not_supported_is_distinguishable() {
        assert!(DatabaseError::SwitchingNotSupported.is_not_supported());
        assert!(DatabaseError::SwitchingNotSupported.context("select").is_not_supported());
        assert!(!DatabaseError::NotConnected.is_not_supported());
        assert!(!DatabaseError::QueryError("boom".to_string()).is_not_supported());
    }

    #[test]
    fn test_group_by_schema() {
        let grouped = Structure::group_by_schema(vec![
            Structure::new("a", "public", StructureType::Table),
            Structure::new("b", "audit", StructureType::View),
            Structure::new("c", "public", StructureType::Table),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].name, "public");
        assert_eq!(grouped[0].children.len(), 2);
        assert_eq!(grouped[1].children[0].name, "b");
    }

    #[test]
    fn test_cell_value_text() {
        assert_eq!(CellValue::Null.as_text(), None);
        assert_eq!(CellValue::Int(7).as_text().as_deref(), Some("7"));
        assert_eq!(CellValue::Binary(vec![0xde, 0xad]).as_text().as_deref(), Some("0xdead"));
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
    }
}

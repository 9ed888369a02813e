// Query Engine
// Cancelable, paged query execution over pluggable database backends

pub mod config;
pub mod db;
pub mod export;
pub mod logging;

pub use config::{ConfigError, ConnectionStore, EngineConfig};
pub use db::{
    AdapterRegistry, Call, CallEvent, CallInfo, CallListener, CallOptions, CallState, Connection,
    ConnectionParams, DatabaseError, DrainMode, Page,
};
pub use export::{export_call, ExportError, ExportFormat, ExportOptions, PageFormatter};
pub use logging::{init_logging, LogConfig};

// Database Module
// Connections, asynchronous calls, paged result caching and the backend drivers

pub mod cache;
pub mod call;
pub mod connection;
pub mod drivers;
pub mod registry;
pub mod stream;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Page, PageCache};
pub use call::{Call, CallEvent, CallInfo, CallListener, CallOptions, CallState, DrainMode};
pub use connection::{Connection, ConnectionParams};
pub use drivers::{MssqlAdapter, PostgresAdapter, SqliteAdapter};
pub use registry::AdapterRegistry;
pub use stream::{row_channel, ChannelRowStream, ResultStream, RowMessage, StaticRowStream};
pub use traits::{
    quote_literal, Adapter, CellValue, Column, DatabaseError, DatabaseSwitcher, Driver, Row,
    RowStream, Structure, StructureType, TableOptions,
};

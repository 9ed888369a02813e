// Built-in Backends
// One adapter (connection factory) and one driver (live session) per supported database

pub mod mssql;
pub mod postgres;
pub mod sqlite;

pub use mssql::{MssqlAdapter, MssqlDriver};
pub use postgres::{PostgresAdapter, PostgresDriver};
pub use sqlite::{SqliteAdapter, SqliteDriver};

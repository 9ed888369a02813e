// SQLite Driver
// Adapter and driver for SQLite databases using rusqlite

use crate::db::stream::{row_channel, ResultStream, RowMessage};
use crate::db::traits::{
    quote_literal, Adapter, CellValue, Column, DatabaseError, Driver, Row, Structure,
    StructureType, TableOptions,
};
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, InterruptHandle, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Rows buffered between the statement thread and the reader
const DEFAULT_ROW_BUFFER: usize = 256;

/// Connects `sqlite:` URLs
pub struct SqliteAdapter {
    row_buffer: usize,
}

impl SqliteAdapter {
    pub fn new() -> Self {
        Self {
            row_buffer: DEFAULT_ROW_BUFFER,
        }
    }

    pub fn with_row_buffer(row_buffer: usize) -> Self {
        Self {
            row_buffer: row_buffer.max(1),
        }
    }
}

impl Default for SqliteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a sqlite URL points
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SqliteTarget {
    pub path: String,
    pub read_only: bool,
}

impl SqliteTarget {
    /// Accepts `sqlite:///abs.db`, `sqlite://./rel.db`, `sqlite::memory:`,
    /// `sqlite://:memory:` and bare paths, with an optional `?mode=ro`.
    pub fn parse(url: &str) -> Result<Self, DatabaseError> {
        let (location, query) = match url.split_once('?') {
            Some((location, query)) => (location, query),
            None => (url, ""),
        };

        let path = location
            .strip_prefix("sqlite3://")
            .or_else(|| location.strip_prefix("sqlite://"))
            .or_else(|| location.strip_prefix("sqlite3:"))
            .or_else(|| location.strip_prefix("sqlite:"))
            .unwrap_or(location);

        if path.is_empty() {
            return Err(DatabaseError::InvalidUrl(format!(
                "SQLite database path is required: {}",
                url
            )));
        }

        // Expand ~ to home directory if present
        let path = match path.strip_prefix("~/") {
            Some(rest) => match std::env::var_os("HOME") {
                Some(home) => Path::new(&home).join(rest).to_string_lossy().to_string(),
                None => path.to_string(),
            },
            None => path.to_string(),
        };

        let read_only = query
            .split('&')
            .any(|pair| pair.eq_ignore_ascii_case("mode=ro"));

        Ok(Self { path, read_only })
    }

    fn open(&self) -> Result<RusqliteConnection, DatabaseError> {
        let flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };

        let opened = if self.path == ":memory:" {
            RusqliteConnection::open_in_memory()
        } else {
            RusqliteConnection::open_with_flags(&self.path, flags)
        };
        opened.map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to open SQLite database: {}", e))
        })
    }
}

#[async_trait::async_trait]
impl Adapter for SqliteAdapter {
    async fn connect(&self, url: &str) -> Result<Box<dyn Driver>, DatabaseError> {
        let target = SqliteTarget::parse(url)?;
        let conn = tokio::task::spawn_blocking(move || target.open())
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))??;

        Ok(Box::new(SqliteDriver::new(conn, self.row_buffer)))
    }

    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String> {
        let table = quote_literal(&opts.table);
        let mut helpers = HashMap::new();

        helpers.insert(
            "list".to_string(),
            format!("SELECT * FROM \"{}\" LIMIT 500", opts.table.replace('"', "\"\"")),
        );
        helpers.insert(
            "columns".to_string(),
            format!("SELECT * FROM pragma_table_info({})", table),
        );
        helpers.insert(
            "indexes".to_string(),
            format!("SELECT * FROM pragma_index_list({})", table),
        );
        helpers.insert(
            "foreign-keys".to_string(),
            format!("SELECT * FROM pragma_foreign_key_list({})", table),
        );
        helpers.insert(
            "primary-keys".to_string(),
            format!("SELECT * FROM pragma_table_info({}) WHERE pk > 0", table),
        );
        helpers.insert(
            "constraints".to_string(),
            format!("SELECT sql FROM sqlite_master WHERE name = {}", table),
        );

        if opts.is_qualified() {
            helpers.insert(
                "show-columns".to_string(),
                format!(
                    "SELECT name, type FROM pragma_table_info({}, {}) ORDER BY cid",
                    table,
                    quote_literal(&opts.schema)
                ),
            );
        }

        helpers
    }
}

/// A single SQLite connection. Statements run on blocking threads, one at
/// a time; rows travel to the reader over a bounded channel.
pub struct SqliteDriver {
    conn: Arc<Mutex<RusqliteConnection>>,
    interrupt: Arc<InterruptHandle>,
    row_buffer: usize,
}

impl SqliteDriver {
    pub fn new(conn: RusqliteConnection, row_buffer: usize) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            row_buffer,
        }
    }

    /// Run `f` against the connection on a blocking thread
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&RusqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| DatabaseError::QueryError("SQLite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?
    }

    /// Convert SQLite type to string
    fn sqlite_type_to_string(sqlite_type: Option<&str>) -> String {
        match sqlite_type {
            Some("") | None => "any".to_string(),
            Some(t) => t.to_lowercase(),
        }
    }

    /// Extract cell value from row
    fn cell_value_from_row(row: &rusqlite::Row, idx: usize) -> Result<CellValue, rusqlite::Error> {
        Ok(match row.get_ref(idx)? {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(v) => CellValue::Int(v),
            ValueRef::Real(v) => CellValue::Float(v),
            ValueRef::Text(bytes) => CellValue::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => CellValue::Binary(bytes.to_vec()),
        })
    }
}

type OpenedStream = Result<crate::db::stream::ChannelRowStream, DatabaseError>;

/// Virtual machine steps between two looks at the cancellation token
const CANCEL_CHECK_OPS: i32 = 1_000;

/// Aborts the statement running on the connection once `cancel` fires.
/// The handler is removed again on drop so it never outlives its call.
struct CancelOnProgress<'c> {
    conn: &'c RusqliteConnection,
}

impl<'c> CancelOnProgress<'c> {
    fn install(conn: &'c RusqliteConnection, cancel: CancellationToken) -> Self {
        conn.progress_handler(CANCEL_CHECK_OPS, Some(move || cancel.is_cancelled()));
        Self { conn }
    }
}

impl Drop for CancelOnProgress<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

/// Body of the statement thread: wait for the connection, prepare, announce
/// the header, then push rows until the statement ends or the reader goes away.
fn run_statement(
    conn: Arc<Mutex<RusqliteConnection>>,
    sql: String,
    capacity: usize,
    interrupt: Arc<InterruptHandle>,
    cancel: CancellationToken,
    opened: oneshot::Sender<OpenedStream>,
) {
    let guard = match conn.lock() {
        Ok(guard) => guard,
        Err(_) => {
            let _ = opened.send(Err(DatabaseError::QueryError(
                "SQLite connection lock poisoned".to_string(),
            )));
            return;
        }
    };

    // Canceled while queued behind another statement: never run it
    if cancel.is_cancelled() {
        debug!("statement canceled before it started");
        let _ = opened.send(Err(DatabaseError::QueryError("query canceled".to_string())));
        return;
    }
    let _cancel_on_progress = CancelOnProgress::install(&guard, cancel);

    let mut stmt = match guard.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = opened.send(Err(e.into()));
            return;
        }
    };

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    if columns.is_empty() {
        let message = match stmt.execute([]) {
            Ok(affected) => {
                let (tx, stream) = row_channel(vec!["Rows affected".to_string()], 1);
                let _ = tx.try_send(Ok(vec![CellValue::Int(affected as i64)]));
                Ok(stream)
            }
            Err(e) => Err(e.into()),
        };
        let _ = opened.send(message);
        return;
    }

    // The interrupt handle is connection-wide, so the close hook may only use
    // it while this statement is the one holding the connection
    let running = Arc::new(AtomicBool::new(true));
    let hook_running = Arc::clone(&running);
    let hook = move || {
        if hook_running.load(Ordering::Acquire) {
            interrupt.interrupt();
        }
    };

    let width = columns.len();
    let (tx, stream) = row_channel(columns, capacity);
    if opened.send(Ok(stream.on_close(hook))).is_err() {
        return;
    }

    let sent = stream_rows(&mut stmt, width, &tx);
    running.store(false, Ordering::Release);
    if let Err(e) = sent {
        // The reader may already be gone; nothing else to report to
        let _ = tx.blocking_send(Err(e.into()));
    }
}

fn stream_rows(
    stmt: &mut rusqlite::Statement<'_>,
    width: usize,
    tx: &mpsc::Sender<RowMessage>,
) -> Result<(), rusqlite::Error> {
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let values = (0..width)
            .map(|idx| SqliteDriver::cell_value_from_row(row, idx))
            .collect::<Result<Row, _>>()?;
        if tx.blocking_send(Ok(values)).is_err() {
            debug!("reader closed, stopping statement");
            break;
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Driver for SqliteDriver {
    async fn query(
        &self,
        cancel: CancellationToken,
        query: &str,
    ) -> Result<ResultStream, DatabaseError> {
        let (opened_tx, opened_rx) = oneshot::channel();
        let conn = Arc::clone(&self.conn);
        let interrupt = Arc::clone(&self.interrupt);
        let sql = query.to_string();
        let capacity = self.row_buffer;
        let statement_cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            run_statement(conn, sql, capacity, interrupt, statement_cancel, opened_tx)
        });

        // The statement thread watches the same token, so a canceled statement
        // either never starts or is aborted by its progress handler
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DatabaseError::QueryError("query canceled".to_string()));
            }
            opened = opened_rx => opened,
        };

        let stream = opened.map_err(|_| {
            DatabaseError::QueryError("SQLite statement thread exited".to_string())
        })??;
        Ok(ResultStream::from_stream(stream))
    }

    async fn structure(&self) -> Result<Vec<Structure>, DatabaseError> {
        let entries = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT name, type
                    FROM sqlite_master
                    WHERE type IN ('table', 'view')
                    AND name NOT LIKE 'sqlite_%'
                    ORDER BY name
                    "#,
                )?;
                let entries = stmt
                    .query_map([], |row| {
                        let name: String = row.get(0)?;
                        let kind: String = row.get(1)?;
                        Ok(Structure::new(name, "main", StructureType::from_kind(&kind)))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;

        Ok(Structure::group_by_schema(entries))
    }

    async fn columns(&self, opts: &TableOptions) -> Result<Vec<Column>, DatabaseError> {
        let table = opts.table.clone();
        let schema = if opts.schema.is_empty() {
            "main".to_string()
        } else {
            opts.schema.clone()
        };

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT name, type
                FROM pragma_table_info(?1, ?2)
                ORDER BY cid
                "#,
            )?;
            let columns = stmt
                .query_map([table.as_str(), schema.as_str()], |row| {
                    let name: String = row.get(0)?;
                    let data_type: Option<String> = row.get(1)?;
                    Ok(Column::new(name, SqliteDriver::sqlite_type_to_string(data_type.as_deref())))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(columns)
        })
        .await
    }

    async fn close(&self) {
        // The connection itself closes when the last statement thread lets go
        self.interrupt.interrupt();
        debug!("SQLite driver closed");
    }
}

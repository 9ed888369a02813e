// Test doubles: scripted cursors, drivers and adapters with call counters

use crate::db::stream::ResultStream;
use crate::db::traits::{
    Adapter, CellValue, Column, DatabaseError, DatabaseSwitcher, Driver, Row, RowStream,
    Structure, TableOptions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Counters shared between a scripted cursor and the test observing it
#[derive(Clone, Default)]
pub struct StreamTally {
    next: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl StreamTally {
    pub fn next_calls(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Cursor yielding `[Int(i), String("row-i")]` rows according to a script
pub struct ScriptedStream {
    columns: Vec<String>,
    total: usize,
    fail_at: Option<usize>,
    stall_at: Option<usize>,
    position: usize,
    tally: StreamTally,
}

impl ScriptedStream {
    fn build(total: usize, fail_at: Option<usize>, stall_at: Option<usize>, tally: StreamTally) -> Self {
        Self {
            columns: vec!["id".to_string(), "label".to_string()],
            total,
            fail_at,
            stall_at,
            position: 0,
            tally,
        }
    }

    pub fn with_rows(total: usize) -> (Self, StreamTally) {
        let tally = StreamTally::default();
        (Self::build(total, None, None, tally.clone()), tally)
    }

    /// Yields rows until index `at`, where it errors
    pub fn failing_at(total: usize, at: usize) -> (Self, StreamTally) {
        let tally = StreamTally::default();
        (Self::build(total, Some(at), None, tally.clone()), tally)
    }

    /// Yields `after` rows, then never produces another one
    pub fn stalling_after(after: usize) -> (Self, StreamTally) {
        let tally = StreamTally::default();
        (Self::build(usize::MAX, None, Some(after), tally.clone()), tally)
    }
}

pub fn scripted_row(i: usize) -> Row {
    vec![CellValue::Int(i as i64), CellValue::String(format!("row-{}", i))]
}

#[async_trait::async_trait]
impl RowStream for ScriptedStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, DatabaseError> {
        self.tally.next.fetch_add(1, Ordering::SeqCst);
        if self.stall_at == Some(self.position) {
            std::future::pending::<()>().await;
        }
        if self.fail_at == Some(self.position) {
            return Err(DatabaseError::QueryError(format!("row {} is unreadable", self.position)));
        }
        if self.position >= self.total {
            return Ok(None);
        }
        let row = scripted_row(self.position);
        self.position += 1;
        Ok(Some(row))
    }

    fn close(&mut self) {
        self.tally.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a [`MockDriver`] answers `query`
#[derive(Clone, Debug)]
pub enum Script {
    Rows(usize),
    FailAt { total: usize, at: usize },
    StallAfter(usize),
    Error(String),
    /// Blocks until the cancellation token fires
    Hang,
}

pub struct MockDriver {
    script: Script,
    pub tally: StreamTally,
    pub queries: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub query_unwound: Arc<AtomicBool>,
    pub structure: Vec<Structure>,
    pub columns: Vec<Column>,
    switcher: Option<MockSwitcher>,
}

impl MockDriver {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            tally: StreamTally::default(),
            queries: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            query_unwound: Arc::new(AtomicBool::new(false)),
            structure: Vec::new(),
            columns: Vec::new(),
            switcher: None,
        }
    }

    pub fn with_switcher(mut self) -> Self {
        self.switcher = Some(MockSwitcher::default());
        self
    }
}

#[async_trait::async_trait]
impl Driver for MockDriver {
    async fn query(
        &self,
        cancel: CancellationToken,
        _query: &str,
    ) -> Result<ResultStream, DatabaseError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let tally = self.tally.clone();
        let stream = match &self.script {
            Script::Rows(n) => ScriptedStream::build(*n, None, None, tally),
            Script::FailAt { total, at } => ScriptedStream::build(*total, Some(*at), None, tally),
            Script::StallAfter(n) => ScriptedStream::build(usize::MAX, None, Some(*n), tally),
            Script::Error(msg) => return Err(DatabaseError::QueryError(msg.clone())),
            Script::Hang => {
                cancel.cancelled().await;
                self.query_unwound.store(true, Ordering::SeqCst);
                return Err(DatabaseError::QueryError("canceled".to_string()));
            }
        };
        Ok(ResultStream::from_stream(stream))
    }

    async fn structure(&self) -> Result<Vec<Structure>, DatabaseError> {
        Ok(self.structure.clone())
    }

    async fn columns(&self, _opts: &TableOptions) -> Result<Vec<Column>, DatabaseError> {
        Ok(self.columns.clone())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn as_switcher(&self) -> Option<&dyn DatabaseSwitcher> {
        self.switcher.as_ref().map(|s| s as &dyn DatabaseSwitcher)
    }
}

#[derive(Default)]
pub struct MockSwitcher {
    current: Mutex<String>,
}

#[async_trait::async_trait]
impl DatabaseSwitcher for MockSwitcher {
    async fn select_database(&self, name: &str) -> Result<(), DatabaseError> {
        if name == "missing" {
            return Err(DatabaseError::QueryError(format!("database {} does not exist", name)));
        }
        if let Ok(mut current) = self.current.lock() {
            *current = name.to_string();
        }
        Ok(())
    }

    async fn list_databases(&self) -> Result<(String, Vec<String>), DatabaseError> {
        let current = self.current.lock().map(|c| c.clone()).unwrap_or_default();
        Ok((current, vec!["main".to_string(), "analytics".to_string()]))
    }
}

type DriverFactory = Box<dyn Fn() -> MockDriver + Send + Sync>;

/// Adapter handing out fresh [`MockDriver`]s; URLs starting with `fail:` refuse to connect
pub struct MockAdapter {
    factory: DriverFactory,
    pub connects: AtomicUsize,
}

impl MockAdapter {
    pub fn new(factory: impl Fn() -> MockDriver + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn rows(n: usize) -> Self {
        Self::new(move || MockDriver::new(Script::Rows(n)))
    }
}

#[async_trait::async_trait]
impl Adapter for MockAdapter {
    async fn connect(&self, url: &str) -> Result<Box<dyn Driver>, DatabaseError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if url.starts_with("fail:") {
            return Err(DatabaseError::ConnectionFailed(format!("refused: {}", url)));
        }
        Ok(Box::new((self.factory)()))
    }

    fn helpers(&self, opts: &TableOptions) -> HashMap<String, String> {
        let mut helpers = HashMap::new();
        helpers.insert("list".to_string(), format!("SELECT * FROM {} LIMIT 500", opts.table));
        helpers
    }
}

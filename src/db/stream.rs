// Result Streams
// Release-once wrapper around backend cursors, plus channel-fed and in-memory cursors

use crate::db::traits::{DatabaseError, Row, RowStream};
use tokio::sync::mpsc;

/// Forward-only, non-restartable sequence of rows returned by a driver.
///
/// The backend cursor is closed exactly once: by [`ResultStream::release`] or,
/// failing that, when the stream is dropped.
pub struct ResultStream {
    inner: Option<Box<dyn RowStream>>,
    header: Vec<String>,
    exhausted: bool,
}

impl ResultStream {
    pub fn new(inner: Box<dyn RowStream>) -> Self {
        let header = inner.columns().to_vec();
        Self {
            inner: Some(inner),
            header,
            exhausted: false,
        }
    }

    pub fn from_stream<S: RowStream + 'static>(stream: S) -> Self {
        Self::new(Box::new(stream))
    }

    /// A stream over rows that are already in memory
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self::from_stream(StaticRowStream::new(columns, rows))
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// False once the cursor reported its end, failed, or was released
    pub fn has_next(&self) -> bool {
        self.inner.is_some() && !self.exhausted
    }

    pub async fn next_row(&mut self) -> Result<Option<Row>, DatabaseError> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };

        match inner.next_row().await {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => {
                self.exhausted = true;
                Err(e)
            }
        }
    }

    /// Close the backend cursor. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("header", &self.header)
            .field("exhausted", &self.exhausted)
            .field("released", &self.inner.is_none())
            .finish()
    }
}

/// Item carried from a producer (worker thread or task) to a [`ChannelRowStream`]
pub type RowMessage = Result<Row, DatabaseError>;

/// Cursor fed by a bounded channel; the bound is the backpressure between a
/// backend producer and the consumer paging through results.
pub struct ChannelRowStream {
    columns: Vec<String>,
    rows: mpsc::Receiver<RowMessage>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelRowStream {
    /// Run `hook` when the stream is closed (e.g. to interrupt a blocked statement)
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

/// Create a producer handle and the cursor that reads from it
pub fn row_channel(columns: Vec<String>, capacity: usize) -> (mpsc::Sender<RowMessage>, ChannelRowStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = ChannelRowStream {
        columns,
        rows: rx,
        on_close: None,
    };
    (tx, stream)
}

#[async_trait::async_trait]
impl RowStream for ChannelRowStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, DatabaseError> {
        match self.rows.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        // Producers see a closed channel on their next send and stop
        self.rows.close();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// Cursor over rows already held in memory
pub struct StaticRowStream {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl StaticRowStream {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

#[async_trait::async_trait]
impl RowStream for StaticRowStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>, DatabaseError> {
        Ok(self.rows.next())
    }

    fn close(&mut self) {
        self.rows = Vec::new().into_iter();
    }
}

// Page Cache
// Random-access, page-indexed view over a forward-only ResultStream

use crate::db::stream::ResultStream;
use crate::db::traits::{DatabaseError, Row};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One page of cached rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub index: usize,
    pub rows: Vec<Row>,
    /// No rows exist past this page
    pub is_last: bool,
}

/// What happened while driving the cursor forward
#[derive(Debug)]
pub(crate) enum DrainOutcome {
    /// The requested number of rows is cached
    Filled,
    /// The cursor ended (or the row limit was hit) and has been released
    Exhausted,
    /// The cursor failed; it has been released and earlier rows stay cached
    Failed(DatabaseError),
    /// Cancellation was observed; the cursor has been released
    Canceled,
    /// Nothing to drain: no cursor attached, or it was already released
    Idle,
}

/// Append-only row buffer built incrementally from a [`ResultStream`].
///
/// Reads of rows that are already cached only touch the row buffer. Driving the
/// cursor forward happens under `cursor`, so at most one drain runs at a time.
/// Rows are never evicted.
pub struct PageCache {
    header: RwLock<Vec<String>>,
    rows: RwLock<Vec<Row>>,
    cursor: Mutex<Option<ResultStream>>,
    finished: AtomicBool,
    row_limit: Option<usize>,
}

impl PageCache {
    pub fn new(row_limit: Option<usize>) -> Self {
        Self {
            header: RwLock::new(Vec::new()),
            rows: RwLock::new(Vec::new()),
            cursor: Mutex::new(None),
            finished: AtomicBool::new(false),
            row_limit,
        }
    }

    /// Park the cursor that later drains will read from
    pub(crate) async fn attach(&self, stream: ResultStream) {
        if let Ok(mut header) = self.header.write() {
            *header = stream.header().to_vec();
        }
        let mut cursor = self.cursor.lock().await;
        if let Some(mut previous) = cursor.replace(stream) {
            previous.release();
        }
    }

    pub fn header(&self) -> Vec<String> {
        self.header.read().map(|h| h.clone()).unwrap_or_default()
    }

    /// Number of rows cached so far
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No more rows will ever be appended
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Rows `[start, end)` if they can be served without touching the cursor
    pub(crate) fn cached(&self, start: usize, end: usize) -> Option<Vec<Row>> {
        let rows = self.rows.read().ok()?;
        if rows.len() >= end || self.is_finished() {
            Some(slice(&rows, start, end))
        } else {
            None
        }
    }

    /// Rows `[start, end)` that are cached right now, possibly fewer
    pub(crate) fn snapshot(&self, start: usize, end: usize) -> Vec<Row> {
        self.rows
            .read()
            .map(|rows| slice(&rows, start, end))
            .unwrap_or_default()
    }

    /// Drive the cursor until `target` rows are cached or it stops yielding
    pub(crate) async fn fill_to(&self, target: usize, cancel: &CancellationToken) -> DrainOutcome {
        let target = match self.row_limit {
            Some(limit) => target.min(limit),
            None => target,
        };

        let mut cursor = self.cursor.lock().await;

        // Another drain may have done the work while we waited for the lock
        if self.len() >= target && !self.limit_reached() {
            return DrainOutcome::Filled;
        }

        let Some(stream) = cursor.as_mut() else {
            return DrainOutcome::Idle;
        };

        let mut fetched = 0usize;
        while self.len() < target {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = stream.next_row() => Some(next),
            };

            match next {
                None => {
                    debug!(fetched, "drain interrupted by cancellation");
                    self.finish(&mut cursor);
                    return DrainOutcome::Canceled;
                }
                Some(Ok(Some(row))) => {
                    fetched += 1;
                    if let Ok(mut rows) = self.rows.write() {
                        rows.push(row);
                    }
                }
                Some(Ok(None)) => {
                    debug!(fetched, total = self.len(), "cursor exhausted");
                    self.finish(&mut cursor);
                    return DrainOutcome::Exhausted;
                }
                Some(Err(e)) => {
                    debug!(fetched, total = self.len(), error = %e, "cursor failed");
                    self.finish(&mut cursor);
                    return DrainOutcome::Failed(e);
                }
            }
        }

        if self.limit_reached() {
            debug!(total = self.len(), "row limit reached, stopping cursor");
            self.finish(&mut cursor);
            return DrainOutcome::Exhausted;
        }

        DrainOutcome::Filled
    }

    /// Release the parked cursor if no drain holds it. Returns true if a
    /// cursor was released by this call.
    pub(crate) async fn release(&self) -> bool {
        let mut cursor = self.cursor.lock().await;
        let had_cursor = cursor.is_some();
        self.finish(&mut cursor);
        had_cursor
    }

    fn limit_reached(&self) -> bool {
        self.row_limit.is_some_and(|limit| self.len() >= limit)
    }

    fn finish(&self, cursor: &mut Option<ResultStream>) {
        if let Some(mut stream) = cursor.take() {
            stream.release();
        }
        self.finished.store(true, Ordering::Release);
    }
}

fn slice(rows: &[Row], start: usize, end: usize) -> Vec<Row> {
    let end = end.min(rows.len());
    if start >= end {
        return Vec::new();
    }
    rows[start..end].to_vec()
}

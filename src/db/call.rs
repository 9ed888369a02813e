// Query Calls
// One asynchronous, cancelable query execution: state machine, events, paged results

use crate::db::cache::{DrainOutcome, Page, PageCache};
use crate::db::stream::ResultStream;
use crate::db::traits::DatabaseError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Unexecuted,
    Executing,
    Retrieving,
    Archived,
    Failed,
    Canceled,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Archived | CallState::Failed | CallState::Canceled)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Unexecuted, Executing)
                | (Executing, Retrieving)
                | (Executing, Failed)
                | (Executing, Canceled)
                | (Retrieving, Archived)
                | (Retrieving, Failed)
                | (Retrieving, Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Unexecuted => "unexecuted",
            CallState::Executing => "executing",
            CallState::Retrieving => "retrieving",
            CallState::Archived => "archived",
            CallState::Failed => "failed",
            CallState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who drives the cursor while a call is retrieving
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// Rows are pulled only when a page that is not cached yet is requested
    #[default]
    OnDemand,
    /// A background task pulls every row into the cache, batch by batch
    Background,
}

/// Per-call execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CallOptions {
    pub drain: DrainMode,
    /// Stop reading (and archive the call) after this many rows
    pub row_limit: Option<usize>,
    /// Rows pulled per step by the background drain
    pub batch_size: usize,
    /// How long a canceled executor may take to unwind before it is discarded
    pub cancel_grace_ms: u64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            drain: DrainMode::OnDemand,
            row_limit: None,
            batch_size: 100,
            cancel_grace_ms: 5_000,
        }
    }
}

/// Snapshot of a call, delivered with every state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub id: String,
    pub query: String,
    pub state: CallState,
    pub error: Option<String>,
    pub rows_cached: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub time_taken_ms: Option<u64>,
}

/// Notification published by a call
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallInfo),
    Progress { call_id: String, rows_cached: usize },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::StateChanged(info) => &info.id,
            CallEvent::Progress { call_id, .. } => call_id,
        }
    }

    /// New state, for state-change events
    pub fn state(&self) -> Option<CallState> {
        match self {
            CallEvent::StateChanged(info) => Some(info.state),
            CallEvent::Progress { .. } => None,
        }
    }
}

/// Subscriber to call events. Listeners run on the call's dispatcher task,
/// never while the call's own locks are held.
pub trait CallListener: Send + Sync {
    fn on_event(&self, event: &CallEvent);
}

impl<F> CallListener for F
where
    F: Fn(&CallEvent) + Send + Sync,
{
    fn on_event(&self, event: &CallEvent) {
        self(event)
    }
}

pub type ExecutorFuture = BoxFuture<'static, Result<ResultStream, DatabaseError>>;
pub type Executor = Box<dyn FnOnce(CancellationToken) -> ExecutorFuture + Send>;

/// A single query execution
pub struct Call {
    id: String,
    query: String,
    options: CallOptions,
    state: watch::Sender<CallState>,
    executor: Mutex<Option<Executor>>,
    events: mpsc::UnboundedSender<CallEvent>,
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn CallListener>>>>,
    cache: PageCache,
    cancel: CancellationToken,
    error: Mutex<Option<Arc<DatabaseError>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl Call {
    /// Create an unexecuted call around `executor`, which receives the call's
    /// cancellation token and resolves to the driver's result stream.
    pub fn new<F, Fut>(query: impl Into<String>, options: CallOptions, executor: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<ResultStream, DatabaseError>> + Send + 'static,
    {
        let (events, pending) = mpsc::unbounded_channel();
        let executor: Executor = Box::new(move |token| executor(token).boxed());
        let (state, _) = watch::channel(CallState::Unexecuted);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            cache: PageCache::new(options.row_limit),
            options,
            state,
            executor: Mutex::new(Some(executor)),
            events,
            pending_events: Mutex::new(Some(pending)),
            listeners: Arc::new(RwLock::new(Vec::new())),
            cancel: CancellationToken::new(),
            error: Mutex::new(None),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// The failure that moved this call to `Failed`
    pub fn error(&self) -> Option<Arc<DatabaseError>> {
        self.error.lock().ok().and_then(|e| e.clone())
    }

    pub fn info(&self) -> CallInfo {
        self.snapshot(self.state())
    }

    /// Column names of the result, once the call is retrieving
    pub fn header(&self) -> Vec<String> {
        self.cache.header()
    }

    pub fn rows_cached(&self) -> usize {
        self.cache.len()
    }

    /// Total row count, known once the whole result has been archived
    pub fn total_rows(&self) -> Option<usize> {
        (self.state() == CallState::Archived).then(|| self.cache.len())
    }

    pub fn subscribe(&self, listener: impl CallListener + 'static) {
        self.subscribe_arc(Arc::new(listener));
    }

    pub fn subscribe_arc(&self, listener: Arc<dyn CallListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Subscribe through a channel; events arrive in publication order
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event: &CallEvent| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Run the executor on the Tokio runtime. A call runs at most once;
    /// re-execution means creating a new call.
    pub fn start(self: &Arc<Self>) -> Result<(), DatabaseError> {
        let executor = self
            .executor
            .lock()
            .ok()
            .and_then(|mut executor| executor.take())
            .ok_or_else(|| DatabaseError::Validation("call has already been executed".to_string()))?;

        self.spawn_dispatcher();

        // Callers may ask for a page as soon as this returns, so the call is
        // Executing before the executor task is scheduled.
        self.transition(CallState::Executing);

        let call = Arc::clone(self);
        tokio::spawn(async move { call.run(executor).await });
        Ok(())
    }

    /// Request cancellation. The call reaches `Canceled` once the in-flight
    /// backend operation has unwound; terminal calls are left untouched.
    pub async fn cancel(&self) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }

        info!(call_id = %self.id, %state, "cancel requested");
        self.cancel.cancel();

        // An executing call is finished off by its executor task. A retrieving
        // call with no drain in flight has a parked cursor nobody will look at.
        if self.state() == CallState::Retrieving {
            self.cache.release().await;
            self.transition(CallState::Canceled);
        }
    }

    /// Rows of page `index`. Cached pages are served without touching the
    /// cursor; otherwise the cursor is driven forward until the page is full or
    /// the result ends. Failed and canceled calls serve what was cached.
    pub async fn get_page(&self, index: usize, size: usize) -> Result<Page, DatabaseError> {
        if size == 0 {
            return Err(DatabaseError::Validation("page size must be greater than zero".to_string()));
        }
        let start = index
            .checked_mul(size)
            .ok_or_else(|| DatabaseError::Validation(format!("page {} is out of range", index)))?;
        let end = start.saturating_add(size);

        if let Some(rows) = self.cache.cached(start, end) {
            return Ok(self.page(index, rows, end));
        }

        if self.state() == CallState::Unexecuted {
            return Err(DatabaseError::Validation("call has not been executed".to_string()));
        }

        if self.wait_for_results().await == CallState::Retrieving {
            let outcome = self.cache.fill_to(end, &self.cancel).await;
            self.apply(outcome);
        }

        let rows = self.cache.snapshot(start, end);
        Ok(self.page(index, rows, end))
    }

    /// Pull every remaining row into the cache
    pub async fn archive_all(&self) -> CallState {
        if self.state() != CallState::Unexecuted
            && self.wait_for_results().await == CallState::Retrieving
        {
            let outcome = self.cache.fill_to(usize::MAX, &self.cancel).await;
            self.apply(outcome);
        }
        self.state()
    }

    /// Wait until the executor has finished (successfully or not)
    pub async fn wait_for_results(&self) -> CallState {
        self.wait_until(|state| !matches!(state, CallState::Unexecuted | CallState::Executing))
            .await
    }

    /// Wait until the call reaches a terminal state
    pub async fn wait_terminal(&self) -> CallState {
        self.wait_until(|state| state.is_terminal()).await
    }

    async fn wait_until(&self, done: impl FnMut(&CallState) -> bool) -> CallState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(done).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    fn page(&self, index: usize, rows: Vec<crate::db::traits::Row>, end: usize) -> Page {
        let done = self.cache.is_finished() || self.state().is_terminal();
        Page {
            index,
            rows,
            is_last: done && self.cache.len() <= end,
        }
    }

    async fn run(self: Arc<Self>, executor: Executor) {
        let token = self.cancel.clone();
        let execution = executor(token.clone());
        tokio::pin!(execution);

        let finished = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = &mut execution => Some(result),
        };

        let result = match finished {
            Some(result) => result,
            None => {
                // The driver sees the same token; give it a chance to unwind
                let grace = Duration::from_millis(self.options.cancel_grace_ms);
                match tokio::time::timeout(grace, &mut execution).await {
                    Ok(Ok(mut stream)) => stream.release(),
                    Ok(Err(e)) => debug!(call_id = %self.id, error = %e, "executor unwound after cancel"),
                    Err(_) => warn!(call_id = %self.id, "executor ignored cancellation, discarding it"),
                }
                self.transition(CallState::Canceled);
                return;
            }
        };

        match result {
            Err(e) => self.fail(e),
            Ok(mut stream) => {
                if self.cancel.is_cancelled() {
                    stream.release();
                    self.transition(CallState::Canceled);
                    return;
                }

                debug!(call_id = %self.id, columns = stream.header().len(), "query returned a cursor");
                self.cache.attach(stream).await;
                self.transition(CallState::Retrieving);

                // cancel() may have looked at the state before it became Retrieving
                if self.cancel.is_cancelled() {
                    self.cache.release().await;
                    self.transition(CallState::Canceled);
                    return;
                }

                if self.options.drain == DrainMode::Background {
                    self.drain_in_background().await;
                }
            }
        }
    }

    async fn drain_in_background(&self) {
        let batch = self.options.batch_size.max(1);
        loop {
            let target = self.cache.len().saturating_add(batch);
            let outcome = self.cache.fill_to(target, &self.cancel).await;
            if !self.apply(outcome) {
                break;
            }
        }
    }

    /// Turn a drain outcome into events and transitions. Returns true while
    /// the cursor can still produce rows.
    fn apply(&self, outcome: DrainOutcome) -> bool {
        match outcome {
            DrainOutcome::Filled => {
                self.publish_progress();
                true
            }
            DrainOutcome::Exhausted => {
                self.publish_progress();
                self.transition(CallState::Archived);
                false
            }
            DrainOutcome::Failed(e) => {
                self.fail(e);
                false
            }
            DrainOutcome::Canceled => {
                self.transition(CallState::Canceled);
                false
            }
            DrainOutcome::Idle => false,
        }
    }

    fn fail(&self, error: DatabaseError) {
        warn!(call_id = %self.id, error = %error, "call failed");
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(Arc::new(error));
        }
        if !self.transition(CallState::Failed) {
            if let Ok(mut slot) = self.error.lock() {
                slot.take();
            }
        }
    }

    fn publish_progress(&self) {
        let _ = self.events.send(CallEvent::Progress {
            call_id: self.id.clone(),
            rows_cached: self.cache.len(),
        });
    }

    /// Apply `next` if the edge is legal. The event is queued while the state
    /// is locked, so listeners observe transitions in the order they happen.
    fn transition(&self, next: CallState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                debug!(call_id = %self.id, from = %current, to = %next, "transition refused");
                return false;
            }

            let now = Utc::now();
            if next == CallState::Executing {
                if let Ok(mut started) = self.started_at.lock() {
                    *started = Some(now);
                }
            }
            if next.is_terminal() {
                if let Ok(mut finished) = self.finished_at.lock() {
                    *finished = Some(now);
                }
            }

            *current = next;
            let _ = self.events.send(CallEvent::StateChanged(self.snapshot(next)));
            moved = true;
            true
        });

        if moved {
            info!(call_id = %self.id, state = %next, "call state changed");
        }
        moved
    }

    fn snapshot(&self, state: CallState) -> CallInfo {
        let started_at = self.started_at.lock().ok().and_then(|s| *s);
        let finished_at = self.finished_at.lock().ok().and_then(|f| *f);
        let time_taken_ms = match (started_at, finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };

        CallInfo {
            id: self.id.clone(),
            query: self.query.clone(),
            state,
            error: self.error().map(|e| e.to_string()),
            rows_cached: self.cache.len(),
            started_at,
            time_taken_ms,
        }
    }

    fn spawn_dispatcher(&self) {
        let pending = self.pending_events.lock().ok().and_then(|mut rx| rx.take());
        let Some(mut rx) = pending else {
            return;
        };
        let listeners = Arc::clone(&self.listeners);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let current: Vec<Arc<dyn CallListener>> =
                    listeners.read().map(|l| l.clone()).unwrap_or_default();
                for listener in current {
                    listener.on_event(&event);
                }
            }
        });
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // The cached cursor releases itself when the cache is dropped
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("state", &self.state())
            .field("rows_cached", &self.cache.len())
            .finish()
    }
}

//! Handler registry and single-job execution.
//!
//! - **Handler**: business logic for one job type
//! - **JobContext**: what a handler sees while it runs
//! - **ProgressReporter**: persists and announces progress from inside a handler
//! - **Executor**: looks up the handler for a job and runs it, turning panics into errors

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error};

use super::job::{Job, JobState, PROGRESS_MAX, PROGRESS_MIN};
use super::pubsub::{publish_state_change, PubSub};
use super::store::JobStore;
use crate::error::{ErrorCode, Result, SchedulerError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a handler. Stored on the job as its failure text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<SchedulerError> for JobError {
    fn from(error: SchedulerError) -> Self {
        let message = match error.internal_message() {
            Some(internal) => format!("{}: {}", error.user_message(), internal),
            None => error.user_message().to_string(),
        };
        Self {
            message,
            code: Some(error.code().to_string()),
        }
    }
}

/// Result type for handlers. `Ok` carries the opaque result stored on the job.
pub type HandlerResult = std::result::Result<String, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// Business logic for one job type.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the job with its stored input.
    ///
    /// Long-running handlers should watch [`JobContext::cancelled`]; the run is
    /// canceled at its deadline or on request, but it is never forcibly stopped.
    async fn handle(&self, ctx: &JobContext, input: String) -> HandlerResult;
}

/// Handler built from an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(JobContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: &JobContext, input: String) -> HandlerResult {
        (self.0)(ctx.clone(), input).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Progress Reporter
// ═══════════════════════════════════════════════════════════════════════════════

/// Persists progress of a running job and announces it.
#[derive(Clone)]
pub struct ProgressReporter {
    uid: String,
    job_type: String,
    group_id: String,
    store: Arc<dyn JobStore>,
    pubsub: Arc<dyn PubSub>,
}

impl ProgressReporter {
    pub(crate) fn new(job: &Job, store: Arc<dyn JobStore>, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            uid: job.uid.clone(),
            job_type: job.job_type.clone(),
            group_id: job.group_id.clone(),
            store,
            pubsub,
        }
    }

    /// Record `progress` (0 to 100) and an intermediate result.
    ///
    /// Only state, result, progress and update time are written, so this never
    /// races with the scheduler's execution bookkeeping.
    pub async fn report(&self, progress: i32, result: impl Into<String>) -> Result<()> {
        if !(PROGRESS_MIN..=PROGRESS_MAX).contains(&progress) {
            return Err(SchedulerError::new(
                ErrorCode::InvalidProgress,
                format!(
                    "progress must be between {} and {}, got {}",
                    PROGRESS_MIN, PROGRESS_MAX, progress
                ),
            ));
        }

        let update = Job {
            uid: self.uid.clone(),
            job_type: self.job_type.clone(),
            group_id: self.group_id.clone(),
            state: JobState::Running,
            run_progress: progress,
            result: result.into(),
            updated: Utc::now(),
            ..Default::default()
        };

        self.store.update_progress(&update).await?;
        publish_state_change(self.pubsub.as_ref(), &update).await;

        debug!(job.uid = %self.uid, progress, "Job progress reported");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
#[derive(Clone)]
pub struct JobContext {
    uid: String,
    job_type: String,
    deadline: Option<DateTime<Utc>>,
    cancellation: CancellationToken,
    reporter: ProgressReporter,
}

impl JobContext {
    pub(crate) fn new(job: &Job, cancellation: CancellationToken, reporter: ProgressReporter) -> Self {
        Self {
            uid: job.uid.clone(),
            job_type: job.job_type.clone(),
            deadline: job.run_deadline,
            cancellation,
            reporter,
        }
    }

    /// Get the job UID.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Get the job type.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Absolute deadline of this run.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the run is canceled or its deadline passes.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Run `future` unless the job is canceled first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    /// Report progress. See [`ProgressReporter::report`].
    pub async fn report_progress(&self, progress: i32, result: impl Into<String>) -> Result<()> {
        self.reporter.report(progress, result).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns the `job type -> handler` registry and runs single jobs.
pub struct Executor {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    registration_closed: AtomicBool,
    store: Arc<dyn JobStore>,
    pubsub: Arc<dyn PubSub>,
}

impl Executor {
    /// Create an executor.
    ///
    /// The first executor in a process chains a hook onto the process-wide panic
    /// hook. The previous hook still runs for every panic; the stack is only
    /// captured for panics raised while a handler is being polled.
    pub fn new(store: Arc<dyn JobStore>, pubsub: Arc<dyn PubSub>) -> Self {
        install_panic_capture();
        Self {
            handlers: RwLock::new(HashMap::new()),
            registration_closed: AtomicBool::new(false),
            store,
            pubsub,
        }
    }

    /// Register the handler for `job_type`.
    ///
    /// Registration is a boot-time step. It closes once the scheduler starts.
    pub fn register(&self, job_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        if self.registration_closed.load(Ordering::Acquire) {
            return Err(SchedulerError::new(
                ErrorCode::RegistrationClosed,
                format!("cannot register handler for {} after start", job_type),
            ));
        }

        if job_type.is_empty() {
            return Err(SchedulerError::new(
                ErrorCode::InvalidHandler,
                "job type must not be empty",
            ));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(job_type) {
            return Err(SchedulerError::new(
                ErrorCode::HandlerAlreadyRegistered,
                format!("handler already registered for type: {}", job_type),
            ));
        }
        handlers.insert(job_type.to_string(), handler);

        debug!(job.job_type = %job_type, "Handler registered");
        Ok(())
    }

    /// Close the registration window.
    pub fn finish_registration(&self) {
        self.registration_closed.store(true, Ordering::Release);
    }

    /// Run `job` with its registered handler.
    ///
    /// Handler panics are caught and returned as errors carrying the panic message
    /// and the stack captured at the panic site.
    pub async fn exec(&self, job: &Job, cancellation: CancellationToken) -> HandlerResult {
        let handler = self
            .handlers
            .read()
            .get(&job.job_type)
            .cloned()
            .ok_or_else(|| JobError::from(SchedulerError::handler_not_found(&job.job_type)))?;

        let reporter = ProgressReporter::new(job, self.store.clone(), self.pubsub.clone());
        let ctx = JobContext::new(job, cancellation, reporter);

        let mut run = handler.handle(&ctx, job.data.clone());
        let traced = futures::future::poll_fn(move |cx| {
            let _capture = CaptureGuard::enter();
            run.as_mut().poll(cx)
        });

        match AssertUnwindSafe(traced).catch_unwind().await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let trace = take_panic_trace().unwrap_or_default();
                error!(
                    job.uid = %job.uid,
                    job.job_type = %job.job_type,
                    panic = %message,
                    "Job handler panicked"
                );
                Err(JobError::new(format!("panic: {}\n{}", message, trace))
                    .with_code(ErrorCode::JobPanicked.to_string()))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Panic Capture
// ═══════════════════════════════════════════════════════════════════════════════

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records where a handler panic happened and its
/// stack, so a caught panic can be reported with the stack of the panicking code.
fn install_panic_capture() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !CAPTURING.with(Cell::get) {
                previous(info);
                return;
            }
            let location = info
                .location()
                .map(|l| format!("at {}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_default();
            let trace = format!("{}\n{}", location, Backtrace::force_capture());
            LAST_PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Marks the current thread as polling a handler until dropped.
struct CaptureGuard {
    previous: bool,
}

impl CaptureGuard {
    fn enter() -> Self {
        Self {
            previous: CAPTURING.with(|c| c.replace(true)),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURING.with(|c| c.set(self.previous));
    }
}

fn take_panic_trace() -> Option<String> {
    LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

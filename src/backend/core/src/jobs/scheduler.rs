//! Background job scheduler.
//!
//! One control loop per process wakes up on its [`SchedulerTimer`], takes the
//! global lock, claims ready jobs up to the concurrency budget and launches each
//! one as its own task. Finished runs re-take the lock to persist their outcome
//! and decide whether the job is retried, re-armed or done.
//!
//! The loop wakes up for three reasons:
//!
//! - **Shutdown**: the caller's token is canceled; the loop exits
//! - **Signal**: something may have become due earlier (a submission, a finished
//!   job while the timer is edgy, a rescheduled job)
//! - **Timer**: a pass over ready jobs

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use super::builtin::{
    OverdueJobHandler, PurgeJobHandler, JOB_TYPE_OVERDUE, JOB_TYPE_PURGE, JOB_UID_OVERDUE,
    JOB_UID_PURGE,
};
use super::executor::{Executor, Handler};
use super::job::{Definition, Job, JobPriority, JobState, Progress, PROGRESS_MAX, PROGRESS_MIN};
use super::lock::{global_lock, release, MutexManager};
use super::pubsub::{publish_state_change, MessageHandler, PubSub, Subscription, TOPIC_CANCEL_JOB};
use super::recurrence;
use super::store::JobStore;
use super::timer::SchedulerTimer;
use crate::config::SchedulerConfig;
use crate::error::{ErrorCode, Result, SchedulerError};
use crate::telemetry::metrics;

/// Delay before a failed job with retries left runs again.
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Fallback wait when no scheduled job is known.
const DEFAULT_PASS_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum run time of the built-in maintenance jobs.
const BUILTIN_MAX_DURATION: Duration = Duration::from_secs(5);

const ALREADY_RUNNING: &str = "failed to start: already running";

// ═══════════════════════════════════════════════════════════════════════════════
// Wakeup
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for nudging the control loop.
#[derive(Clone)]
pub struct Wakeup {
    tx: mpsc::UnboundedSender<Option<DateTime<Utc>>>,
}

impl Wakeup {
    /// Ask for a pass no later than `time`.
    pub fn at(&self, time: DateTime<Utc>) {
        // The loop has exited if the receiver is gone.
        let _ = self.tx.send(Some(time));
    }

    /// Ask for a pass if the last one left ready jobs behind.
    pub fn if_edgy(&self) {
        let _ = self.tx.send(None);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cancel hooks
// ═══════════════════════════════════════════════════════════════════════════════

/// Cancellation tokens of the jobs running in this process.
#[derive(Clone, Default)]
struct CancelHooks {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancelHooks {
    /// Register `token` for `uid`. Returns `None` if the UID is already running here.
    fn register(&self, uid: &str, token: CancellationToken) -> Option<CancelHookGuard> {
        let mut tokens = self.tokens.lock();
        if tokens.contains_key(uid) {
            return None;
        }
        tokens.insert(uid.to_string(), token);
        Some(CancelHookGuard {
            hooks: self.clone(),
            uid: uid.to_string(),
        })
    }

    /// Cancel the run of `uid`. Returns false if it does not run here.
    fn cancel(&self, uid: &str) -> bool {
        let token = self.tokens.lock().get(uid).cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct CancelHookGuard {
    hooks: CancelHooks,
    uid: String,
}

impl Drop for CancelHookGuard {
    fn drop(&mut self) {
        self.hooks.tokens.lock().remove(&self.uid);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one pass over ready jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PassOutcome {
    started: usize,
    next: Option<DateTime<Utc>>,
    got_all: bool,
}

struct Inner {
    store: Arc<dyn JobStore>,
    executor: Executor,
    mutex_manager: Arc<dyn MutexManager>,
    pubsub: Arc<dyn PubSub>,
    config: SchedulerConfig,
    wakeup: Wakeup,
    signals: Mutex<Option<mpsc::UnboundedReceiver<Option<DateTime<Utc>>>>>,
    running: TaskTracker,
    cancel_hooks: CancelHooks,
    jobs_root: CancellationToken,
}

/// Background job scheduler. Cheap to clone; clones share the same loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler. `config.max_running` below one is treated as one.
    pub fn new(
        store: Arc<dyn JobStore>,
        mutex_manager: Arc<dyn MutexManager>,
        pubsub: Arc<dyn PubSub>,
        mut config: SchedulerConfig,
    ) -> Self {
        config.max_running = config.max_running.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Executor::new(store.clone(), pubsub.clone());

        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                mutex_manager,
                pubsub,
                config,
                wakeup: Wakeup { tx },
                signals: Mutex::new(Some(rx)),
                running: TaskTracker::new(),
                cancel_hooks: CancelHooks::default(),
                jobs_root: CancellationToken::new(),
            }),
        }
    }

    /// Register the handler for `job_type`. Only allowed before [`run`](Self::run).
    pub fn register(&self, job_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        self.inner.executor.register(job_type, handler)
    }

    /// Handle for nudging the control loop.
    pub fn wakeup(&self) -> Wakeup {
        self.inner.wakeup.clone()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Run the control loop until `shutdown` is canceled.
    ///
    /// Creates the built-in maintenance jobs, registers their handlers and closes
    /// handler registration first. Fails if the loop was already started. A failed
    /// startup leaves the scheduler unstarted, so `run` may be called again.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let signals = self.inner.signals.lock().take().ok_or_else(|| {
            SchedulerError::new(ErrorCode::AlreadyStarted, "job scheduler already started")
        })?;

        let subscription = match self.inner.start().await {
            Ok(subscription) => subscription,
            Err(e) => {
                *self.inner.signals.lock() = Some(signals);
                return Err(e);
            }
        };

        self.inner.clone().run_loop(signals, shutdown).await;

        subscription.close().await;
        self.inner.jobs_root.cancel();
        Ok(())
    }

    /// Wait until every job launched by this instance has finished.
    ///
    /// Intended for graceful shutdown after [`run`](Self::run) has returned.
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_jobs_done(&self, timeout: Duration) -> bool {
        debug!("Job scheduler stopping, waiting for running jobs to finish");
        self.inner.running.close();

        match tokio::time::timeout(timeout, self.inner.running.wait()).await {
            Ok(()) => {
                info!("Job scheduler gracefully stopped");
                true
            }
            Err(_) => {
                warn!(
                    still_running = self.inner.running.len(),
                    "Job scheduler stop interrupted"
                );
                false
            }
        }
    }

    /// Submit a single job, due now.
    #[instrument(skip(self, def), fields(job.uid = %def.uid, job.job_type = %def.job_type))]
    pub async fn run_job(&self, def: Definition) -> Result<()> {
        def.validate()?;

        let job = def.to_new_job(Utc::now());
        self.inner.store.create(&job).await?;
        self.inner.wakeup.at(job.scheduled);

        Ok(())
    }

    /// Submit several jobs sharing `group_id`. All definitions are validated
    /// before anything is stored, and the loop is nudged once.
    #[instrument(skip(self, defs), fields(count = defs.len()))]
    pub async fn run_jobs(&self, group_id: &str, defs: Vec<Definition>) -> Result<()> {
        if defs.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut jobs = Vec::with_capacity(defs.len());
        for def in &defs {
            def.validate()?;
            let mut job = def.to_new_job(now);
            job.group_id = group_id.to_string();
            jobs.push(job);
        }

        for job in &jobs {
            self.inner.store.create(job).await?;
        }

        self.inner.wakeup.at(now);
        Ok(())
    }

    /// Register a recurring job. Re-registering an unchanged job leaves its row alone.
    pub async fn add_recurring(
        &self,
        uid: &str,
        job_type: &str,
        cron: &str,
        max_duration: Duration,
    ) -> Result<()> {
        self.inner
            .add_recurring(uid, job_type, cron, max_duration)
            .await
    }

    /// Cancel a scheduled or running job.
    ///
    /// Missing and already finished jobs are left alone without error. Recurring
    /// jobs cannot be canceled.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, uid: &str) -> Result<()> {
        let mutex = global_lock(self.inner.mutex_manager.as_ref()).await?;
        let result = self.inner.cancel_locked(uid).await;
        release(mutex).await;
        result
    }

    /// Progress of a job.
    pub async fn get_job_progress(&self, uid: &str) -> Result<Progress> {
        self.inner
            .store
            .find(uid)
            .await?
            .map(|job| job.progress())
            .ok_or_else(|| SchedulerError::job_not_found(uid))
    }

    /// Progress of every job of a group.
    pub async fn get_job_progress_for_group(&self, group_id: &str) -> Result<Vec<Progress>> {
        let jobs = self.inner.store.list_by_group_id(group_id).await?;
        Ok(jobs.iter().map(Job::progress).collect())
    }

    /// Delete every job of a group. Returns how many were deleted.
    pub async fn purge_jobs_by_group_id(&self, group_id: &str) -> Result<u64> {
        self.inner.store.delete_by_group_id(group_id).await
    }

    /// Delete a single job.
    pub async fn purge_job_by_uid(&self, uid: &str) -> Result<()> {
        self.inner.store.delete_by_uid(uid).await
    }
}

impl Inner {
    /// Startup work that must succeed before the loop runs.
    async fn start(&self) -> Result<Subscription> {
        self.create_necessary_jobs().await?;
        let subscription = self.subscribe_cancel_requests().await?;

        if let Err(e) = self.register_necessary_jobs() {
            subscription.close().await;
            return Err(e);
        }
        self.executor.finish_registration();

        Ok(subscription)
    }

    async fn run_loop(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<Option<DateTime<Utc>>>,
        shutdown: CancellationToken,
    ) {
        debug!(instance_id = %self.config.instance_id, "Job scheduler starting");

        let mut timer = SchedulerTimer::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Job scheduler shutting down");
                    return;
                }

                Some(next) = signals.recv() => {
                    let wait = timer.reschedule_earlier(next);
                    if !wait.is_zero() {
                        trace!(wait_ms = wait.as_millis() as u64, "Job processing moved earlier");
                    }
                }

                _ = timer.fired() => {
                    self.pass(&mut timer).await;
                }
            }
        }
    }

    /// One timer-driven pass. Panics are contained so the loop keeps running.
    async fn pass(self: &Arc<Self>, timer: &mut SchedulerTimer) {
        let now = Utc::now();

        let outcome = match AssertUnwindSafe(self.process_ready_jobs(now))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(panic = %message, "Job scheduler panic");
                Err(SchedulerError::internal(format!("job scheduler panic: {}", message)))
            }
        };

        let (next, got_all) = match &outcome {
            Ok(o) => (o.next, o.got_all),
            Err(_) => (None, false),
        };
        let next = next.unwrap_or_else(|| now + chrono_duration(DEFAULT_PASS_INTERVAL));

        // Edgy when ready jobs were left behind.
        let wait = timer.reset_at(next, !got_all);
        metrics::loop_pass(outcome.is_err());

        match outcome {
            Ok(o) => trace!(
                started = o.started,
                next_ms = wait.as_millis() as u64,
                "Job scheduler pass done"
            ),
            Err(e) => {
                e.log();
                error!(
                    error = %e,
                    next_ms = wait.as_millis() as u64,
                    "Job scheduler failed to process jobs"
                );
            }
        }
    }

    /// Claim and launch ready jobs under the global lock.
    async fn process_ready_jobs(self: &Arc<Self>, now: DateTime<Utc>) -> Result<PassOutcome> {
        let mutex = global_lock(self.mutex_manager.as_ref()).await?;
        let outcome = self.claim_ready_jobs(now).await;
        release(mutex).await;
        outcome
    }

    async fn claim_ready_jobs(self: &Arc<Self>, now: DateTime<Utc>) -> Result<PassOutcome> {
        let running = self.store.count_running().await?;
        let available = self.config.max_running.saturating_sub(running);

        // One over the limit tells whether everything ready was fetched.
        let mut jobs = self.store.list_ready(now, available + 1).await?;

        let mut outcome = PassOutcome {
            started: 0,
            next: None,
            got_all: false,
        };

        if jobs.len() > available {
            jobs.truncate(available);
        } else {
            outcome.got_all = true;
            outcome.next = self.store.next_scheduled_time(now).await?;
        }

        for mut job in jobs {
            pre_exec(&mut job, &self.config.instance_id, Utc::now());

            if let Err(e) = self.store.update_execution(&job).await {
                outcome.next = None;
                outcome.got_all = false;
                e.log();
                warn!(
                    job.uid = %job.uid,
                    job.job_type = %job.job_type,
                    error = %e,
                    "Failed to mark job as running"
                );
                continue;
            }

            publish_state_change(self.pubsub.as_ref(), &job).await;

            metrics::job_started(&job.job_type);
            let inner = self.clone();
            self.running.spawn(async move { inner.run_job(job).await });

            outcome.started += 1;
        }

        Ok(outcome)
    }

    /// Run a claimed job and persist its outcome.
    async fn run_job(self: Arc<Self>, job: Job) {
        debug!(job.uid = %job.uid, job.job_type = %job.job_type, "Job started");
        let started = Instant::now();

        let outcome = self.do_exec(&job).await;

        // Persist the outcome even without the lock rather than lose it.
        let mutex = match global_lock(self.mutex_manager.as_ref()).await {
            Ok(mutex) => Some(mutex),
            Err(e) => {
                e.log();
                warn!(
                    job.uid = %job.uid,
                    error = %e,
                    "Failed to obtain global lock to update job after execution"
                );
                None
            }
        };

        let finished = self.finish_job(&job.uid, outcome).await;

        if let Some(mutex) = mutex {
            release(mutex).await;
        }

        let Some(job) = finished else {
            metrics::job_completed(&job.job_type, "unknown", started.elapsed());
            return;
        };

        let elapsed = started.elapsed();
        metrics::job_completed(&job.job_type, job.state.as_str(), elapsed);

        match job.state {
            JobState::Finished => {
                info!(
                    job.uid = %job.uid,
                    job.job_type = %job.job_type,
                    duration_ms = elapsed.as_millis() as u64,
                    result = %job.result,
                    "Job successfully finished"
                );
                self.wakeup.if_edgy();
            }
            JobState::Failed => {
                info!(
                    job.uid = %job.uid,
                    job.job_type = %job.job_type,
                    duration_ms = elapsed.as_millis() as u64,
                    failure = %job.last_failure_error,
                    "Job failed"
                );
                self.wakeup.if_edgy();
            }
            JobState::Canceled => {
                error!(job.uid = %job.uid, job.job_type = %job.job_type, "Job canceled");
                self.wakeup.if_edgy();
            }
            JobState::Scheduled => {
                info!(
                    job.uid = %job.uid,
                    job.job_type = %job.job_type,
                    duration_ms = elapsed.as_millis() as u64,
                    recurring = job.is_recurring,
                    scheduled = %job.scheduled,
                    failure = %job.last_failure_error,
                    "Job finished and rescheduled"
                );
                self.wakeup.at(job.scheduled);
            }
            JobState::Running => {
                error!(
                    job.uid = %job.uid,
                    "Job still has state running after finishing"
                );
            }
        }

        publish_state_change(self.pubsub.as_ref(), &job).await;
    }

    /// Execute `job` with a token canceled on request or at the run deadline.
    async fn do_exec(&self, job: &Job) -> std::result::Result<String, String> {
        let token = self.jobs_root.child_token();

        let Some(_hook) = self.cancel_hooks.register(&job.uid, token.clone()) else {
            // UIDs are unique, so this means a duplicate claim.
            return Err(ALREADY_RUNNING.to_string());
        };

        let deadline = job.run_deadline.unwrap_or_else(Utc::now);
        let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let exec = self.executor.exec(job, token.clone());
        tokio::pin!(exec);

        let result = tokio::select! {
            result = &mut exec => result,
            _ = tokio::time::sleep(wait) => {
                debug!(job.uid = %job.uid, "Job run deadline reached, canceling");
                token.cancel();
                exec.await
            }
        };

        result.map_err(|e| e.to_string())
    }

    /// Reload the job, apply the post-execution rules and persist.
    async fn finish_job(
        &self,
        uid: &str,
        outcome: std::result::Result<String, String>,
    ) -> Option<Job> {
        let mut job = match self.store.find(uid).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job.uid = %uid, "Job disappeared during execution");
                return None;
            }
            Err(e) => {
                e.log();
                error!(job.uid = %uid, "Failed to find job after execution");
                return None;
            }
        };

        post_exec(&mut job, outcome, Utc::now());

        if let Err(e) = self.store.update_execution(&job).await {
            e.log();
            error!(job.uid = %uid, "Failed to update job after execution");
            return None;
        }

        Some(job)
    }

    async fn cancel_locked(&self, uid: &str) -> Result<()> {
        let Some(mut job) = self.store.find(uid).await? else {
            return Ok(());
        };

        if job.is_recurring {
            return Err(SchedulerError::new(
                ErrorCode::InvalidStateTransition,
                "can't cancel recurring jobs",
            ));
        }

        if job.state != JobState::Scheduled && job.state != JobState::Running {
            return Ok(());
        }

        job.updated = Utc::now();
        job.state = JobState::Canceled;
        job.run_by.clear();
        self.store.update_execution(&job).await?;

        publish_state_change(self.pubsub.as_ref(), &job).await;

        if self.cancel_hooks.cancel(uid) {
            debug!(job.uid = %uid, "Canceled job running on this instance");
            return Ok(());
        }

        self.pubsub
            .publish(TOPIC_CANCEL_JOB, uid.as_bytes().to_vec())
            .await
    }

    async fn subscribe_cancel_requests(&self) -> Result<Subscription> {
        let hooks = self.cancel_hooks.clone();
        let handler: MessageHandler = Arc::new(move |payload: Vec<u8>| {
            let uid = String::from_utf8_lossy(&payload);
            if uid.is_empty() {
                return;
            }
            if hooks.cancel(&uid) {
                debug!(job.uid = %uid, "Canceled job on request from another instance");
            }
        });

        self.pubsub.subscribe(TOPIC_CANCEL_JOB, handler).await
    }

    async fn add_recurring(
        &self,
        uid: &str,
        job_type: &str,
        cron: &str,
        max_duration: Duration,
    ) -> Result<()> {
        if uid.is_empty() || job_type.is_empty() {
            return Err(SchedulerError::validation(
                "recurring job must have a unique identifier and a type",
            ));
        }

        let now = Utc::now();
        let scheduled = recurrence::next_fire(cron, now)?;

        let job = Job {
            uid: uid.to_string(),
            created: now,
            updated: now,
            job_type: job_type.to_string(),
            priority: JobPriority::Elevated,
            max_duration_seconds: i32::try_from(max_duration.as_secs()).unwrap_or(i32::MAX),
            max_retries: 0,
            state: JobState::Scheduled,
            scheduled,
            is_recurring: true,
            recurring_cron: cron.to_string(),
            ..Default::default()
        };

        self.store.upsert(&job).await?;
        debug!(job.uid = %uid, job.job_type = %job_type, %scheduled, "Recurring job registered");
        Ok(())
    }

    async fn create_necessary_jobs(&self) -> Result<()> {
        let mutex = global_lock(self.mutex_manager.as_ref()).await?;

        let result = async {
            self.add_recurring(
                JOB_UID_PURGE,
                JOB_TYPE_PURGE,
                &self.config.purge_cron,
                BUILTIN_MAX_DURATION,
            )
            .await?;
            self.add_recurring(
                JOB_UID_OVERDUE,
                JOB_TYPE_OVERDUE,
                &self.config.overdue_cron,
                BUILTIN_MAX_DURATION,
            )
            .await
        }
        .await;

        release(mutex).await;
        result
    }

    fn register_necessary_jobs(&self) -> Result<()> {
        self.executor.register(
            JOB_TYPE_OVERDUE,
            Arc::new(OverdueJobHandler::new(
                self.store.clone(),
                self.mutex_manager.clone(),
                self.pubsub.clone(),
                self.wakeup.clone(),
            )),
        )?;

        self.executor.register(
            JOB_TYPE_PURGE,
            Arc::new(PurgeJobHandler::new(
                self.store.clone(),
                self.mutex_manager.clone(),
                self.config.retention_time,
            )),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution bookkeeping
// ═══════════════════════════════════════════════════════════════════════════════

/// Prepare a claimed job for a new run.
pub(crate) fn pre_exec(job: &mut Job, instance_id: &str, now: DateTime<Utc>) {
    if job.max_duration_seconds < 1 {
        job.max_duration_seconds = 1;
    }

    job.updated = now;
    job.last_executed = Some(now);
    job.state = JobState::Running;
    job.run_deadline = Some(now + chrono::Duration::seconds(i64::from(job.max_duration_seconds)));
    job.run_by = instance_id.to_string();
    job.run_progress = PROGRESS_MIN;
    job.total_executions += 1;
    job.result.clear();
    job.last_failure_error.clear();
}

/// Apply the outcome of a run and reschedule the job if needed.
///
/// Only running jobs are updated, plus canceled jobs whose run succeeded anyway:
/// success beats a late cancellation. Recurring jobs are always re-armed at their
/// next cron fire. Other jobs are retried after [`RETRY_DELAY`] while
/// `consecutive_failures <= max_retries`.
pub(crate) fn post_exec(
    job: &mut Job,
    outcome: std::result::Result<String, String>,
    now: DateTime<Utc>,
) {
    match (job.state, &outcome) {
        (JobState::Running, _) | (JobState::Canceled, Ok(_)) => {}
        (JobState::Canceled, Err(_)) => {
            job.updated = now;
            job.run_by.clear();
            return;
        }
        _ => return,
    }

    let succeeded = outcome.is_ok();

    job.updated = now;
    job.run_by.clear();

    match outcome {
        Ok(result) => {
            job.result = result;
            job.state = JobState::Finished;
            job.run_progress = PROGRESS_MAX;
        }
        Err(failure) => {
            job.result.clear();
            job.consecutive_failures += 1;
            job.state = JobState::Failed;
            job.last_failure_error = failure;
        }
    }

    if job.is_recurring {
        if succeeded {
            job.consecutive_failures = 0;
        }

        match recurrence::next_fire(&job.recurring_cron, now) {
            Ok(next) => {
                job.state = JobState::Scheduled;
                job.scheduled = next;
            }
            Err(e) => {
                job.state = JobState::Failed;
                let mut message = format!(
                    "failed to parse cron string: {}",
                    e.internal_message().unwrap_or(e.user_message())
                );
                if !job.last_failure_error.is_empty() {
                    message.push_str("; ");
                    message.push_str(&job.last_failure_error);
                }
                job.last_failure_error = message;
            }
        }

        return;
    }

    if job.state == JobState::Failed && job.consecutive_failures <= job.max_retries {
        job.state = JobState::Scheduled;
        job.scheduled = now + chrono_duration(RETRY_DELAY);
        job.run_progress = PROGRESS_MIN;
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

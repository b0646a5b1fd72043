//! End-to-end tests for the job scheduler on the in-memory backends.
//!
//! Tests cover:
//! - Submission and execution of single jobs and groups
//! - Failure, panic and unknown handler outcomes
//! - Progress reporting
//! - Cancellation, local and across instances
//! - Recurring job registration
//! - Concurrency budget and run deadlines
//! - Startup and shutdown behavior

use apex_scheduler::config::SchedulerConfig;
use apex_scheduler::error::ErrorCode;
use apex_scheduler::jobs::{
    handler_fn, Definition, InMemoryJobStore, InMemoryMutexManager, InMemoryPubSub, Job,
    JobError, JobPriority, JobState, JobStore, PubSub, Scheduler, StateChange, TOPIC_STATE_CHANGE,
};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

struct Cluster {
    store: InMemoryJobStore,
    locks: Arc<InMemoryMutexManager>,
    pubsub: Arc<InMemoryPubSub>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            store: InMemoryJobStore::new(),
            locks: Arc::new(InMemoryMutexManager::default()),
            pubsub: Arc::new(InMemoryPubSub::new()),
        }
    }

    fn scheduler(&self, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(
            Arc::new(self.store.clone()),
            self.locks.clone(),
            self.pubsub.clone(),
            config,
        )
    }
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<apex_scheduler::Result<()>>,
}

impl Running {
    async fn stop(self, scheduler: &Scheduler) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
        assert!(scheduler.wait_jobs_done(Duration::from_secs(5)).await);
    }
}

fn start(scheduler: &Scheduler) -> Running {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });
    Running { shutdown, handle }
}

async fn wait_for<F>(store: &InMemoryJobStore, uid: &str, predicate: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(job) = store.find(uid).await.unwrap() {
            if predicate(&job) {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {}",
            uid
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_state(store: &InMemoryJobStore, uid: &str, state: JobState) -> Job {
    wait_for(store, uid, |j| j.state == state).await
}

fn def(uid: &str, job_type: &str) -> Definition {
    Definition::new(uid, job_type, Duration::from_secs(30))
}

// ============================================================================
// Execution Tests
// ============================================================================

#[tokio::test]
async fn test_run_job_finishes() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default().with_instance_id("node-a"));
    scheduler
        .register(
            "greet",
            handler_fn(|_ctx, input| async move { Ok::<_, JobError>(format!("hello {}", input)) }),
        )
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = cluster
        .pubsub
        .subscribe(
            TOPIC_STATE_CHANGE,
            Arc::new(move |payload: Vec<u8>| {
                if let Ok(change) = serde_json::from_slice::<StateChange>(&payload) {
                    let _ = tx.send(change);
                }
            }),
        )
        .await
        .unwrap();

    let running = start(&scheduler);
    scheduler
        .run_job(def("greet-1", "greet").with_data("world"))
        .await
        .unwrap();

    let job = wait_for_state(&cluster.store, "greet-1", JobState::Finished).await;
    assert_eq!(job.result, "hello world");
    assert_eq!(job.run_progress, 100);
    assert_eq!(job.total_executions, 1);
    assert_eq!(job.consecutive_failures, 0);
    assert!(job.run_by.is_empty());
    assert!(job.last_executed.is_some());

    let progress = scheduler.get_job_progress("greet-1").await.unwrap();
    assert_eq!(progress.state, JobState::Finished);
    assert_eq!(progress.progress, 100);

    running.stop(&scheduler).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut states = Vec::new();
    while let Ok(change) = rx.try_recv() {
        if change.uid == "greet-1" {
            states.push(change.state);
        }
    }
    assert_eq!(states.first(), Some(&JobState::Running));
    assert_eq!(states.last(), Some(&JobState::Finished));
}

#[tokio::test]
async fn test_failing_job_without_retries() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "fail",
            handler_fn(|_ctx, _input| async { Err::<String, _>(JobError::new("boom")) }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler.run_job(def("fail-1", "fail")).await.unwrap();

    let job = wait_for_state(&cluster.store, "fail-1", JobState::Failed).await;
    assert_eq!(job.consecutive_failures, 1);
    assert_eq!(job.last_failure_error, "boom");
    assert!(job.result.is_empty());

    let progress = scheduler.get_job_progress("fail-1").await.unwrap();
    assert_eq!(progress.failure, "boom");

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_failing_job_with_retries_is_rescheduled() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "fail",
            handler_fn(|_ctx, _input| async { Err::<String, _>(JobError::new("try again")) }),
        )
        .unwrap();

    let running = start(&scheduler);
    let submitted = Utc::now();
    scheduler
        .run_job(def("retry-1", "fail").with_max_retries(2))
        .await
        .unwrap();

    let job = wait_for(&cluster.store, "retry-1", |j| {
        j.state == JobState::Scheduled && j.consecutive_failures == 1
    })
    .await;
    assert!(job.scheduled >= submitted + chrono::Duration::seconds(15));
    assert_eq!(job.last_failure_error, "try again");
    assert_eq!(job.total_executions, 1);

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_panicking_job_fails() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "panic",
            handler_fn(|_ctx, input: String| async move {
                if input.is_empty() {
                    panic!("kaboom");
                }
                Ok::<_, JobError>(input)
            }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler.run_job(def("panic-1", "panic")).await.unwrap();

    let job = wait_for_state(&cluster.store, "panic-1", JobState::Failed).await;
    assert!(job.last_failure_error.starts_with("panic: kaboom"));
    assert!(job.last_failure_error.contains("JobPanicked"));

    // The loop survives and keeps running jobs.
    scheduler
        .run_job(def("panic-2", "panic").with_data("fine"))
        .await
        .unwrap();
    let job = wait_for_state(&cluster.store, "panic-2", JobState::Finished).await;
    assert_eq!(job.result, "fine");

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_job_without_handler_fails() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    let running = start(&scheduler);
    scheduler.run_job(def("orphan", "nobody")).await.unwrap();

    let job = wait_for_state(&cluster.store, "orphan", JobState::Failed).await;
    assert!(job.last_failure_error.contains("no handler for type: nobody"));

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_progress_reporting_bounds() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler
        .register(
            "steps",
            handler_fn(move |ctx, _input| {
                let tx = tx.clone();
                async move {
                    ctx.report_progress(40, "partial").await?;
                    let out_of_range = ctx.report_progress(150, "").await;
                    let _ = tx.send(out_of_range.err().map(|e| e.code()));
                    Err::<String, _>(JobError::new("stopped halfway"))
                }
            }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler.run_job(def("steps-1", "steps")).await.unwrap();

    let job = wait_for_state(&cluster.store, "steps-1", JobState::Failed).await;
    assert_eq!(job.run_progress, 40);

    let code = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(code, Some(ErrorCode::InvalidProgress));

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_deadline_cancels_handler() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "slow",
            handler_fn(|ctx, _input| async move {
                ctx.cancelled().await;
                Err::<String, _>(JobError::new("gave up at deadline"))
            }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler
        .run_job(Definition::new("slow-1", "slow", Duration::from_secs(1)))
        .await
        .unwrap();

    let job = wait_for_state(&cluster.store, "slow-1", JobState::Failed).await;
    assert_eq!(job.last_failure_error, "gave up at deadline");

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_concurrency_budget() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default().with_max_running(2));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    scheduler
        .register(
            "work",
            handler_fn({
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                move |_ctx, _input| {
                    let inside = inside.clone();
                    let max_inside = max_inside.clone();
                    async move {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, JobError>(String::new())
                    }
                }
            }),
        )
        .unwrap();

    let defs = (0..5).map(|i| def(&format!("work-{}", i), "work")).collect();
    scheduler.run_jobs("budget", defs).await.unwrap();

    let running = start(&scheduler);
    for i in 0..5 {
        wait_for_state(&cluster.store, &format!("work-{}", i), JobState::Finished).await;
    }
    running.stop(&scheduler).await;

    assert!(max_inside.load(Ordering::SeqCst) <= 2);
    assert!(max_inside.load(Ordering::SeqCst) >= 1);
}

// ============================================================================
// Submission Tests
// ============================================================================

#[tokio::test]
async fn test_run_job_validation_and_duplicates() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    let err = scheduler.run_job(def("", "t")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let err = scheduler
        .run_job(Definition::new("x", "t", Duration::ZERO))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    scheduler.run_job(def("dup", "t")).await.unwrap();
    let err = scheduler.run_job(def("dup", "t")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateRecord);
}

#[tokio::test]
async fn test_group_submission_and_purge() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "echo",
            handler_fn(|_ctx, input| async move { Ok::<_, JobError>(input) }),
        )
        .unwrap();

    scheduler.run_jobs("empty", Vec::new()).await.unwrap();

    // One invalid definition rejects the whole batch.
    let err = scheduler
        .run_jobs("bad", vec![def("bad-1", "echo"), def("", "echo")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(cluster.store.find("bad-1").await.unwrap().is_none());

    let defs = (0..3)
        .map(|i| def(&format!("batch-{}", i), "echo").with_data(format!("item {}", i)))
        .collect();
    scheduler.run_jobs("batch", defs).await.unwrap();

    let running = start(&scheduler);
    for i in 0..3 {
        let job = wait_for_state(&cluster.store, &format!("batch-{}", i), JobState::Finished).await;
        assert_eq!(job.group_id, "batch");
        assert_eq!(job.result, format!("item {}", i));
    }
    running.stop(&scheduler).await;

    let progress = scheduler.get_job_progress_for_group("batch").await.unwrap();
    assert_eq!(progress.len(), 3);
    assert!(progress.iter().all(|p| p.state == JobState::Finished));

    assert_eq!(scheduler.purge_jobs_by_group_id("batch").await.unwrap(), 3);
    assert!(scheduler.get_job_progress_for_group("batch").await.unwrap().is_empty());
    assert!(scheduler
        .get_job_progress("batch-0")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_purge_single_job() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    scheduler.run_job(def("gone", "t")).await.unwrap();
    scheduler.purge_job_by_uid("gone").await.unwrap();
    assert!(cluster.store.find("gone").await.unwrap().is_none());

    // Missing jobs are not an error.
    scheduler.purge_job_by_uid("gone").await.unwrap();
}

#[tokio::test]
async fn test_add_recurring_is_idempotent() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    scheduler
        .add_recurring("nightly", "report", "0 3 * * *", Duration::from_secs(60))
        .await
        .unwrap();
    let mut first = cluster.store.find("nightly").await.unwrap().unwrap();
    assert!(first.is_recurring);
    assert_eq!(first.priority, JobPriority::Elevated);
    assert_eq!(first.max_retries, 0);
    assert_eq!(first.state, JobState::Scheduled);
    assert!(first.scheduled > Utc::now());

    // Simulate earlier failed runs; re-registration must keep the counter.
    first.consecutive_failures = 2;
    first.total_executions = 2;
    cluster.store.update_execution(&first).await.unwrap();

    scheduler
        .add_recurring("nightly", "report", "0 3 * * *", Duration::from_secs(60))
        .await
        .unwrap();
    let second = cluster.store.find("nightly").await.unwrap().unwrap();
    assert_eq!(first, second);

    // A changed definition is applied.
    scheduler
        .add_recurring("nightly", "report", "0 4 * * *", Duration::from_secs(60))
        .await
        .unwrap();
    let third = cluster.store.find("nightly").await.unwrap().unwrap();
    assert_eq!(third.recurring_cron, "0 4 * * *");
    assert_eq!(third.consecutive_failures, 2);

    let err = scheduler
        .add_recurring("broken", "report", "not a cron", Duration::from_secs(60))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCronExpression);
    assert!(cluster.store.find("broken").await.unwrap().is_none());
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[tokio::test]
async fn test_cancel_running_job() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "wait",
            handler_fn(|ctx, _input| async move {
                ctx.cancelled().await;
                Err::<String, _>(JobError::new("canceled"))
            }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler.run_job(def("wait-1", "wait")).await.unwrap();
    wait_for_state(&cluster.store, "wait-1", JobState::Running).await;

    scheduler.cancel_job("wait-1").await.unwrap();

    // The handler observes cancellation and returns; the job stays canceled.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = cluster.store.find("wait-1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Canceled);
    assert_eq!(job.consecutive_failures, 0);
    assert!(job.run_by.is_empty());

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_success_beats_cancellation() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "stubborn",
            handler_fn(|_ctx, _input| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, JobError>("done anyway".to_string())
            }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler.run_job(def("stubborn-1", "stubborn")).await.unwrap();
    wait_for_state(&cluster.store, "stubborn-1", JobState::Running).await;

    scheduler.cancel_job("stubborn-1").await.unwrap();

    let job = wait_for_state(&cluster.store, "stubborn-1", JobState::Finished).await;
    assert_eq!(job.result, "done anyway");

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_cancel_scheduled_job_never_runs() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .register(
            "count",
            handler_fn({
                let calls = calls.clone();
                move |_ctx, _input| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, JobError>(String::new()) }
                }
            }),
        )
        .unwrap();

    scheduler.run_job(def("later", "count")).await.unwrap();
    scheduler.cancel_job("later").await.unwrap();

    let running = start(&scheduler);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    running.stop(&scheduler).await;

    let job = cluster.store.find("later").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Canceled);
    assert_eq!(job.total_executions, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_edge_cases() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    // Unknown job.
    scheduler.cancel_job("missing").await.unwrap();

    // Recurring jobs cannot be canceled.
    scheduler
        .add_recurring("hourly", "report", "0 * * * *", Duration::from_secs(60))
        .await
        .unwrap();
    let err = scheduler.cancel_job("hourly").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    assert_eq!(
        cluster.store.find("hourly").await.unwrap().unwrap().state,
        JobState::Scheduled
    );

    // Finished jobs are left alone.
    let finished = Job {
        uid: "done".to_string(),
        job_type: "t".to_string(),
        state: JobState::Finished,
        ..Default::default()
    };
    cluster.store.create(&finished).await.unwrap();
    scheduler.cancel_job("done").await.unwrap();
    assert_eq!(
        cluster.store.find("done").await.unwrap().unwrap().state,
        JobState::Finished
    );
}

#[tokio::test]
async fn test_cancel_from_another_instance() {
    let cluster = Cluster::new();
    let worker = cluster.scheduler(SchedulerConfig::default().with_instance_id("worker"));
    let api = cluster.scheduler(SchedulerConfig::default().with_instance_id("api"));

    worker
        .register(
            "wait",
            handler_fn(|ctx, _input| async move {
                ctx.cancelled().await;
                Err::<String, _>(JobError::new("canceled"))
            }),
        )
        .unwrap();

    let running = start(&worker);
    api.run_job(def("remote-1", "wait")).await.unwrap();

    let job = wait_for_state(&cluster.store, "remote-1", JobState::Running).await;
    assert_eq!(job.run_by, "worker");

    api.cancel_job("remote-1").await.unwrap();

    // The worker's handler is released through the cancel topic.
    assert!(
        tokio::time::timeout(Duration::from_secs(5), async {
            running.stop(&worker).await;
        })
        .await
        .is_ok()
    );
    let job = cluster.store.find("remote-1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Canceled);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_builtin_jobs_created_on_start() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    let running = start(&scheduler);
    for uid in ["apex:jobs:purge", "apex:jobs:overdue"] {
        let job = wait_for(&cluster.store, uid, |_| true).await;
        assert!(job.is_recurring);
        assert_eq!(job.priority, JobPriority::Elevated);
        assert_eq!(job.max_duration_seconds, 5);
        assert_eq!(job.state, JobState::Scheduled);
    }
    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_run_twice_and_late_registration_rejected() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    let running = start(&scheduler);
    wait_for(&cluster.store, "apex:jobs:overdue", |_| true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyStarted);

    let err = scheduler
        .register(
            "late",
            handler_fn(|_ctx, _input| async { Ok::<_, JobError>(String::new()) }),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RegistrationClosed);

    running.stop(&scheduler).await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let cluster = Cluster::new();
    let scheduler = cluster.scheduler(SchedulerConfig::default());
    scheduler
        .register(
            "wait",
            handler_fn(|ctx, _input| async move {
                ctx.cancelled().await;
                Err::<String, _>(JobError::new("interrupted by shutdown"))
            }),
        )
        .unwrap();

    let running = start(&scheduler);
    scheduler.run_job(def("long", "wait")).await.unwrap();
    wait_for_state(&cluster.store, "long", JobState::Running).await;

    running.stop(&scheduler).await;

    let job = cluster.store.find("long").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_failure_error, "interrupted by shutdown");
}

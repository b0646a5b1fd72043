//! Durable background jobs.
//!
//! - **Job**: persisted job rows, submission definitions and progress views
//! - **Store**: the persistence contract, with in-memory and PostgreSQL backends
//! - **Lock**: cluster-wide named mutexes, with in-memory and Redis backends
//! - **PubSub**: cancellation and state-change broadcasting
//! - **Executor**: handler registry and single-job execution
//! - **Scheduler**: the control loop and the submission API
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Scheduler                                   │
//! │   run_job / run_jobs / add_recurring / cancel_job / progress / purge     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │  Timer   │──▶│ Control loop │──▶│   Executor   │──▶│   Handlers   │   │
//! │  │ (edgy)   │   │ (claim pass) │   │ (per job)    │   │              │   │
//! │  └──────────┘   └──────────────┘   └──────────────┘   └──────────────┘   │
//! │        │               │                   │                             │
//! │        ▼               ▼                   ▼                             │
//! │  ┌──────────┐   ┌──────────────┐   ┌──────────────┐                      │
//! │  │  PubSub  │   │ Global lock  │   │   JobStore   │                      │
//! │  └──────────┘   └──────────────┘   └──────────────┘                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use apex_scheduler::jobs::{handler_fn, Definition, Scheduler};
//!
//! let scheduler = Scheduler::new(store, mutex_manager, pubsub, config.scheduler);
//! scheduler.register("send_email", handler_fn(|ctx, input| async move {
//!     ctx.report_progress(50, "").await?;
//!     Ok(format!("sent {}", input))
//! }))?;
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn({
//!     let scheduler = scheduler.clone();
//!     let shutdown = shutdown.clone();
//!     async move { scheduler.run(shutdown).await }
//! });
//!
//! scheduler
//!     .run_job(Definition::new("email-42", "send_email", Duration::from_secs(30)))
//!     .await?;
//! ```

pub mod builtin;
pub mod executor;
pub mod job;
pub mod lock;
pub mod postgres;
pub mod pubsub;
pub mod recurrence;
pub mod scheduler;
pub mod store;
pub mod timer;

pub use builtin::{OverdueJobHandler, PurgeJobHandler};
pub use executor::{
    handler_fn, Executor, FnHandler, Handler, HandlerResult, JobContext, JobError,
    ProgressReporter,
};
pub use job::{
    Definition, Job, JobPriority, JobState, Progress, StateChange, PROGRESS_MAX, PROGRESS_MIN,
};
pub use lock::{
    DistributedMutex, InMemoryMutexManager, MutexManager, RedisMutexManager, GLOBAL_LOCK_KEY,
};
pub use postgres::PgJobStore;
pub use pubsub::{
    InMemoryPubSub, MessageHandler, PubSub, RedisPubSub, Subscription, TOPIC_CANCEL_JOB,
    TOPIC_STATE_CHANGE,
};
pub use scheduler::{Scheduler, Wakeup, RETRY_DELAY};
pub use store::{InMemoryJobStore, JobStore};
pub use timer::SchedulerTimer;

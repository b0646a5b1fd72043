#![allow(clippy::result_large_err)]
//! # Apex Scheduler
//!
//! Durable background job scheduler with cluster-wide coordination.
//!
//! ## Architecture
//!
//! - **Jobs**: persisted jobs, handler registry and the control loop
//! - **Store**: PostgreSQL persistence, with an in-memory backend for tests
//! - **Coordination**: Redis mutexes and pub/sub for multi-instance deployments
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: environment and file based configuration

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, Result, SchedulerError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AppConfig, SchedulerConfig};
    pub use crate::error::{ErrorCode, ErrorContext, Result, SchedulerError};
    pub use crate::jobs::{
        handler_fn, Definition, Handler, HandlerResult, InMemoryJobStore, InMemoryMutexManager,
        InMemoryPubSub, Job, JobContext, JobError, JobPriority, JobState, JobStore, MutexManager,
        PgJobStore, Progress, PubSub, RedisMutexManager, RedisPubSub, Scheduler, StateChange,
    };
}

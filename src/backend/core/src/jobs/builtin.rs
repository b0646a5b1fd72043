//! Built-in maintenance jobs.
//!
//! Both are registered as recurring jobs when the scheduler starts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::executor::{Handler, HandlerResult, JobContext};
use super::job::JobState;
use super::lock::{global_lock, release, MutexManager};
use super::pubsub::{publish_state_change, PubSub};
use super::scheduler::{post_exec, Wakeup};
use super::store::JobStore;
use crate::error::{ErrorContext, Result};

pub const JOB_UID_OVERDUE: &str = "apex:jobs:overdue";
pub const JOB_TYPE_OVERDUE: &str = "apex:jobs:overdue";

pub const JOB_UID_PURGE: &str = "apex:jobs:purge";
pub const JOB_TYPE_PURGE: &str = "apex:jobs:purge";

/// Failure text recorded on reclaimed jobs.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Job: Reclaim running jobs whose run deadline has passed.
///
/// Covers instances that died mid-run. Each overdue job goes through the normal
/// post-execution rules as a failure, so it is retried or re-armed like any
/// other failed run.
pub struct OverdueJobHandler {
    store: Arc<dyn JobStore>,
    mutex_manager: Arc<dyn MutexManager>,
    pubsub: Arc<dyn PubSub>,
    wakeup: Wakeup,
}

impl OverdueJobHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        mutex_manager: Arc<dyn MutexManager>,
        pubsub: Arc<dyn PubSub>,
        wakeup: Wakeup,
    ) -> Self {
        Self {
            store,
            mutex_manager,
            pubsub,
            wakeup,
        }
    }

    /// Reclaim jobs overdue at `now`. Returns how many were reclaimed.
    pub async fn reclaim(&self, now: DateTime<Utc>) -> Result<usize> {
        let mutex = global_lock(self.mutex_manager.as_ref()).await?;
        let result = self.reclaim_locked(now).await;
        release(mutex).await;
        result
    }

    async fn reclaim_locked(&self, now: DateTime<Utc>) -> Result<usize> {
        let overdue = self.store.list_deadline_exceeded(now).await?;

        let mut reclaimed = 0;
        let mut earliest: Option<DateTime<Utc>> = None;

        for mut job in overdue {
            let run_by = job.run_by.clone();
            post_exec(&mut job, Err(DEADLINE_EXCEEDED.to_string()), now);

            if let Err(e) = self.store.update_execution(&job).await {
                warn!(job.uid = %job.uid, error = %e, "Failed to update overdue job");
                continue;
            }

            warn!(
                job.uid = %job.uid,
                job.job_type = %job.job_type,
                run_by = %run_by,
                state = %job.state,
                "Reclaimed overdue job"
            );
            publish_state_change(self.pubsub.as_ref(), &job).await;

            if job.state == JobState::Scheduled {
                earliest = Some(earliest.map_or(job.scheduled, |t| t.min(job.scheduled)));
            }
            reclaimed += 1;
        }

        if let Some(time) = earliest {
            self.wakeup.at(time);
        }

        Ok(reclaimed)
    }
}

#[async_trait]
impl Handler for OverdueJobHandler {
    async fn handle(&self, _ctx: &JobContext, _input: String) -> HandlerResult {
        let reclaimed = self.reclaim(Utc::now()).await?;
        if reclaimed == 0 {
            return Ok(String::new());
        }
        Ok(format!("reclaimed {} overdue jobs", reclaimed))
    }
}

/// Job: Delete finished jobs older than the retention window.
///
/// Recurring jobs and jobs still scheduled or running are never deleted.
pub struct PurgeJobHandler {
    store: Arc<dyn JobStore>,
    mutex_manager: Arc<dyn MutexManager>,
    retention: Duration,
}

impl PurgeJobHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        mutex_manager: Arc<dyn MutexManager>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            mutex_manager,
            retention,
        }
    }

    /// Delete jobs last updated before `now - retention`. Returns how many were deleted.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention =
            chrono::Duration::from_std(self.retention).context("Invalid retention time")?;
        let older_than = now - retention;

        let mutex = global_lock(self.mutex_manager.as_ref()).await?;
        let result = self.store.delete_old(older_than).await;
        release(mutex).await;

        let deleted = result?;
        if deleted > 0 {
            info!(deleted, %older_than, "Purged old jobs");
        } else {
            debug!(%older_than, "No old jobs to purge");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Handler for PurgeJobHandler {
    async fn handle(&self, _ctx: &JobContext, _input: String) -> HandlerResult {
        let deleted = self.purge(Utc::now()).await?;
        Ok(format!("deleted {} jobs", deleted))
    }
}

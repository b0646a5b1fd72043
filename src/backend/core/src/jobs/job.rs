//! Job records and the definitions they are created from.
//!
//! - **Job**: the persisted unit of schedulable work
//! - **JobState**: lifecycle state of a job row
//! - **Definition**: caller-supplied request to run a job once
//! - **Progress** / **StateChange**: read-only projections of a job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Lowest valid progress value.
pub const PROGRESS_MIN: i32 = 0;

/// Highest valid progress value.
pub const PROGRESS_MAX: i32 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// State of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its scheduled time
    #[default]
    Scheduled,
    /// Claimed by an instance and executing
    Running,
    /// Handler returned successfully
    Finished,
    /// Handler failed and no retry is left
    Failed,
    /// Canceled by request
    Canceled,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(SchedulerError::internal(format!("unknown job state: {}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority hint used to order ready jobs. It never preempts running jobs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Jobs submitted through `run_job`/`run_jobs`
    #[default]
    Normal = 0,
    /// Recurring system jobs
    Elevated = 1,
}

impl JobPriority {
    /// Numeric value stored in the database.
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    /// Convert from the stored numeric value. Unknown values map to `Normal`.
    pub fn from_i16(value: i16) -> Self {
        if value >= Self::Elevated as i16 {
            Self::Elevated
        } else {
            Self::Normal
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted job row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier
    pub uid: String,
    /// Optional group, used for bulk submission and cleanup
    pub group_id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Handler type
    pub job_type: String,
    pub priority: JobPriority,
    /// Opaque handler input
    pub data: String,
    /// Opaque handler output of the last successful run
    pub result: String,
    pub max_duration_seconds: i32,
    pub max_retries: i32,
    pub state: JobState,
    /// Next (or last) fire time
    pub scheduled: DateTime<Utc>,
    pub total_executions: i32,
    /// Instance running the job, empty unless `state` is `Running`
    pub run_by: String,
    pub run_deadline: Option<DateTime<Utc>>,
    pub run_progress: i32,
    pub last_executed: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub recurring_cron: String,
    pub consecutive_failures: i32,
    pub last_failure_error: String,
}

impl Job {
    /// Fields callers control through a definition. Two jobs with equal definitions
    /// are interchangeable for upsert purposes.
    pub fn same_definition(&self, other: &Job) -> bool {
        self.job_type == other.job_type
            && self.priority == other.priority
            && self.data == other.data
            && self.max_duration_seconds == other.max_duration_seconds
            && self.max_retries == other.max_retries
            && self.is_recurring == other.is_recurring
            && self.recurring_cron == other.recurring_cron
    }

    /// Progress projection of this job.
    pub fn progress(&self) -> Progress {
        Progress {
            state: self.state,
            progress: self.run_progress,
            result: self.result.clone(),
            failure: self.last_failure_error.clone(),
        }
    }

    /// State-change event for this job.
    pub fn state_change(&self) -> StateChange {
        StateChange {
            uid: self.uid.clone(),
            job_type: self.job_type.clone(),
            group_id: self.group_id.clone(),
            state: self.state,
            progress: self.run_progress,
            result: self.result.clone(),
            failure: self.last_failure_error.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// Request to run a job once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Unique job identifier
    pub uid: String,
    /// Registered handler type
    pub job_type: String,
    /// How many times a failed run is retried
    pub max_retries: i32,
    /// Run time limit, at least one second
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Handler input
    pub data: String,
}

impl Definition {
    /// Create a definition with no retries and the given timeout.
    pub fn new(uid: impl Into<String>, job_type: impl Into<String>, timeout: Duration) -> Self {
        Self {
            uid: uid.into(),
            job_type: job_type.into(),
            max_retries: 0,
            timeout,
            data: String::new(),
        }
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the handler input.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    /// Validate the definition.
    pub fn validate(&self) -> Result<()> {
        if self.job_type.is_empty() {
            return Err(SchedulerError::validation("job type must not be empty"));
        }

        if self.uid.is_empty() {
            return Err(SchedulerError::validation("job must have unique identifier"));
        }

        if self.max_retries < 0 {
            return Err(SchedulerError::validation(
                "job max retries must be a positive number or zero",
            ));
        }

        if self.timeout < Duration::from_secs(1) {
            return Err(SchedulerError::validation(
                "job timeout must be at least one second",
            ));
        }

        Ok(())
    }

    /// Build the new job row this definition describes, due at `now`.
    pub(crate) fn to_new_job(&self, now: DateTime<Utc>) -> Job {
        Job {
            uid: self.uid.clone(),
            group_id: String::new(),
            created: now,
            updated: now,
            job_type: self.job_type.clone(),
            priority: JobPriority::Normal,
            data: self.data.clone(),
            result: String::new(),
            max_duration_seconds: i32::try_from(self.timeout.as_secs()).unwrap_or(i32::MAX),
            max_retries: self.max_retries,
            state: JobState::Scheduled,
            scheduled: now,
            total_executions: 0,
            run_by: String::new(),
            run_deadline: None,
            run_progress: PROGRESS_MIN,
            last_executed: None,
            is_recurring: false,
            recurring_cron: String::new(),
            consecutive_failures: 0,
            last_failure_error: String::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Projections
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only view of a job's execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub state: JobState,
    pub progress: i32,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub result: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub failure: String,
}

/// Event published whenever a job changes state or reports progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub uid: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub group_id: String,
    pub state: JobState,
    pub progress: i32,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub result: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub failure: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

//! Error handling for the Apex job scheduler.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - User-facing vs internal messages, with error chaining
//! - Severity classification driving log levels
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use apex_scheduler::error::{SchedulerError, Result, ErrorContext};
//!
//! fn load(uid: &str) -> Result<()> {
//!     parse_payload(uid).context("Failed to decode job payload")?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation Errors (1000-1099)
    ValidationError,
    InvalidCronExpression,
    InvalidProgress,

    // Registration Errors (1100-1199)
    HandlerAlreadyRegistered,
    RegistrationClosed,
    InvalidHandler,

    // Execution Errors (1200-1299)
    HandlerNotFound,
    JobPanicked,
    InvalidStateTransition,
    AlreadyStarted,

    // Storage Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    RecordNotFound,
    DuplicateRecord,

    // Coordination Errors (2100-2199)
    LockAcquisitionFailed,
    LockReleaseFailed,
    PubSubError,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ValidationError => 1000,
            Self::InvalidCronExpression => 1001,
            Self::InvalidProgress => 1002,

            Self::HandlerAlreadyRegistered => 1100,
            Self::RegistrationClosed => 1101,
            Self::InvalidHandler => 1102,

            Self::HandlerNotFound => 1200,
            Self::JobPanicked => 1202,
            Self::InvalidStateTransition => 1203,
            Self::AlreadyStarted => 1204,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::RecordNotFound => 2002,
            Self::DuplicateRecord => 2003,

            Self::LockAcquisitionFailed => 2100,
            Self::LockReleaseFailed => 2101,
            Self::PubSubError => 2102,

            Self::SerializationError => 2200,

            Self::InternalError => 9000,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ValidationError | Self::InvalidCronExpression | Self::InvalidProgress => {
                "validation"
            }
            Self::HandlerAlreadyRegistered | Self::RegistrationClosed | Self::InvalidHandler => {
                "registration"
            }
            Self::HandlerNotFound
            | Self::JobPanicked
            | Self::InvalidStateTransition
            | Self::AlreadyStarted => "execution",
            Self::DatabaseError
            | Self::DatabaseConnectionFailed
            | Self::RecordNotFound
            | Self::DuplicateRecord => "storage",
            Self::LockAcquisitionFailed | Self::LockReleaseFailed | Self::PubSubError => {
                "coordination"
            }
            Self::SerializationError => "serialization",
            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Error severity levels for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Expected errors, caller mistakes (validation, not found)
    Low,
    /// Recoverable job-level failures
    Medium,
    /// Infrastructure failures that degrade the scheduler
    High,
    /// Failures that need immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Determine severity from error code.
    pub fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidCronExpression
            | ErrorCode::InvalidProgress
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::HandlerNotFound
            | ErrorCode::JobPanicked => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::LockAcquisitionFailed
            | ErrorCode::LockReleaseFailed
            | ErrorCode::PubSubError
            | ErrorCode::SerializationError
            | ErrorCode::HandlerAlreadyRegistered
            | ErrorCode::RegistrationClosed
            | ErrorCode::InvalidHandler
            | ErrorCode::AlreadyStarted => Self::High,

            ErrorCode::DatabaseConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the scheduler.
#[derive(Error, Debug)]
pub struct SchedulerError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to show to callers
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl SchedulerError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: &str, entity_id: &str) -> Self {
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// True if this is a "record not found" error.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::RecordNotFound
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "apex_scheduler_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| SchedulerError::internal(message.into()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| SchedulerError::new(ErrorCode::RecordNotFound, message.into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for SchedulerError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => {
                (ErrorCode::RecordNotFound, "The requested job was not found")
            }
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A job with this UID already exists",
                        db_err.to_string(),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseError, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for SchedulerError {
    fn from(error: redis::RedisError) -> Self {
        let user_msg = if error.is_connection_refusal() || error.is_connection_dropped() {
            "Unable to connect to Redis"
        } else if error.is_timeout() {
            "Redis operation timed out"
        } else {
            "A Redis error occurred"
        };

        Self::with_internal(ErrorCode::PubSubError, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<cron::error::Error> for SchedulerError {
    fn from(error: cron::error::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidCronExpression,
            "Invalid cron expression",
            error.to_string(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl SchedulerError {
    /// A job with the same UID already exists.
    pub fn duplicate_job(uid: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateRecord,
            format!("Job already exists: {}", uid),
        )
    }

    /// The job was not found.
    pub fn job_not_found(uid: &str) -> Self {
        Self::not_found("Job", uid)
    }

    /// No handler is registered for the job type.
    pub fn handler_not_found(job_type: &str) -> Self {
        Self::new(
            ErrorCode::HandlerNotFound,
            format!("no handler for type: {}", job_type),
        )
    }

    /// Failed to obtain a cluster-wide lock.
    pub fn lock_failed(key: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::LockAcquisitionFailed,
            format!("Failed to obtain lock: {}", key),
            reason,
        )
    }

    /// Cron expression could not be parsed.
    pub fn invalid_cron(expression: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidCronExpression,
            format!("Invalid cron expression: {}", expression),
            reason,
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = SchedulerError::job_not_found("job-1");
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
        assert!(error.is_not_found());
        assert!(error.user_message().contains("job-1"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ValidationError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::JobPanicked),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::LockAcquisitionFailed),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = SchedulerError::with_internal(
            ErrorCode::DatabaseError,
            "Database connection failed",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Database connection failed"));
        assert!(display.contains("Connection refused"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("no such job").unwrap_err();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_cron_error_conversion() {
        let parse_err = "not a cron".parse::<cron::Schedule>().unwrap_err();
        let error = SchedulerError::from(parse_err);
        assert_eq!(error.code(), ErrorCode::InvalidCronExpression);
        assert_eq!(error.code().category(), "validation");
    }
}

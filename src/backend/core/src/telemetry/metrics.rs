//! Scheduler metrics.
//!
//! Thin wrappers over the `metrics` facade so metric names live in one place.
//! Nothing is recorded unless a recorder (e.g. the Prometheus exporter) is installed.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

pub const JOBS_STARTED_TOTAL: &str = "apex_scheduler_jobs_started_total";
pub const JOBS_COMPLETED_TOTAL: &str = "apex_scheduler_jobs_completed_total";
pub const JOB_DURATION_SECONDS: &str = "apex_scheduler_job_duration_seconds";
pub const JOBS_RUNNING: &str = "apex_scheduler_jobs_running";
pub const LOOP_PASSES_TOTAL: &str = "apex_scheduler_loop_passes_total";
pub const LOCK_FAILURES_TOTAL: &str = "apex_scheduler_lock_failures_total";

/// Install the Prometheus exporter with an HTTP scrape endpoint.
pub fn init_metrics(listen_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

/// A job was claimed and launched on this instance.
pub fn job_started(job_type: &str) {
    counter!(JOBS_STARTED_TOTAL, "type" => job_type.to_string()).increment(1);
    gauge!(JOBS_RUNNING).increment(1.0);
}

/// A job run ended; `outcome` is the state persisted after the run.
pub fn job_completed(job_type: &str, outcome: &str, elapsed: Duration) {
    counter!(
        JOBS_COMPLETED_TOTAL,
        "type" => job_type.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    histogram!(JOB_DURATION_SECONDS, "type" => job_type.to_string()).record(elapsed.as_secs_f64());
    gauge!(JOBS_RUNNING).decrement(1.0);
}

/// One pass of the control loop finished.
pub fn loop_pass(failed: bool) {
    counter!(
        LOOP_PASSES_TOTAL,
        "result" => if failed { "error" } else { "ok" },
    )
    .increment(1);
}

/// The cluster-wide lock could not be obtained.
pub fn lock_failure(operation: &'static str) {
    counter!(LOCK_FAILURES_TOTAL, "operation" => operation).increment(1);
}

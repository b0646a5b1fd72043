//! Cluster-wide named mutexes.
//!
//! All schedule-mutating work runs under the mutex named [`GLOBAL_LOCK_KEY`].
//! Two implementations are provided:
//!
//! - [`InMemoryMutexManager`]: per-key async mutexes, for a single process
//! - [`RedisMutexManager`]: `SET NX PX` with a random token and compare-and-delete unlock

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, Result, SchedulerError};
use crate::telemetry::metrics;

/// Name of the mutex serializing all schedule-mutating operations.
pub const GLOBAL_LOCK_KEY: &str = "jobs";

/// Grants named mutexes.
#[async_trait]
pub trait MutexManager: Send + Sync {
    /// Block until the mutex named `key` is held or the acquisition timeout elapses.
    async fn lock(&self, key: &str) -> Result<Box<dyn DistributedMutex>>;
}

/// A held mutex.
#[async_trait]
pub trait DistributedMutex: Send {
    /// Release the mutex. Releasing twice is a no-op.
    async fn unlock(&mut self) -> Result<()>;
}

/// Obtain the global scheduling lock.
pub async fn global_lock(manager: &dyn MutexManager) -> Result<Box<dyn DistributedMutex>> {
    match manager.lock(GLOBAL_LOCK_KEY).await {
        Ok(mutex) => Ok(mutex),
        Err(e) => {
            metrics::lock_failure("lock");
            Err(e)
        }
    }
}

/// Release a mutex, logging instead of failing.
pub async fn release(mut mutex: Box<dyn DistributedMutex>) {
    if let Err(e) = mutex.unlock().await {
        metrics::lock_failure("unlock");
        warn!(error = %e, "Failed to release lock");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local mutex manager.
pub struct InMemoryMutexManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    acquire_timeout: Duration,
}

impl InMemoryMutexManager {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }
}

impl Default for InMemoryMutexManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl MutexManager for InMemoryMutexManager {
    async fn lock(&self, key: &str) -> Result<Box<dyn DistributedMutex>> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let guard = tokio::time::timeout(self.acquire_timeout, mutex.lock_owned())
            .await
            .map_err(|_| SchedulerError::lock_failed(key, "acquisition timed out"))?;

        Ok(Box::new(InMemoryMutex { guard: Some(guard) }))
    }
}

struct InMemoryMutex {
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl DistributedMutex for InMemoryMutex {
    async fn unlock(&mut self) -> Result<()> {
        self.guard.take();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════════════════════════

const REDIS_LOCK_PREFIX: &str = "apex:lock:";
const REDIS_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed mutex manager.
pub struct RedisMutexManager {
    client: redis::Client,
    expiry: Duration,
    acquire_timeout: Duration,
}

impl RedisMutexManager {
    /// Create a new manager.
    ///
    /// # Arguments
    /// * `client` - Redis client
    /// * `expiry` - How long a held lock survives without being released
    /// * `acquire_timeout` - How long `lock` keeps retrying
    pub fn new(client: redis::Client, expiry: Duration, acquire_timeout: Duration) -> Self {
        Self {
            client,
            expiry,
            acquire_timeout,
        }
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                SchedulerError::with_internal(
                    ErrorCode::LockAcquisitionFailed,
                    "Failed to get Redis connection for lock",
                    e.to_string(),
                )
            })
    }
}

#[async_trait]
impl MutexManager for RedisMutexManager {
    async fn lock(&self, key: &str) -> Result<Box<dyn DistributedMutex>> {
        let redis_key = format!("{}{}", REDIS_LOCK_PREFIX, key);
        let token = Uuid::new_v4().to_string();
        let expiry_ms = u64::try_from(self.expiry.as_millis()).unwrap_or(u64::MAX);
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;

        let mut conn = self.get_conn().await?;
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(expiry_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| SchedulerError::lock_failed(key, e.to_string()))?;

            if acquired.is_some() {
                trace!(key = %redis_key, "Lock acquired");
                return Ok(Box::new(RedisMutex {
                    conn,
                    key: redis_key,
                    token,
                    held: true,
                }));
            }

            if tokio::time::Instant::now() + REDIS_RETRY_INTERVAL > deadline {
                return Err(SchedulerError::lock_failed(key, "acquisition timed out"));
            }
            tokio::time::sleep(REDIS_RETRY_INTERVAL).await;
        }
    }
}

struct RedisMutex {
    conn: redis::aio::MultiplexedConnection,
    key: String,
    token: String,
    held: bool,
}

#[async_trait]
impl DistributedMutex for RedisMutex {
    async fn unlock(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await
            .map_err(|e| {
                SchedulerError::with_internal(
                    ErrorCode::LockReleaseFailed,
                    "Failed to release lock",
                    e.to_string(),
                )
            })?;

        if deleted == 0 {
            // Expired and possibly taken by another instance.
            return Err(SchedulerError::new(
                ErrorCode::LockReleaseFailed,
                format!("Lock was no longer held: {}", self.key),
            ));
        }

        trace!(key = %self.key, "Lock released");
        Ok(())
    }
}

//! Publish/subscribe of small byte messages.
//!
//! Used to broadcast cancellation requests to whichever instance runs a job, and to
//! announce job state changes.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::job::Job;
use crate::error::Result;

/// Topic carrying the raw UID of a job to cancel.
pub const TOPIC_CANCEL_JOB: &str = "apex:jobs:cancel_job";

/// Topic carrying JSON [`StateChange`](super::job::StateChange) events.
pub const TOPIC_STATE_CHANGE: &str = "apex:jobs:state_change";

/// Callback invoked for every message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Message bus.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Deliver every message published to `topic` from now on to `handler`.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Subscription>;
}

/// An active subscription. Dropping it without [`close`](Self::close) leaves the
/// listener running until the bus goes away.
pub struct Subscription {
    topic: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    fn new(topic: &str, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            topic: topic.to_string(),
            cancel,
            task,
        }
    }

    /// Stop listening and wait for the listener to exit.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(topic = %self.topic, error = %e, "Subscription listener ended abnormally");
        }
        debug!(topic = %self.topic, "Unsubscribed");
    }
}

/// Publish the current state of `job` on [`TOPIC_STATE_CHANGE`], logging failures.
pub async fn publish_state_change(pubsub: &dyn PubSub, job: &Job) {
    if let Err(e) = send_state_change(pubsub, job).await {
        e.log();
        warn!(job.uid = %job.uid, error = %e, "Failed to publish state change");
    }
}

async fn send_state_change(pubsub: &dyn PubSub, job: &Job) -> Result<()> {
    let payload = serde_json::to_vec(&job.state_change())?;
    pubsub.publish(TOPIC_STATE_CHANGE, payload).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════════

const CHANNEL_CAPACITY: usize = 256;

/// Process-local bus built on broadcast channels.
#[derive(Clone, Default)]
pub struct InMemoryPubSub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Subscription> {
        let mut rx = self.sender(topic).subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(payload) => handler(payload),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %name, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Subscription::new(topic, cancel, task))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis PUBLISH/SUBSCRIBE bus.
pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!(topic = %topic, receivers, "Message published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(topic).await?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = topic.to_string();

        let task = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => match msg.get_payload::<Vec<u8>>() {
                            Ok(payload) => handler(payload),
                            Err(e) => warn!(topic = %name, error = %e, "Invalid message payload"),
                        },
                        None => {
                            warn!(topic = %name, "Redis subscription stream ended");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Subscription::new(topic, cancel, task))
    }
}

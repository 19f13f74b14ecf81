//! Scene queue contract shared by every backend.
//!
//! A received message is leased: hidden from other consumers until its
//! visibility timeout runs out, at which point the backend hands it out again.
//! Consumers therefore see at-least-once delivery and must write idempotently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use conflux_common::{ConfluxResult, SceneId};

/// Default lease: 18 minutes.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 18 * 60;

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Queue behaviour shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lease length for a received message.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Deliveries allowed before a failed message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

fn default_visibility_timeout_secs() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT_SECS
}

fn default_max_deliveries() -> u32 {
    DEFAULT_MAX_DELIVERIES
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Whether a failed delivery should go to the dead-letter destination
    /// rather than back onto the queue.
    pub fn should_dead_letter(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_deliveries
    }
}

/// Name of the dead-letter destination for a queue.
pub fn dead_letter_name(queue: &str) -> String {
    format!("{}_deadletter", queue)
}

/// A leased scene identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneMessage {
    pub scene_id: SceneId,
    /// Backend handle for this particular delivery.
    pub receipt: String,
    /// Deliveries so far, including this one.
    pub delivery_count: u32,
}

/// What `fail` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to the queue for another attempt.
    Requeued,
    /// Moved to the dead-letter destination and removed from the queue.
    DeadLettered,
}

/// Message queue client.
///
/// The client holds no retry state: delivery counts live in the backend and
/// are surfaced on each [`SceneMessage`].
#[async_trait]
pub trait SceneQueue: Send + Sync {
    /// Queue name, for logging.
    fn name(&self) -> &str;

    fn config(&self) -> &QueueConfig;

    /// Lease up to `max_messages` messages. May block briefly waiting for work
    /// and return an empty list.
    async fn receive(&self, max_messages: usize) -> ConfluxResult<Vec<SceneMessage>>;

    /// Renew the lease on a message so it runs out `duration` from now.
    /// Backends with a fixed reclaim threshold (Redis) cap `duration` at one
    /// visibility timeout.
    async fn extend(&self, message: &SceneMessage, duration: Duration) -> ConfluxResult<()>;

    /// Permanently remove a message.
    async fn ack(&self, message: &SceneMessage) -> ConfluxResult<()>;

    /// Give up on this delivery: requeue it, or dead-letter it once the
    /// delivery budget is spent.
    async fn fail(&self, message: &SceneMessage, reason: &str) -> ConfluxResult<FailOutcome>;

    /// Enqueue a scene identifier.
    async fn push(&self, scene_id: &str) -> ConfluxResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_threshold() {
        let config = QueueConfig {
            visibility_timeout_secs: 60,
            max_deliveries: 3,
        };
        assert!(!config.should_dead_letter(1));
        assert!(!config.should_dead_letter(2));
        assert!(config.should_dead_letter(3));
        assert!(config.should_dead_letter(4));
    }

    #[test]
    fn test_config_defaults_from_empty_yaml_map() {
        let config: QueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.visibility_timeout_secs, 18 * 60);
        assert_eq!(config.max_deliveries, 5);
        assert_eq!(dead_letter_name("waterbodies_scenes"), "waterbodies_scenes_deadletter");
    }
}

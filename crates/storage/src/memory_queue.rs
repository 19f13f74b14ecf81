//! In-process scene queue with the same lease semantics as the Redis backend.
//!
//! Leases are timed with `tokio::time::Instant`, so tests can drive expiry
//! with a paused clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use conflux_common::{ConfluxError, ConfluxResult, SceneId};

use crate::queue::{FailOutcome, QueueConfig, SceneMessage, SceneQueue};

/// A message that ran out of deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub scene_id: SceneId,
    pub delivery_count: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    scene_id: SceneId,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    leased: HashMap<String, (Entry, Instant)>,
    dead: Vec<DeadLetter>,
    next_receipt: u64,
}

impl State {
    /// Return every lease that has run out to the back of the queue.
    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((entry, _)) = self.leased.remove(&receipt) {
                debug!(scene_id = %entry.scene_id, "Lease expired, message visible again");
                self.ready.push_back(entry);
            }
        }
    }
}

/// Scene queue held in memory.
pub struct MemoryQueue {
    name: String,
    config: QueueConfig,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Queue pre-loaded with scene ids.
    pub async fn with_scenes<I, S>(name: impl Into<String>, config: QueueConfig, scenes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SceneId>,
    {
        let queue = Self::new(name, config);
        {
            let mut state = queue.state.lock().await;
            for scene in scenes {
                state.ready.push_back(Entry {
                    scene_id: scene.into(),
                    deliveries: 0,
                });
            }
        }
        queue
    }

    /// Messages waiting to be received, including expired leases.
    pub async fn visible_len(&self) -> usize {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        state.ready.len()
    }

    /// Messages currently leased.
    pub async fn in_flight_len(&self) -> usize {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        state.leased.len()
    }

    /// Nothing visible and nothing leased.
    pub async fn is_drained(&self) -> bool {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        state.ready.is_empty() && state.leased.is_empty()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

#[async_trait]
impl SceneQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn receive(&self, max_messages: usize) -> ConfluxResult<Vec<SceneMessage>> {
        let now = Instant::now();
        let deadline = now + self.config.visibility_timeout();
        let mut state = self.state.lock().await;
        state.expire_leases(now);

        let mut messages = Vec::new();
        while messages.len() < max_messages {
            let Some(mut entry) = state.ready.pop_front() else {
                break;
            };
            entry.deliveries += 1;
            state.next_receipt += 1;
            let receipt = format!("{}-{}", self.name, state.next_receipt);
            messages.push(SceneMessage {
                scene_id: entry.scene_id.clone(),
                receipt: receipt.clone(),
                delivery_count: entry.deliveries,
            });
            state.leased.insert(receipt, (entry, deadline));
        }
        Ok(messages)
    }

    async fn extend(&self, message: &SceneMessage, duration: Duration) -> ConfluxResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.expire_leases(now);
        match state.leased.get_mut(&message.receipt) {
            Some((_, deadline)) => {
                *deadline = now + duration;
                Ok(())
            }
            None => Err(ConfluxError::LeaseExpired(message.receipt.clone())),
        }
    }

    async fn ack(&self, message: &SceneMessage) -> ConfluxResult<()> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        state
            .leased
            .remove(&message.receipt)
            .map(|_| ())
            .ok_or_else(|| ConfluxError::LeaseExpired(message.receipt.clone()))
    }

    async fn fail(&self, message: &SceneMessage, reason: &str) -> ConfluxResult<FailOutcome> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        let (entry, _) = state
            .leased
            .remove(&message.receipt)
            .ok_or_else(|| ConfluxError::LeaseExpired(message.receipt.clone()))?;

        if self.config.should_dead_letter(entry.deliveries) {
            state.dead.push(DeadLetter {
                scene_id: entry.scene_id,
                delivery_count: entry.deliveries,
                reason: reason.to_string(),
                failed_at: Utc::now(),
            });
            Ok(FailOutcome::DeadLettered)
        } else {
            state.ready.push_back(entry);
            Ok(FailOutcome::Requeued)
        }
    }

    async fn push(&self, scene_id: &str) -> ConfluxResult<()> {
        self.state.lock().await.ready.push_back(Entry {
            scene_id: scene_id.to_string(),
            deliveries: 0,
        });
        Ok(())
    }
}

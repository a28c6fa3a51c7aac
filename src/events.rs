//! Event notification bus for cluster state changes.
//!
//! Alerts, proxy backends and external hooks subscribe here. Publishing
//! never blocks: subscribers that lag simply miss events, and a bounded
//! history ring is kept for the status surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Event type categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Server events
    ServerStateChanged,
    ServerFailed,
    ServerRejoined,
    ServerProvisioned,
    ServerUnprovisioned,

    // Master events
    MasterFailed,
    MasterPromoted,

    // Cluster operations
    FailoverStarted,
    FailoverCompleted,
    SwitchoverStarted,
    SwitchoverCompleted,
    BootstrapCompleted,

    // Monitoring
    CaptureStarted,
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    /// Cluster the event belongs to.
    pub cluster: String,
    /// Server the event concerns, when applicable.
    pub server_url: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        cluster: &str,
        server_url: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            cluster: cluster.to_string(),
            server_url,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast bus with bounded history.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: Arc<RwLock<VecDeque<Event>>>,
    max_history: usize,
}

impl EventBus {
    pub fn new(capacity: usize, max_history: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(max_history))),
            max_history,
        }
    }

    /// Publish an event. Never blocks, never fails: a bus with no
    /// subscribers just records history.
    pub async fn publish(&self, event: Event) {
        debug!(
            event_type = ?event.event_type,
            server = event.server_url.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );

        {
            let mut history = self.history.write().await;
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Most recent events, oldest first.
    pub async fn recent(&self, count: usize) -> Vec<Event> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, 256)
    }
}

//! Publishing scripting error events
//!
//! Reported errors go to live sessions through a `Broadcaster` and are kept
//! in a bounded `RuntimeEventLog` for later inspection.

use crate::script::error::ScriptingErrorEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// A broadcast addressed to one session, or to all when `session_id` is none
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub event: ScriptingErrorEvent,
}

/// Publishes structured messages to live sessions
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: BroadcastMessage);
}

/// Broadcaster backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, message: BroadcastMessage) {
        // no subscribers is not an error
        if self.sender.send(message).is_err() {
            tracing::debug!("📭 No live sessions to notify");
        }
    }
}

/// Broadcaster that keeps every message, for tests and batch callers
#[derive(Debug, Default)]
pub struct CollectingBroadcaster {
    messages: Mutex<Vec<BroadcastMessage>>,
}

impl CollectingBroadcaster {
    pub fn messages(&self) -> Vec<BroadcastMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Broadcaster for CollectingBroadcaster {
    fn broadcast(&self, message: BroadcastMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }
}

/// Entry of the runtime event log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub error_name: String,
    /// `"name":codeSource` description of the failing snippet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(flatten)]
    pub event: ScriptingErrorEvent,
}

/// Bounded in-memory log, oldest entries dropped first
#[derive(Debug)]
pub struct RuntimeEventLog {
    capacity: usize,
    entries: Mutex<VecDeque<RuntimeEvent>>,
}

impl RuntimeEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn scripting(&self, entity: Option<String>, event: ScriptingErrorEvent) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(RuntimeEvent {
            timestamp: Utc::now(),
            event_type: "Scripting".to_string(),
            error_name: "Scripting Error".to_string(),
            entity,
            event,
        });
    }

    /// Entries, oldest first
    pub fn entries(&self) -> Vec<RuntimeEvent> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

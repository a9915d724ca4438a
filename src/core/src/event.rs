//! Engine events.
//!
//! The apply path reports successes and suppressed teardown failures on an
//! optional [`EventEmitter`]; hosts subscribe to forward them elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One engine event: a key from [`events`] plus structured fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEvent {
    pub key: String,

    #[serde(default)]
    pub fields: Map<String, Value>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DiffEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Map::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Broadcasts [`DiffEvent`]s to every current subscriber.
///
/// Sending never blocks and never fails; events without subscribers are
/// dropped.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<DiffEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(&self, event: DiffEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiffEvent> {
        self.sender.subscribe()
    }
}

/// Event keys emitted by the engine.
pub mod events {
    /// Fields: digest, media_type, applied_digest, size, elapsed_ms
    pub const DIFF_APPLIED: &str = "diff.applied";

    /// Fields: root, error, and cause when an inner error was already set
    pub const MOUNT_TEARDOWN_FAILED: &str = "mount.teardown.failed";

    /// Fields: digest, error, cause
    pub const PROCESSOR_CLOSE_FAILED: &str = "processor.close.failed";
}

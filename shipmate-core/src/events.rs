//! Typed lifecycle events emitted by the skill runtime.
//!
//! A small closed set over a broadcast channel; subscribers receive a typed
//! payload rather than a loose map of strings. Lagging subscribers drop
//! events rather than applying backpressure to the runtime.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted across the skill lifecycle and dispatch path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    SkillRegistered {
        skill: String,
        priority: i32,
    },
    SkillInitialized {
        skill: String,
    },
    SkillUnregistered {
        skill: String,
    },
    SkillError {
        skill: String,
        message: String,
    },
    BeforeExecute {
        skill: String,
        chat_id: String,
    },
    AfterExecute {
        skill: String,
        chat_id: String,
        success: bool,
        duration_ms: u64,
    },
    Shutdown,
}

impl RuntimeEvent {
    /// Stable name for log lines and subscriber filtering.
    pub fn event_name(&self) -> &'static str {
        match self {
            RuntimeEvent::SkillRegistered { .. } => "skill_registered",
            RuntimeEvent::SkillInitialized { .. } => "skill_initialized",
            RuntimeEvent::SkillUnregistered { .. } => "skill_unregistered",
            RuntimeEvent::SkillError { .. } => "skill_error",
            RuntimeEvent::BeforeExecute { .. } => "before_execute",
            RuntimeEvent::AfterExecute { .. } => "after_execute",
            RuntimeEvent::Shutdown => "shutdown",
        }
    }
}

/// Broadcast bus for [`RuntimeEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Emit an event. Fine to call with no subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

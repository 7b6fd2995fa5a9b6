//! Audit trail — bounded in-memory ring of every side-effectful action.
//!
//! The orchestrator, scheduler, and skill runtime all append here. Entries
//! carry the action name, the target it acted on, the outcome, and who
//! asked for it. The ring evicts oldest; it is telemetry, not a ledger —
//! durable records live in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
}

/// A single audited action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonically increasing sequence number within this process.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// What happened, e.g. "pipeline.start", "stage.deploy", "skill.error".
    pub action: String,
    /// Repo or subject acted on.
    pub target: String,
    pub status: AuditStatus,
    /// Who initiated the action (user id, "scheduler", "webhook").
    pub from: String,
    /// Free-form extras: command line, duration, URL, error text.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// Bounded ring of audit entries. Thread-safe; cheap to clone behind an Arc.
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<AuditInner>,
}

#[derive(Debug)]
struct AuditInner {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
    next_sequence: u64,
}

impl AuditLog {
    /// Create a ring holding at most `capacity` entries (min 100).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::new(),
                capacity: capacity.max(100),
                next_sequence: 0,
            }),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        status: AuditStatus,
        from: impl Into<String>,
        extra: serde_json::Value,
    ) {
        let mut inner = self.inner.lock().expect("audit lock poisoned");
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(AuditEntry {
            sequence,
            timestamp: Utc::now(),
            action: action.into(),
            target: target.into(),
            status,
            from: from.into(),
            extra,
        });
    }

    /// The most recent `n` entries, newest last.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("audit lock poisoned");
        inner
            .entries
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// All retained entries for a target, oldest first.
    pub fn for_target(&self, target: &str) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("audit lock poisoned");
        inner
            .entries
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("audit lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of failed entries among the retained ring.
    pub fn failure_count(&self) -> usize {
        let inner = self.inner.lock().expect("audit lock poisoned");
        inner
            .entries
            .iter()
            .filter(|e| e.status == AuditStatus::Failed)
            .count()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(200)
    }
}

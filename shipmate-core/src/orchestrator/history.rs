//! Deployment history — a bounded ring of pipeline outcomes per process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One finished pipeline, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    /// `None` when the test stage never ran (rollbacks skip it).
    pub tests_passed: Option<bool>,
    pub deploy_success: bool,
    /// Deploy landed but the health probe did not come back 2xx.
    pub verify_warning: bool,
    pub is_rollback: bool,
    pub duration_ms: u64,
    pub url: Option<String>,
    pub requested_by: String,
}

/// Ring of the last N deployments.
#[derive(Debug)]
pub struct DeploymentHistory {
    records: Mutex<VecDeque<DeploymentRecord>>,
    capacity: usize,
}

impl DeploymentHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: DeploymentRecord) {
        let mut records = self.records.lock().expect("history lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, n: usize) -> Vec<DeploymentRecord> {
        let records = self.records.lock().expect("history lock poisoned");
        records.iter().rev().take(n).cloned().collect()
    }

    /// The most recent successful, non-rollback deploy of `target`.
    pub fn latest_successful_deploy(&self, target: &str) -> Option<DeploymentRecord> {
        let records = self.records.lock().expect("history lock poisoned");
        records
            .iter()
            .rev()
            .find(|r| r.target == target && r.deploy_success && !r.is_rollback)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeploymentHistory {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(target: &str, deploy_success: bool, is_rollback: bool) -> DeploymentRecord {
        DeploymentRecord {
            timestamp: Utc::now(),
            target: target.into(),
            tests_passed: Some(true),
            deploy_success,
            verify_warning: false,
            is_rollback,
            duration_ms: 1000,
            url: None,
            requested_by: "u1".into(),
        }
    }

    #[test]
    fn test_ring_capacity() {
        let history = DeploymentHistory::new(50);
        for i in 0..60 {
            history.push(record(&format!("t{i}"), true, false));
        }
        assert_eq!(history.len(), 50);
        assert_eq!(history.recent(1)[0].target, "t59");
    }

    #[test]
    fn test_latest_successful_skips_failures_and_rollbacks() {
        let history = DeploymentHistory::default();
        history.push(record("api", true, false));
        history.push(record("api", false, false));
        history.push(record("api", true, true));

        let latest = history.latest_successful_deploy("api").unwrap();
        assert!(latest.deploy_success);
        assert!(!latest.is_rollback);
    }

    #[test]
    fn test_latest_successful_none_for_unknown_target() {
        let history = DeploymentHistory::default();
        history.push(record("api", true, false));
        assert!(history.latest_successful_deploy("web").is_none());
    }
}

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::SharedState;
use crate::workload::{PodPhase, WorkloadKey};

pub const AUDIT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Status,
    Resync,
    Timeout,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Status => "status",
            Operation::Resync => "resync",
            Operation::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    None,
    Deploy,
    Replace,
    Remove,
    Update,
    Adopt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    Failed,
    Retry,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Retry => "retry",
        }
    }
}

/// One reconciliation attempt. Observational only.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRecord {
    pub timestamp: DateTime<Utc>,
    pub key: WorkloadKey,
    pub operation: Operation,
    pub desired: Option<PodPhase>,
    pub actual: Option<PodPhase>,
    pub action: Action,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ReconciliationRecord {
    pub fn new(key: WorkloadKey, operation: Operation, action: Action) -> Self {
        Self {
            timestamp: Utc::now(),
            key,
            operation,
            desired: None,
            actual: None,
            action,
            outcome: Outcome::Success,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn phases(mut self, desired: Option<PodPhase>, actual: Option<PodPhase>) -> Self {
        self.desired = desired;
        self.actual = actual;
        self
    }

    pub fn took(mut self, elapsed: Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn failed(mut self, outcome: Outcome, error: impl ToString) -> Self {
        self.outcome = outcome;
        self.error = Some(error.to_string());
        self
    }
}

/// Fixed-capacity ring buffer of the latest records.
#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    records: VecDeque<ReconciliationRecord>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: ReconciliationRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<ReconciliationRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub async fn record(state: &SharedState, record: ReconciliationRecord) {
    state.lock().await.audit.push(record);
}

pub async fn records(state: &SharedState) -> Vec<ReconciliationRecord> {
    state.lock().await.audit.records()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_the_latest_entries() {
        let mut log = AuditLog::with_capacity(3);
        for i in 0..5 {
            log.push(ReconciliationRecord::new(
                WorkloadKey::new("default", format!("w{i}")),
                Operation::Create,
                Action::Deploy,
            ));
        }
        let names: Vec<String> = log.records().into_iter().map(|r| r.key.name).collect();
        assert_eq!(names, vec!["w2", "w3", "w4"]);
    }

    #[test]
    fn default_capacity_is_one_hundred() {
        let mut log = AuditLog::default();
        for i in 0..150 {
            log.push(ReconciliationRecord::new(
                WorkloadKey::new("default", format!("w{i}")),
                Operation::Status,
                Action::None,
            ));
        }
        assert_eq!(log.len(), AUDIT_CAPACITY);
    }

    #[test]
    fn failed_records_carry_error_text() {
        let record = ReconciliationRecord::new(
            WorkloadKey::new("default", "web"),
            Operation::Create,
            Action::Deploy,
        )
        .failed(Outcome::Retry, "backend unreachable")
        .took(Duration::from_millis(12));
        assert_eq!(record.outcome, Outcome::Retry);
        assert_eq!(record.error.as_deref(), Some("backend unreachable"));
        assert_eq!(record.duration_ms, 12);
    }
}

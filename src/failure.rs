//! Failure records and the agent-wide failure queue.
//!
//! Many producers (crash detection, workload assertions, protocol errors) append
//! records; the coordinator takes them out in batches with [`FailureQueue::drain_all`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// One detected failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Logical unit the failure belongs to (test id, worker id).
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    /// Short tag such as "out of memory" or "exception".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_address: Option<String>,
}

impl FailureRecord {
    /// Create a record stamped with the current time.
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp: Utc::now(),
            message: message.into(),
            causes: Vec::new(),
            classification: None,
            worker_id: None,
            agent_address: None,
        }
    }

    pub fn with_causes(mut self, causes: Vec<String>) -> Self {
        self.causes = causes;
        self
    }

    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_agent(mut self, agent_address: Option<String>) -> Self {
        self.agent_address = agent_address;
        self
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.identifier, self.message)?;
        if let Some(class) = &self.classification {
            write!(f, " ({})", class)?;
        }
        for cause in &self.causes {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

/// Unbounded FIFO of failure records with an atomic drain.
#[derive(Debug, Default)]
pub struct FailureQueue {
    records: Mutex<VecDeque<FailureRecord>>,
}

impl FailureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Never fails; a poisoned lock is recovered.
    pub fn append(&self, record: FailureRecord) {
        tracing::debug!(
            identifier = %record.identifier,
            classification = ?record.classification,
            "Failure recorded"
        );
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(record);
    }

    /// Remove and return every queued record in append order.
    pub fn drain_all(&self) -> Vec<FailureRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *records).into()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

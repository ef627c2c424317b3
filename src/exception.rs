//! Registry for failures that escape background threads.
//!
//! Report-mode [`ThreadGroup`](crate::thread_group::ThreadGroup)s forward their
//! failures here, tagged with the identifier of the logical test they belong to.
//! The agent moves the records into its [`FailureQueue`](crate::failure::FailureQueue)
//! whenever the coordinator asks for failures.
//!
//! A sink may optionally spill every report to `<n>.exception` files in a
//! directory so failures survive a crash of the reporting process.

use crate::failure::FailureRecord;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Classification given to failures that came through the sink.
pub const EXCEPTION_CLASSIFICATION: &str = "exception";

/// One reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// 1-based report number, unique per sink.
    pub sequence: usize,
    pub identifier: String,
    pub thread_name: String,
    pub message: String,
    pub causes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExceptionRecord {
    /// Convert into a failure record for the coordinator.
    pub fn into_failure_record(self, agent_address: Option<String>) -> FailureRecord {
        FailureRecord {
            identifier: self.identifier,
            timestamp: self.timestamp,
            message: format!("{} (thread {})", self.message, self.thread_name),
            causes: self.causes,
            classification: Some(EXCEPTION_CLASSIFICATION.to_string()),
            worker_id: None,
            agent_address,
        }
    }

    fn render(&self) -> String {
        let mut text = format!(
            "identifier: {}\nthread: {}\ntime: {}\n\n{}\n",
            self.identifier,
            self.thread_name,
            self.timestamp.to_rfc3339(),
            self.message
        );
        for cause in &self.causes {
            text.push_str("caused by: ");
            text.push_str(cause);
            text.push('\n');
        }
        text
    }
}

/// Injectable exception registry.
#[derive(Debug, Default)]
pub struct ExceptionSink {
    records: Mutex<Vec<ExceptionRecord>>,
    counter: AtomicUsize,
    spill_dir: Option<PathBuf>,
}

impl ExceptionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that also writes each report to `dir/<n>.exception`.
    pub fn with_spill_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn spill_dir(&self) -> Option<&Path> {
        self.spill_dir.as_deref()
    }

    /// Record a failure raised by `thread_name` while working for `identifier`.
    pub fn report(&self, identifier: &str, thread_name: &str, error: &dyn std::error::Error) {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }

        // Numbering and insertion happen under one lock so report order is
        // sequence order.
        let record = {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let record = ExceptionRecord {
                sequence,
                identifier: identifier.to_string(),
                thread_name: thread_name.to_string(),
                message: error.to_string(),
                causes,
                timestamp: Utc::now(),
            };
            records.push(record.clone());
            record
        };

        tracing::error!(
            identifier,
            thread = thread_name,
            sequence = record.sequence,
            error = %record.message,
            "Exception reported"
        );

        if let Some(dir) = &self.spill_dir {
            let path = dir.join(format!("{}.exception", record.sequence));
            if let Err(e) = fs::write(&path, record.render()) {
                // The record is still kept in memory.
                tracing::warn!(path = %path.display(), error = %e, "Failed to write exception file");
            }
        }
    }

    /// Remove and return all reports in report order.
    pub fn drain(&self) -> Vec<ExceptionRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *records)
    }

    /// Number of reports made over the sink's lifetime.
    pub fn reported(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

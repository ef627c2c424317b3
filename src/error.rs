//! Error types for stampede.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for stampede.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A connection carried something that is not one well-formed command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("Unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("Worker {worker_id} did not become ready within {timeout_ms}ms")]
    SpawnTimeout { worker_id: String, timeout_ms: u64 },

    #[error("Async operation failed: {0}")]
    AsyncOperation(String),

    /// The sink refused an operation before it was submitted.
    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("Thread '{thread}' failed: {message}")]
    ThreadGroup { thread: String, message: String },

    #[error("Worker error: {0}")]
    Worker(String),

    /// A failure payload returned by a remote agent.
    #[error("Agent reported {kind}: {message}")]
    Remote {
        kind: ErrorKind,
        message: String,
        causes: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for stampede operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Wire-level classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    CommandExecution,
    UnknownWorker,
    SpawnTimeout,
    AsyncOperation,
    ThreadGroup,
    Worker,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Protocol => "ProtocolError",
            Self::CommandExecution => "CommandExecutionError",
            Self::UnknownWorker => "UnknownWorker",
            Self::SpawnTimeout => "SpawnTimeout",
            Self::AsyncOperation => "AsyncOperationFailure",
            Self::ThreadGroup => "ThreadGroupFailure",
            Self::Worker => "WorkerError",
            Self::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl HarnessError {
    /// Classify this error for transport to a coordinator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::CommandExecution(_) => ErrorKind::CommandExecution,
            Self::UnknownWorker(_) => ErrorKind::UnknownWorker,
            Self::SpawnTimeout { .. } => ErrorKind::SpawnTimeout,
            Self::AsyncOperation(_) | Self::Rejected(_) => ErrorKind::AsyncOperation,
            Self::ThreadGroup { .. } => ErrorKind::ThreadGroup,
            Self::Worker(_) => ErrorKind::Worker,
            Self::Remote { kind, .. } => *kind,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Messages of every source below this error, outermost first.
    pub fn causes(&self) -> Vec<String> {
        if let Self::Remote { causes, .. } = self {
            return causes.clone();
        }
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }
        causes
    }
}

/// Serializable failure payload: error kind, message and cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl From<&HarnessError> for CommandFailure {
    fn from(err: &HarnessError) -> Self {
        let message = match err {
            HarnessError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
            causes: err.causes(),
        }
    }
}

impl From<CommandFailure> for HarnessError {
    fn from(failure: CommandFailure) -> Self {
        HarnessError::Remote {
            kind: failure.kind,
            message: failure.message,
            causes: failure.causes,
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

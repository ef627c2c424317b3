//! Crash analysis for worker processes.

use crate::failure::FailureRecord;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal not covered below.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from the OOM killer).
    OutOfMemory,
    /// Stack overflow (SIGSEGV on Linux, SIGBUS on macOS).
    StackOverflow,
    /// Still running.
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Short tag stored on failure records.
    pub fn classification(&self) -> &'static str {
        match self {
            Self::Exited(_) => "exited",
            Self::Signaled(_) => "killed by signal",
            Self::OutOfMemory => "out of memory",
            Self::StackOverflow => "stack overflow",
            Self::StillAlive => "unresponsive",
            Self::Unknown => "unknown",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL)".to_string(),
            Self::StackOverflow => "stack overflow".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::StackOverflow,
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// A worker lost outside of an orderly shutdown.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
    pub message: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            context: None,
            message: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Build the failure record appended when `worker_id` is declared dead.
    pub fn to_record(&self, worker_id: &str, agent_address: Option<String>) -> FailureRecord {
        FailureRecord::new(worker_id, format!("Worker {} {}", worker_id, self))
            .with_classification(self.reason.classification())
            .with_worker(worker_id)
            .with_agent(agent_address)
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

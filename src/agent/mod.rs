//! The agent: a process that takes commands from a coordinator and runs them
//! against its local worker processes.

pub mod client;
pub mod message;
pub mod protocol;
pub mod service;

pub use client::AgentClient;
pub use message::{LoggingMessageProcessor, MessageProcessor};
pub use protocol::{Command, CommandPayload, CommandResult, Message, TestCase, TestSuite};
pub use service::CommandService;

use crate::error::{CommandFailure, ErrorKind, Result};
use crate::exception::ExceptionSink;
use crate::failure::{FailureQueue, FailureRecord};
use crate::worker::{ExecLauncher, ManagerConfig, WorkerProcessManager};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default command port.
pub const DEFAULT_PORT: u16 = 9000;

/// How often the parent watcher checks that the parent is still alive.
const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Agent process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind: String,
    pub port: u16,
    /// Position of this agent in the coordinator's agent list.
    pub address_index: usize,
    /// Address the coordinator knows this agent by; defaults to `bind:port`.
    pub public_address: Option<String>,
    /// Shut down when this process disappears.
    pub parent_pid: Option<i32>,
    pub pid_file: Option<PathBuf>,
    /// Directory for `<n>.exception` files.
    pub exception_dir: Option<PathBuf>,
    pub readiness_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Worker executable; defaults to the running binary.
    pub worker_program: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            address_index: 0,
            public_address: None,
            parent_pid: None,
            pid_file: None,
            exception_dir: None,
            readiness_timeout_ms: 60_000,
            shutdown_timeout_ms: 5_000,
            worker_program: None,
        }
    }
}

impl AgentConfig {
    pub fn agent_address(&self) -> String {
        self.public_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.bind, self.port))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            readiness_timeout: Duration::from_millis(self.readiness_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            agent_address: Some(self.agent_address()),
        }
    }
}

/// Command handlers and the state they share.
pub struct Agent {
    address: Option<String>,
    manager: WorkerProcessManager,
    failures: Arc<FailureQueue>,
    exceptions: Arc<ExceptionSink>,
    messages: Box<dyn MessageProcessor>,
    test_suite: Mutex<Option<TestSuite>>,
}

impl Agent {
    /// `failures` should be the queue `manager` records into.
    pub fn new(
        manager: WorkerProcessManager,
        failures: Arc<FailureQueue>,
        exceptions: Arc<ExceptionSink>,
    ) -> Self {
        Self {
            address: manager.config().agent_address.clone(),
            manager,
            failures,
            exceptions,
            messages: Box::new(LoggingMessageProcessor::new()),
            test_suite: Mutex::new(None),
        }
    }

    pub fn with_message_processor(mut self, processor: impl MessageProcessor + 'static) -> Self {
        self.messages = Box::new(processor);
        self
    }

    /// Build an agent that launches workers per `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let launcher = match &config.worker_program {
            Some(program) => ExecLauncher::new(program),
            None => ExecLauncher::current_exe()?,
        };
        let exceptions = match &config.exception_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                ExceptionSink::with_spill_dir(dir)
            }
            None => ExceptionSink::new(),
        };
        let failures = Arc::new(FailureQueue::new());
        let manager =
            WorkerProcessManager::new(launcher, config.manager_config(), Arc::clone(&failures));
        Ok(Self::new(manager, failures, Arc::new(exceptions)))
    }

    pub fn manager(&self) -> &WorkerProcessManager {
        &self.manager
    }

    pub fn failures(&self) -> &Arc<FailureQueue> {
        &self.failures
    }

    pub fn exceptions(&self) -> &Arc<ExceptionSink> {
        &self.exceptions
    }

    /// The suite set by the last `init_test_suite` command.
    pub fn test_suite(&self) -> Option<TestSuite> {
        self.test_suite
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one command. Always produces a result; errors and panics become
    /// failure payloads.
    pub fn dispatch(&self, command: Command) -> CommandResult {
        let service = command.service();
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(command))) {
            Ok(Ok(payload)) => CommandResult::Ok(payload),
            Ok(Err(err)) => {
                tracing::error!(service, error = %err, "Command failed");
                CommandResult::Err(CommandFailure::from(&err))
            }
            Err(_) => {
                tracing::error!(service, "Command handler panicked");
                CommandResult::Err(CommandFailure {
                    kind: ErrorKind::CommandExecution,
                    message: format!("Handler for {} panicked", service),
                    causes: Vec::new(),
                })
            }
        }
    }

    fn execute(&self, command: Command) -> Result<CommandPayload> {
        match command {
            Command::SpawnWorkers { settings } => {
                self.manager.spawn(&settings)?;
                Ok(CommandPayload::Unit)
            }
            Command::InitTestSuite { suite } => {
                tracing::info!(suite = %suite.id, tests = suite.tests.len(), "Test suite initialized");
                *self.test_suite.lock().unwrap_or_else(PoisonError::into_inner) = Some(suite);
                Ok(CommandPayload::Unit)
            }
            Command::ExecuteAll { command } => {
                Ok(CommandPayload::Outcomes(self.manager.execute_on_all(&command)))
            }
            Command::ExecuteOne { worker_id, command } => self
                .manager
                .execute_on_one(&worker_id, &command)
                .map(CommandPayload::Value),
            Command::TerminateAll => {
                self.manager.terminate_all();
                Ok(CommandPayload::Unit)
            }
            Command::Echo { text } => {
                tracing::info!(text = %text, "Echo");
                Ok(CommandPayload::Unit)
            }
            Command::GetFailures => Ok(CommandPayload::Failures(self.collect_failures())),
            Command::ListWorkers => Ok(CommandPayload::WorkerIds(self.manager.list())),
            Command::SubmitMessage { message } => {
                self.messages.submit(message)?;
                Ok(CommandPayload::Unit)
            }
        }
    }

    /// Move sink reports into the queue, then drain it.
    fn collect_failures(&self) -> Vec<FailureRecord> {
        for record in self.exceptions.drain() {
            self.failures
                .append(record.into_failure_record(self.address.clone()));
        }
        self.failures.drain_all()
    }
}

/// Writes the process id to a file and removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::write(&path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), "Wrote pid file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

/// Set `shutdown` once process `parent` no longer exists.
pub fn watch_parent(parent: i32, shutdown: Arc<AtomicBool>) -> Result<()> {
    std::thread::Builder::new()
        .name("parent-watch".to_string())
        .spawn(move || {
            let pid = Pid::from_raw(parent);
            while !shutdown.load(Ordering::SeqCst) {
                if let Err(Errno::ESRCH) = signal::kill(pid, None) {
                    tracing::warn!(parent, "Parent process is gone, shutting down");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(PARENT_POLL_INTERVAL);
            }
        })?;
    Ok(())
}

/// A started agent: bound, pid file written, not yet serving.
pub struct AgentProcess {
    agent: Arc<Agent>,
    service: CommandService,
    _pid_file: Option<PidFile>,
}

impl AgentProcess {
    pub fn start(config: &AgentConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let agent = Arc::new(Agent::from_config(config)?);
        let service = CommandService::bind((config.bind.as_str(), config.port), Arc::clone(&agent))?
            .with_shutdown(Arc::clone(&shutdown));

        let pid_file = config.pid_file.as_ref().map(PidFile::create).transpose()?;
        if let Some(parent) = config.parent_pid {
            watch_parent(parent, shutdown)?;
        }

        tracing::info!(
            addr = %service.local_addr()?,
            address_index = config.address_index,
            public_address = %config.agent_address(),
            "Agent started"
        );
        Ok(Self {
            agent,
            service,
            _pid_file: pid_file,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.service.local_addr()
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Serve until shutdown, then stop every worker.
    pub fn run(self) -> Result<()> {
        let served = self.service.serve();
        let stopped = self.agent.manager().terminate_all();
        tracing::info!(workers = stopped, "Agent stopped");
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::worker::{TestCommand, WorkerSettings};
    use tempfile::tempdir;

    fn test_agent() -> Agent {
        let failures = Arc::new(FailureQueue::new());
        let launcher = ExecLauncher::new("sh").with_base_args([
            "-c",
            r#"echo '{"type":"ready"}'
while read line; do
  case "$line" in *'"type":"exit"}') exit 0 ;; esac
  echo '{"type":"result","value":1}'
  echo '{"type":"ready"}'
done"#,
            "sh",
        ]);
        let manager = WorkerProcessManager::new(
            launcher,
            ManagerConfig {
                agent_address: Some("10.0.0.1:9000".into()),
                ..ManagerConfig::default()
            },
            Arc::clone(&failures),
        );
        Agent::new(manager, failures, Arc::new(ExceptionSink::new()))
    }

    #[test]
    fn test_echo_and_list() {
        let agent = test_agent();
        assert_eq!(
            agent.dispatch(Command::Echo { text: "hello".into() }),
            CommandResult::Ok(CommandPayload::Unit)
        );
        assert_eq!(
            agent.dispatch(Command::ListWorkers),
            CommandResult::Ok(CommandPayload::WorkerIds(Vec::new()))
        );
    }

    #[test]
    fn test_unknown_worker_is_failure_payload() {
        let agent = test_agent();
        match agent.dispatch(Command::ExecuteOne {
            worker_id: "member-42".into(),
            command: TestCommand::Noop,
        }) {
            CommandResult::Err(failure) => {
                assert_eq!(failure.kind, ErrorKind::UnknownWorker);
                assert!(failure.message.contains("member-42"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_spawn_execute_terminate() {
        let agent = test_agent();
        let spawn = Command::SpawnWorkers {
            settings: WorkerSettings::new(2, "member"),
        };
        assert_eq!(agent.dispatch(spawn), CommandResult::Ok(CommandPayload::Unit));

        match agent.dispatch(Command::ExecuteAll { command: TestCommand::Noop }) {
            CommandResult::Ok(CommandPayload::Outcomes(outcomes)) => {
                assert_eq!(outcomes.len(), 2);
                assert!(outcomes.iter().all(|o| o.is_success()));
            }
            other => panic!("Expected outcomes, got {:?}", other),
        }

        agent.dispatch(Command::TerminateAll);
        assert_eq!(agent.manager().worker_count(), 0);
    }

    #[test]
    fn test_get_failures_includes_sink_reports() {
        let agent = test_agent();
        agent.failures().append(FailureRecord::new("test-1", "first"));
        agent
            .exceptions()
            .report("test-1", "load-1", &HarnessError::Worker("second".into()));

        match agent.dispatch(Command::GetFailures) {
            CommandResult::Ok(CommandPayload::Failures(records)) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].message, "first");
                assert!(records[1].message.contains("second"));
                assert_eq!(records[1].agent_address.as_deref(), Some("10.0.0.1:9000"));
            }
            other => panic!("Expected failures, got {:?}", other),
        }
        assert_eq!(
            agent.dispatch(Command::GetFailures),
            CommandResult::Ok(CommandPayload::Failures(Vec::new()))
        );
    }

    #[test]
    fn test_init_test_suite_is_stored() {
        let agent = test_agent();
        let suite = TestSuite {
            id: "2026-10-19__map".into(),
            tests: vec![TestCase {
                id: "map".into(),
                ..TestCase::default()
            }],
        };
        agent.dispatch(Command::InitTestSuite { suite: suite.clone() });
        assert_eq!(agent.test_suite(), Some(suite));
    }

    #[test]
    fn test_pid_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        {
            let pid_file = PidFile::create(&path).unwrap();
            let content = fs::read_to_string(pid_file.path()).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_parent_watch_sets_shutdown() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        watch_parent(pid, Arc::clone(&shutdown)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !shutdown.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(shutdown.load(Ordering::SeqCst));
    }
}

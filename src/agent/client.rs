//! Coordinator-side client for an agent.
//!
//! Opens one connection per command, as the protocol requires.

use super::protocol::{self, Command, CommandPayload, CommandResult, Message, TestSuite};
use crate::error::{HarnessError, Result};
use crate::failure::FailureRecord;
use crate::worker::{TestCommand, WorkerOutcome, WorkerSettings};
use serde_json::Value;
use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default time to wait for a response. Spawns may take as long as the
/// agent's readiness timeout, so this is generous.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for one agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    addr: String,
    timeout: Duration,
}

impl AgentClient {
    /// Create a client for the agent at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command and wait for its result.
    ///
    /// A failure payload from the agent becomes [`HarnessError::Remote`].
    pub fn send(&self, command: &Command) -> Result<CommandPayload> {
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| HarnessError::Protocol(format!("cannot resolve {}", self.addr)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;

        tracing::debug!(agent = %self.addr, service = command.service(), "Sending command");
        protocol::write_line(&mut stream, &command.to_line()?)?;

        let mut reader = BufReader::new(stream);
        CommandResult::read_from(&mut reader)?.into_result()
    }

    pub fn echo(&self, text: impl Into<String>) -> Result<()> {
        self.send_unit(&Command::Echo { text: text.into() })
    }

    pub fn spawn_workers(&self, settings: WorkerSettings) -> Result<()> {
        self.send_unit(&Command::SpawnWorkers { settings })
    }

    pub fn init_test_suite(&self, suite: TestSuite) -> Result<()> {
        self.send_unit(&Command::InitTestSuite { suite })
    }

    pub fn list_workers(&self) -> Result<Vec<String>> {
        match self.send(&Command::ListWorkers)? {
            CommandPayload::WorkerIds(ids) => Ok(ids),
            other => Err(unexpected("list_workers", &other)),
        }
    }

    pub fn execute_all(&self, command: TestCommand) -> Result<Vec<WorkerOutcome>> {
        match self.send(&Command::ExecuteAll { command })? {
            CommandPayload::Outcomes(outcomes) => Ok(outcomes),
            other => Err(unexpected("execute_all", &other)),
        }
    }

    pub fn execute_one(&self, worker_id: impl Into<String>, command: TestCommand) -> Result<Value> {
        let command = Command::ExecuteOne {
            worker_id: worker_id.into(),
            command,
        };
        match self.send(&command)? {
            CommandPayload::Value(value) => Ok(value),
            other => Err(unexpected("execute_one", &other)),
        }
    }

    pub fn terminate_all(&self) -> Result<()> {
        self.send_unit(&Command::TerminateAll)
    }

    pub fn get_failures(&self) -> Result<Vec<FailureRecord>> {
        match self.send(&Command::GetFailures)? {
            CommandPayload::Failures(records) => Ok(records),
            other => Err(unexpected("get_failures", &other)),
        }
    }

    pub fn submit_message(&self, message: Message) -> Result<()> {
        self.send_unit(&Command::SubmitMessage { message })
    }

    fn send_unit(&self, command: &Command) -> Result<()> {
        match self.send(command)? {
            CommandPayload::Unit => Ok(()),
            other => Err(unexpected(command.service(), &other)),
        }
    }
}

fn unexpected(service: &str, payload: &CommandPayload) -> HarnessError {
    HarnessError::Protocol(format!("unexpected {} response: {:?}", service, payload))
}

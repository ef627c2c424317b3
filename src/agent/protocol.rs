//! Remoting protocol between a coordinator and an agent.
//!
//! One TCP connection carries one exchange: the coordinator writes a single
//! JSON line holding a [`Command`] tagged by `"service"`, the agent answers
//! with a single [`CommandResult`] line (`{"ok": ...}` or `{"err": ...}`) and
//! closes the connection.

use crate::error::{CommandFailure, HarnessError, Result};
use crate::failure::FailureRecord;
use crate::worker::{TestCommand, WorkerOutcome, WorkerSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};

/// Upper bound on a single protocol line.
pub const MAX_LINE_BYTES: u64 = 16 * 1024 * 1024;

/// A request to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum Command {
    SpawnWorkers { settings: WorkerSettings },
    InitTestSuite { suite: TestSuite },
    ExecuteAll { command: TestCommand },
    ExecuteOne { worker_id: String, command: TestCommand },
    TerminateAll,
    Echo { text: String },
    GetFailures,
    ListWorkers,
    SubmitMessage { message: Message },
}

impl Command {
    /// Wire name of the command kind.
    pub fn service(&self) -> &'static str {
        match self {
            Self::SpawnWorkers { .. } => "spawn_workers",
            Self::InitTestSuite { .. } => "init_test_suite",
            Self::ExecuteAll { .. } => "execute_all",
            Self::ExecuteOne { .. } => "execute_one",
            Self::TerminateAll => "terminate_all",
            Self::Echo { .. } => "echo",
            Self::GetFailures => "get_failures",
            Self::ListWorkers => "list_workers",
            Self::SubmitMessage { .. } => "submit_message",
        }
    }

    pub fn to_line(&self) -> Result<String> {
        to_line(self)
    }

    /// Read the single command of a connection.
    pub fn read_from(reader: &mut impl BufRead) -> Result<Self> {
        let line = read_line(reader)?
            .ok_or_else(|| HarnessError::Protocol("connection closed before a command".into()))?;
        serde_json::from_str(&line)
            .map_err(|e| HarnessError::Protocol(format!("malformed command: {}", e)))
    }
}

/// The tests an agent is about to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A message routed to the agent's message processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Target address, such as a worker id or a test id.
    #[serde(default)]
    pub address: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// The answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Ok(CommandPayload),
    Err(CommandFailure),
}

impl CommandResult {
    pub fn to_line(&self) -> Result<String> {
        to_line(self)
    }

    pub fn read_from(reader: &mut impl BufRead) -> Result<Self> {
        let line = read_line(reader)?
            .ok_or_else(|| HarnessError::Protocol("agent closed the connection without a response".into()))?;
        serde_json::from_str(&line)
            .map_err(|e| HarnessError::Protocol(format!("malformed response: {}", e)))
    }

    pub fn into_result(self) -> Result<CommandPayload> {
        match self {
            Self::Ok(payload) => Ok(payload),
            Self::Err(failure) => Err(failure.into()),
        }
    }
}

/// Success payloads, one shape per command family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CommandPayload {
    Unit,
    WorkerIds(Vec<String>),
    Failures(Vec<FailureRecord>),
    Outcomes(Vec<WorkerOutcome>),
    Value(Value),
}

fn to_line<T: Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    Ok(json)
}

fn read_line(reader: &mut impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    let n = match reader.by_ref().take(MAX_LINE_BYTES).read_line(&mut line) {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(HarnessError::Protocol("line is not valid UTF-8".into()));
        }
        Err(e) => return Err(e.into()),
    };
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && n as u64 == MAX_LINE_BYTES {
        return Err(HarnessError::Protocol(format!(
            "line exceeds {} bytes",
            MAX_LINE_BYTES
        )));
    }
    Ok(Some(line.trim_end().to_string()))
}

/// Write one line and flush.
pub fn write_line(writer: &mut impl Write, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_command_wire_format() {
        let cmd = Command::ExecuteOne {
            worker_id: "member-1".into(),
            command: TestCommand::Noop,
        };
        let value: Value = serde_json::from_str(&cmd.to_line().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"service": "execute_one", "worker_id": "member-1", "command": {"type": "noop"}})
        );
        assert_eq!(cmd.service(), "execute_one");
    }

    #[test]
    fn test_read_spawn_command_with_defaults() {
        let mut input = Cursor::new(b"{\"service\":\"spawn_workers\",\"settings\":{\"count\":3}}\n".to_vec());
        match Command::read_from(&mut input).unwrap() {
            Command::SpawnWorkers { settings } => {
                assert_eq!(settings.count, 3);
                assert_eq!(settings.role, "member");
            }
            other => panic!("Expected SpawnWorkers, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_service_is_protocol_error() {
        let mut input = Cursor::new(b"{\"service\":\"reboot\"}\n".to_vec());
        let err = Command::read_from(&mut input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_empty_connection_is_protocol_error() {
        let mut input = Cursor::new(Vec::new());
        assert!(matches!(
            Command::read_from(&mut input),
            Err(HarnessError::Protocol(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_protocol_error() {
        let mut input = Cursor::new(b"{\"service\":\"\xff\xfe\"}\n".to_vec());
        let err = Command::read_from(&mut input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_reads_consecutive_lines_from_one_reader() {
        let line = "{\"ok\":{\"kind\":\"unit\"}}\n";
        let mut input = Cursor::new(format!("{}{}", line, line).into_bytes());
        let first = CommandResult::read_from(&mut input).unwrap();
        let second = CommandResult::read_from(&mut input).unwrap();
        assert_eq!(first, CommandResult::Ok(CommandPayload::Unit));
        assert_eq!(second, first);
    }

    #[test]
    fn test_result_wire_format() {
        let ok = CommandResult::Ok(CommandPayload::WorkerIds(vec!["member-1".into()]));
        let value: Value = serde_json::from_str(&ok.to_line().unwrap()).unwrap();
        assert_eq!(value, json!({"ok": {"kind": "worker_ids", "data": ["member-1"]}}));

        let unit: Value = serde_json::from_str(&CommandResult::Ok(CommandPayload::Unit).to_line().unwrap()).unwrap();
        assert_eq!(unit, json!({"ok": {"kind": "unit"}}));

        let err = CommandResult::Err(CommandFailure::from(&HarnessError::UnknownWorker("x-1".into())));
        let value: Value = serde_json::from_str(&err.to_line().unwrap()).unwrap();
        assert_eq!(value["err"]["kind"], "unknown_worker");
    }

    #[test]
    fn test_err_result_becomes_remote_error() {
        let line = "{\"err\":{\"kind\":\"spawn_timeout\",\"message\":\"too slow\"}}\n";
        let result = CommandResult::read_from(&mut Cursor::new(line.as_bytes().to_vec())).unwrap();
        let err = result.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnTimeout);
        assert!(err.to_string().contains("too slow"));
    }

    #[test]
    fn test_oversized_line_rejected() {
        let mut big = vec![b'a'; MAX_LINE_BYTES as usize + 10];
        big.push(b'\n');
        let err = Command::read_from(&mut Cursor::new(big)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}

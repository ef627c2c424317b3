//! IPC protocol between the agent and its worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. A worker announces
//! `ready` once at startup and again after every `result` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of benchmark work executed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestCommand {
    /// Do nothing and succeed.
    Noop,
    /// Succeed with `message` as the value.
    Echo { message: String },
    /// Sleep for `millis`, then succeed.
    Sleep { millis: u64 },
    /// Fail with `message`.
    Fail { message: String },
    /// Terminate the worker process with `code` without answering.
    Exit { code: i32 },
    /// Workload-defined command.
    Custom {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

impl TestCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &str {
        match self {
            Self::Noop => "noop",
            Self::Echo { .. } => "echo",
            Self::Sleep { .. } => "sleep",
            Self::Fail { .. } => "fail",
            Self::Exit { .. } => "exit",
            Self::Custom { name, .. } => name,
        }
    }
}

/// Request from agent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    Execute { command: TestCommand },
    /// Graceful shutdown request.
    Exit,
}

/// Response from worker to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Worker is ready for work.
    Ready,
    Result {
        #[serde(default)]
        value: Value,
    },
    Error { message: String },
}

impl WorkRequest {
    pub fn execute(command: TestCommand) -> Self {
        Self::Execute { command }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn result(value: Value) -> Self {
        Self::Result { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_request_wire_format() {
        let req = WorkRequest::execute(TestCommand::Sleep { millis: 25 });
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({"type": "execute", "command": {"type": "sleep", "millis": 25}})
        );
        assert_eq!(WorkRequest::from_line(&line).unwrap(), req);
    }

    #[test]
    fn test_exit_request() {
        let line = WorkRequest::Exit.to_line().unwrap();
        assert_eq!(line, "{\"type\":\"exit\"}\n");
    }

    #[test]
    fn test_result_without_value_defaults_to_null() {
        let parsed = WorkResponse::from_line(r#"{"type":"result"}"#).unwrap();
        assert_eq!(parsed, WorkResponse::result(Value::Null));
    }

    #[test]
    fn test_error_response() {
        let line = WorkResponse::error("assertion failed").to_line().unwrap();
        match WorkResponse::from_line(&line).unwrap() {
            WorkResponse::Error { message } => assert_eq!(message, "assertion failed"),
            other => panic!("Expected Error variant, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_command_payload_optional() {
        let cmd: TestCommand = serde_json::from_str(r#"{"type":"custom","name":"warmup"}"#).unwrap();
        assert_eq!(cmd.name(), "warmup");
        assert_eq!(
            cmd,
            TestCommand::Custom {
                name: "warmup".into(),
                payload: Value::Null
            }
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(WorkRequest::from_line(r#"{"type":"explode"}"#).is_err());
    }
}

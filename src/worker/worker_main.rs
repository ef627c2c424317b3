//! Worker process main loop.
//!
//! Runs when `stampede worker` is invoked by an agent. Requests arrive on
//! stdin and responses leave on stdout; logs go to stderr.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{TestCommand, WorkRequest, WorkResponse};
use serde_json::{Value, json};
use std::io;
use std::os::unix::io::{AsFd, OwnedFd};
use std::time::Duration;

/// Executes test commands inside a worker.
pub trait CommandHandler {
    /// Run `command`. The error string is sent back to the agent verbatim.
    fn handle(&mut self, command: &TestCommand) -> Result<Value, String>;
}

/// Handler for the built-in command set.
#[derive(Debug)]
pub struct BuiltinHandler {
    id: String,
    role: String,
    executed: u64,
}

impl BuiltinHandler {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            executed: 0,
        }
    }

    fn stats(&self) -> Value {
        json!({
            "id": self.id,
            "role": self.role,
            "commands_executed": self.executed,
            "max_rss_kib": max_rss_kib(),
        })
    }
}

impl CommandHandler for BuiltinHandler {
    fn handle(&mut self, command: &TestCommand) -> Result<Value, String> {
        self.executed += 1;
        match command {
            TestCommand::Noop => Ok(Value::Null),
            TestCommand::Echo { message } => Ok(Value::String(message.clone())),
            TestCommand::Sleep { millis } => {
                std::thread::sleep(Duration::from_millis(*millis));
                Ok(json!({ "slept_ms": millis }))
            }
            TestCommand::Fail { message } => Err(message.clone()),
            TestCommand::Exit { code } => Err(format!("exit {} must be handled by the worker loop", code)),
            TestCommand::Custom { name, .. } if name == "stats" => Ok(self.stats()),
            TestCommand::Custom { name, .. } => {
                Err(format!("No handler for custom command '{}'", name))
            }
        }
    }
}

/// Peak resident set size of this process in KiB.
fn max_rss_kib() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;
            // macOS reports bytes, Linux kilobytes.
            if cfg!(target_os = "macos") {
                max_rss / 1024
            } else {
                max_rss
            }
        }
        Err(_) => 0,
    }
}

/// Serve requests until EOF or an exit request.
///
/// Returns the code the worker process should exit with.
pub fn worker_loop<H: CommandHandler>(
    handler: &mut H,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> io::Result<i32> {
    send(writer, &WorkResponse::Ready)?;

    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            // Agent closed the pipe.
            None => return Ok(0),
        };

        let request = match WorkRequest::from_line(&line) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid request from agent");
                send(writer, &WorkResponse::error(format!("Invalid request: {}", e)))?;
                send(writer, &WorkResponse::Ready)?;
                continue;
            }
        };

        match request {
            WorkRequest::Exit => {
                tracing::debug!("Exit requested");
                return Ok(0);
            }
            WorkRequest::Execute {
                command: TestCommand::Exit { code },
            } => {
                tracing::info!(code, "Exiting on command");
                return Ok(code);
            }
            WorkRequest::Execute { command } => {
                tracing::debug!(command = command.name(), "Executing command");
                let response = match handler.handle(&command) {
                    Ok(value) => WorkResponse::result(value),
                    Err(message) => WorkResponse::error(message),
                };
                send(writer, &response)?;
                send(writer, &WorkResponse::Ready)?;
            }
        }
    }
}

fn send(writer: &mut LineWriter, response: &WorkResponse) -> io::Result<()> {
    let line = response.to_line().map_err(io::Error::other)?;
    writer.write_line(&line)
}

/// Run the worker process. Never returns.
pub fn run_worker_main(id: &str, role: &str) -> ! {
    let code = match open_stdio() {
        Ok((mut reader, mut writer)) => {
            tracing::info!(worker_id = id, role, pid = std::process::id(), "Worker started");
            let mut handler = BuiltinHandler::new(id, role);
            match worker_loop(&mut handler, &mut reader, &mut writer) {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(worker_id = id, error = %e, "Worker IPC failed");
                    1
                }
            }
        }
        Err(e) => {
            tracing::error!(worker_id = id, error = %e, "Failed to open worker pipes");
            1
        }
    };
    std::process::exit(code)
}

/// Duplicate stdin/stdout into owned pipe ends.
fn open_stdio() -> io::Result<(LineReader, LineWriter)> {
    let stdin: OwnedFd = io::stdin().as_fd().try_clone_to_owned()?;
    let stdout: OwnedFd = io::stdout().as_fd().try_clone_to_owned()?;
    Ok((
        LineReader::new(PipeFd::new(stdin)),
        LineWriter::new(PipeFd::new(stdout)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pipe() -> (PipeFd, PipeFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (PipeFd::new(r), PipeFd::new(w))
    }

    /// Runs a worker loop on a thread, returning the agent-side ends.
    fn start_worker() -> (LineWriter, LineReader, thread::JoinHandle<io::Result<i32>>) {
        let (req_r, req_w) = pipe();
        let (resp_r, resp_w) = pipe();
        let handle = thread::spawn(move || {
            let mut handler = BuiltinHandler::new("member-1", "member");
            worker_loop(
                &mut handler,
                &mut LineReader::new(req_r),
                &mut LineWriter::new(resp_w),
            )
        });
        (LineWriter::new(req_w), LineReader::new(resp_r), handle)
    }

    fn recv(reader: &mut LineReader) -> WorkResponse {
        WorkResponse::from_line(reader.read_line().unwrap().unwrap()).unwrap()
    }

    fn request(writer: &mut LineWriter, req: WorkRequest) {
        writer.write_line(&req.to_line().unwrap()).unwrap();
    }

    #[test]
    fn test_ready_result_ready_sequence() {
        let (mut writer, mut reader, handle) = start_worker();
        assert_eq!(recv(&mut reader), WorkResponse::Ready);

        request(&mut writer, WorkRequest::execute(TestCommand::Echo { message: "ping".into() }));
        assert_eq!(recv(&mut reader), WorkResponse::result(Value::from("ping")));
        assert_eq!(recv(&mut reader), WorkResponse::Ready);

        request(&mut writer, WorkRequest::Exit);
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_fail_command_returns_error_then_ready() {
        let (mut writer, mut reader, handle) = start_worker();
        recv(&mut reader);

        request(&mut writer, WorkRequest::execute(TestCommand::Fail { message: "assertion failed".into() }));
        assert_eq!(recv(&mut reader), WorkResponse::error("assertion failed"));
        assert_eq!(recv(&mut reader), WorkResponse::Ready);

        drop(writer);
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_invalid_request_keeps_worker_alive() {
        let (mut writer, mut reader, handle) = start_worker();
        recv(&mut reader);

        writer.write_line("{not json").unwrap();
        assert!(matches!(recv(&mut reader), WorkResponse::Error { .. }));
        assert_eq!(recv(&mut reader), WorkResponse::Ready);

        request(&mut writer, WorkRequest::execute(TestCommand::Noop));
        assert_eq!(recv(&mut reader), WorkResponse::result(Value::Null));
        drop(writer);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_exit_command_returns_code_without_answer() {
        let (mut writer, mut reader, handle) = start_worker();
        recv(&mut reader);

        request(&mut writer, WorkRequest::execute(TestCommand::Exit { code: 42 }));
        assert_eq!(handle.join().unwrap().unwrap(), 42);
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_builtin_stats_and_unknown_custom() {
        let mut handler = BuiltinHandler::new("client-2", "client");
        handler.handle(&TestCommand::Noop).unwrap();

        let stats = handler
            .handle(&TestCommand::Custom { name: "stats".into(), payload: Value::Null })
            .unwrap();
        assert_eq!(stats["id"], "client-2");
        assert_eq!(stats["commands_executed"], 2);
        assert!(stats["max_rss_kib"].as_u64().unwrap() > 0);

        let err = handler
            .handle(&TestCommand::Custom { name: "warmup".into(), payload: Value::Null })
            .unwrap_err();
        assert!(err.contains("warmup"));
    }
}

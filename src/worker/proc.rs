//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its IPC channels.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{HarnessError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::time::{Duration, Instant};

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    /// Requests go to the worker's stdin.
    writer: LineWriter,
    /// Responses come from the worker's stdout.
    reader: LineReader,
    /// Exit status once the process has been reaped.
    status: Option<WaitStatus>,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(stdin),
            reader: LineReader::new(stdout),
            status: None,
        }
    }

    /// Create from a spawned child with piped stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Worker("Child stdout not captured".into()))?;

        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| HarnessError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Receive a response. Returns `None` if the worker closed its stdout.
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        match self.reader.read_line() {
            Ok(Some(line)) => {
                let response = WorkResponse::from_line(line).map_err(|e| {
                    HarnessError::Worker(format!("Invalid worker response: {}", e))
                })?;
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(HarnessError::Worker(format!(
                "Failed to receive from worker: {}",
                e
            ))),
        }
    }

    /// Wait up to `timeout` for the startup `ready` line.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn await_ready(&mut self, timeout: Duration) -> Result<bool> {
        let readable = self
            .reader
            .wait_readable(timeout)
            .map_err(|e| HarnessError::Worker(format!("Failed to poll worker: {}", e)))?;
        if !readable {
            return Ok(false);
        }
        match self.recv()? {
            Some(WorkResponse::Ready) => Ok(true),
            Some(other) => Err(HarnessError::Worker(format!(
                "Worker sent {:?} instead of ready",
                other
            ))),
            None => {
                let reason = self.termination_reason(Duration::from_millis(500));
                Err(HarnessError::Worker(format!(
                    "Worker closed its pipe before ready ({})",
                    reason
                )))
            }
        }
    }

    /// Whether the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Reap the process if it has exited.
    ///
    /// Returns `None` while it is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => Err(HarnessError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.status = Some(status);
                Ok(status)
            }
            Err(e) => Err(HarnessError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Why the process ended, waiting up to `grace` for it to exit.
    ///
    /// Used after the worker's pipe hit EOF, where exit usually follows shortly.
    pub fn termination_reason(&mut self, grace: Duration) -> TerminationReason {
        let deadline = Instant::now() + grace;
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return analyze_wait_status(status),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Ok(None) => return TerminationReason::StillAlive,
                Err(_) => return TerminationReason::Unknown,
            }
        }
    }

    pub fn terminate(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| HarnessError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL and reap.
    pub fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| HarnessError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Stop the worker: exit request, then SIGTERM after `timeout`, then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }

        // A dead or wedged worker may not read this; escalation covers it.
        let _ = self.send(&WorkRequest::Exit);

        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = self.try_wait() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(pid = self.pid.as_raw(), "Worker ignored exit request, sending SIGTERM");
        let _ = self.terminate();

        std::thread::sleep(Duration::from_millis(100));
        if let Ok(Some(_)) = self.try_wait() {
            return Ok(());
        }

        tracing::warn!(pid = self.pid.as_raw(), "Worker ignored SIGTERM, killing");
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));
            if let Ok(Some(_)) = self.try_wait() {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

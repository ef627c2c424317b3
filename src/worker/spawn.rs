//! Worker process launching.
//!
//! The manager never builds commands itself; it asks a [`Launcher`] for a
//! [`Proc`] whose stdin/stdout speak the worker protocol.

use super::proc::Proc;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Environment variable carrying the worker id.
pub const WORKER_ID_ENV: &str = "STAMPEDE_WORKER_ID";
/// Environment variable carrying the worker role.
pub const WORKER_ROLE_ENV: &str = "STAMPEDE_WORKER_ROLE";

fn default_role() -> String {
    "member".to_string()
}

/// What a spawn-workers command asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub count: usize,
    /// Role tag, also the worker id prefix.
    #[serde(default = "default_role")]
    pub role: String,
    /// Extra arguments appended to the worker command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Overrides the manager's readiness timeout for this batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_timeout_ms: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            role: default_role(),
            args: Vec::new(),
            env: BTreeMap::new(),
            readiness_timeout_ms: None,
        }
    }
}

impl WorkerSettings {
    pub fn new(count: usize, role: impl Into<String>) -> Self {
        Self {
            count,
            role: role.into(),
            ..Self::default()
        }
    }
}

/// One process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub id: String,
    pub role: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, settings: &WorkerSettings) -> Self {
        Self {
            id: id.into(),
            role: settings.role.clone(),
            args: settings.args.clone(),
            env: settings.env.clone(),
        }
    }
}

/// Starts worker processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec) -> Result<Proc>;
}

/// Launches a program with `<base args> --id <id> --role <role> <args>`.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ExecLauncher {
    /// Launch `program` with the default `worker` subcommand.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: vec!["worker".to_string()],
        }
    }

    /// Launch the running executable in worker mode.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            HarnessError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe))
    }

    /// Replace the arguments placed before `--id`.
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl Launcher for ExecLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<Proc> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--id")
            .arg(&spec.id)
            .arg("--role")
            .arg(&spec.role)
            .args(&spec.args)
            .envs(&spec.env)
            .env(WORKER_ID_ENV, &spec.id)
            .env(WORKER_ROLE_ENV, &spec.role);

        // stdout is the IPC channel; worker logs share the agent's stderr.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|e| {
            HarnessError::Worker(format!(
                "Failed to spawn worker {} ({}): {}",
                spec.id,
                self.program.display(),
                e
            ))
        })?;

        tracing::debug!(worker_id = %spec.id, pid = child.id(), "Launched worker process");
        Proc::from_child(child)
    }
}

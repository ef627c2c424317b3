//! Command-line interface definitions using clap.

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use stampede::agent::{AgentConfig, DEFAULT_PORT};
use stampede::logging::LogFormat;
use stampede::worker::{TestCommand, WorkerSettings};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::Level;

/// Control plane for distributed load testing.
#[derive(Parser, Debug)]
#[command(name = "stampede")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log format: pretty, compact or json.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an agent that accepts coordinator commands.
    Agent(AgentArgs),

    /// Run as a worker process. Started by the agent.
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Send a single command to a running agent.
    Send(SendArgs),
}

/// Arguments for the agent command.
#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Address to bind the command port to.
    #[arg(long, env = "STAMPEDE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Command port. 0 picks a free port.
    #[arg(short, long, env = "STAMPEDE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Position of this agent in the coordinator's agent list.
    #[arg(long, env = "STAMPEDE_ADDRESS_INDEX", default_value_t = 0)]
    pub address_index: usize,

    /// Address the coordinator knows this agent by.
    #[arg(long, env = "STAMPEDE_PUBLIC_ADDRESS")]
    pub public_address: Option<String>,

    /// Shut down when this process exits.
    #[arg(long, env = "STAMPEDE_PARENT_PID")]
    pub parent_pid: Option<i32>,

    /// Write the agent's pid to this file.
    #[arg(long, env = "STAMPEDE_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    /// Directory for exception files.
    #[arg(long, env = "STAMPEDE_EXCEPTION_DIR")]
    pub exception_dir: Option<PathBuf>,

    /// How long a new worker may take to report ready, in milliseconds.
    #[arg(
        long = "readiness-timeout",
        value_name = "MS",
        env = "STAMPEDE_READINESS_TIMEOUT_MS",
        default_value_t = 60_000
    )]
    pub readiness_timeout_ms: u64,

    /// How long a worker may take to exit before it is killed, in milliseconds.
    #[arg(
        long = "shutdown-timeout",
        value_name = "MS",
        env = "STAMPEDE_SHUTDOWN_TIMEOUT_MS",
        default_value_t = 5_000
    )]
    pub shutdown_timeout_ms: u64,

    /// Worker executable (defaults to this binary).
    #[arg(long, env = "STAMPEDE_WORKER_PROGRAM")]
    pub worker_program: Option<PathBuf>,
}

impl AgentArgs {
    pub fn to_config(&self) -> AgentConfig {
        AgentConfig {
            bind: self.bind.clone(),
            port: self.port,
            address_index: self.address_index,
            public_address: self.public_address.clone(),
            parent_pid: self.parent_pid,
            pid_file: self.pid_file.clone(),
            exception_dir: self.exception_dir.clone(),
            readiness_timeout_ms: self.readiness_timeout_ms,
            shutdown_timeout_ms: self.shutdown_timeout_ms,
            worker_program: self.worker_program.clone(),
        }
    }
}

/// Arguments for the worker command.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub id: String,

    #[arg(long, default_value = "member")]
    pub role: String,

    /// Extra arguments passed through by the agent.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

/// Arguments for the send command.
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Agent address (host:port).
    #[arg(short, long, env = "STAMPEDE_AGENT", default_value = "127.0.0.1:9000")]
    pub agent: String,

    /// Seconds to wait for the agent's response.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: SendCommand,
}

#[derive(Subcommand, Debug)]
pub enum SendCommand {
    /// Check that the agent is reachable.
    Echo {
        #[arg(default_value = "ping")]
        text: String,
    },

    /// Spawn worker processes.
    Spawn(SpawnArgs),

    /// List worker ids.
    List,

    /// Run a command on every worker.
    ///
    /// COMMAND is one of: noop, echo:TEXT, sleep:MILLIS, fail:TEXT,
    /// exit:CODE, a custom command name, or a JSON command object.
    ExecuteAll {
        #[arg(value_parser = parse_test_command)]
        command: TestCommand,
    },

    /// Run a command on one worker.
    ExecuteOne {
        worker_id: String,
        #[arg(value_parser = parse_test_command)]
        command: TestCommand,
    },

    /// Stop every worker.
    Terminate,

    /// Drain the agent's failures.
    Failures,

    /// Register the test suite about to run.
    InitSuite {
        /// Suite id.
        id: String,
        /// Test ids in the suite.
        tests: Vec<String>,
    },

    /// Submit a message to the agent's message processor.
    Message {
        kind: String,
        #[arg(long, default_value = "")]
        address: String,
        /// JSON payload.
        #[arg(long, value_parser = parse_json, default_value = "null")]
        payload: Value,
    },
}

/// Arguments for the spawn command.
#[derive(Args, Debug)]
pub struct SpawnArgs {
    /// Number of workers to spawn.
    pub count: usize,

    /// Role tag, also the worker id prefix.
    #[arg(short, long, default_value = "member")]
    pub role: String,

    /// Extra worker argument (repeatable).
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Worker environment variable as KEY=VALUE (repeatable).
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Readiness timeout for this batch, in milliseconds.
    #[arg(long)]
    pub readiness_timeout_ms: Option<u64>,
}

impl SpawnArgs {
    pub fn to_settings(&self) -> WorkerSettings {
        WorkerSettings {
            count: self.count,
            role: self.role.clone(),
            args: self.args.clone(),
            env: self.env.iter().cloned().collect::<BTreeMap<_, _>>(),
            readiness_timeout_ms: self.readiness_timeout_ms,
        }
    }
}

/// Parse a worker command from its shorthand or JSON form.
pub fn parse_test_command(s: &str) -> Result<TestCommand, String> {
    let s = s.trim();
    if s.starts_with('{') {
        return serde_json::from_str(s).map_err(|e| format!("invalid command JSON: {}", e));
    }

    let (name, arg) = match s.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (s, None),
    };
    match (name, arg) {
        ("", _) => Err("empty command".to_string()),
        ("noop", None) => Ok(TestCommand::Noop),
        ("echo", arg) => Ok(TestCommand::Echo {
            message: arg.unwrap_or_default().to_string(),
        }),
        ("sleep", Some(millis)) => millis
            .parse()
            .map(|millis| TestCommand::Sleep { millis })
            .map_err(|_| format!("invalid sleep duration: '{}'", millis)),
        ("sleep", None) => Err("sleep needs a duration, as in sleep:100".to_string()),
        ("fail", arg) => Ok(TestCommand::Fail {
            message: arg.unwrap_or("failed on request").to_string(),
        }),
        ("exit", arg) => arg
            .unwrap_or("0")
            .parse()
            .map(|code| TestCommand::Exit { code })
            .map_err(|_| format!("invalid exit code: '{}'", arg.unwrap_or_default())),
        (name, None) => Ok(TestCommand::Custom {
            name: name.to_string(),
            payload: Value::Null,
        }),
        (name, Some(_)) => Err(format!("command '{}' takes no argument", name)),
    }
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: the command's own log level.
    Normal,
    /// -v: include info.
    Info,
    /// -vv: include debug output.
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }

    /// Log level to use instead of `default`, if the flags ask for one.
    pub fn log_level(&self, default: Level) -> Option<Level> {
        match self.verbosity() {
            Verbosity::Quiet => Some(Level::ERROR),
            Verbosity::Normal => None,
            Verbosity::Info => Some(default.max(Level::INFO)),
            Verbosity::Debug => Some(default.max(Level::DEBUG)),
        }
    }
}

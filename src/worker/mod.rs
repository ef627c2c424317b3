//! Local worker processes.
//!
//! An agent runs its benchmark workloads in separate worker processes so a
//! crashing or leaking workload cannot take the agent down with it.
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │      Agent      │
//!                     │ (ProcessManager)│
//!                     └────────┬────────┘
//!                   stdin/stdout JSON lines
//!               ┌──────────────┼──────────────┐
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ member-1  │  │ member-2  │  │ client-1  │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```

mod ipc;
pub mod manager;
mod proc;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod worker_main;

pub use manager::{ManagerConfig, ManagerStats, WorkerOutcome, WorkerProcessManager, WorkerState};
pub use proc::Proc;
pub use protocol::{TestCommand, WorkRequest, WorkResponse};
pub use signals::{TerminationReason, WorkerFailure};
pub use spawn::{ExecLauncher, Launcher, WorkerSettings, WorkerSpec};
pub use worker_main::{BuiltinHandler, CommandHandler, run_worker_main};

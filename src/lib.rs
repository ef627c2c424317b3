//! stampede - control plane for distributed load testing.
//!
//! An agent runs on every load-generating machine. It accepts commands from
//! a coordinator over TCP, spawns and drives local worker processes, and
//! collects the failures they produce.
//!
//! Building blocks:
//!
//! - [`failure::FailureQueue`] buffers failure records until the
//!   coordinator drains them.
//! - [`thread_group::ThreadGroup`] runs named units of work and either
//!   propagates or reports their errors.
//! - [`streamer::AsyncStreamer`] bounds the number of in-flight writes to
//!   an asynchronous store.
//! - [`worker::WorkerProcessManager`] owns the worker processes.

pub mod agent;
pub mod error;
pub mod exception;
pub mod failure;
pub mod logging;
pub mod streamer;
pub mod thread_group;
pub mod worker;

pub use error::{HarnessError, Result};

//! Supervised groups of named threads.
//!
//! A [`ThreadGroup`] spawns units of work on their own OS threads, names them
//! `prefix-N` (numbered per prefix, per group, starting at 1) and joins them in
//! [`ThreadGroup::await_completion`]. What happens to a failing unit depends on
//! the group's [`FailureMode`]:
//!
//! - [`FailureMode::Propagate`]: the first failure (by completion order) is
//!   returned from `await_completion` once every unit has joined, and from
//!   every later call as well.
//! - [`FailureMode::Report`]: failures go to an [`ExceptionSink`] tagged with the
//!   group identifier and `await_completion` always succeeds.
//!
//! Panics inside a unit count as failures.

use crate::error::{HarnessError, Result};
use crate::exception::ExceptionSink;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// What a group does with failures of its units.
#[derive(Debug, Clone)]
pub enum FailureMode {
    Propagate,
    Report(Arc<ExceptionSink>),
}

/// Handle given to every unit of work.
#[derive(Debug, Clone)]
pub struct UnitContext {
    name: String,
    interrupted: Arc<AtomicBool>,
    frames: Arc<Mutex<Vec<String>>>,
}

impl UnitContext {
    /// The generated `prefix-N` name of this unit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`ThreadGroup::interrupt_all`] has been called.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless interrupted first.
    ///
    /// Returns `false` if the sleep was cut short by an interrupt.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Push a frame onto this unit's diagnostic stack; popped when the guard drops.
    pub fn enter(&self, frame: impl Into<String>) -> FrameGuard {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.into());
        FrameGuard {
            frames: Arc::clone(&self.frames),
        }
    }
}

/// Pops a diagnostic frame on drop.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    frames: Arc<Mutex<Vec<String>>>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
    }
}

/// Diagnostic view of one alive unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub name: String,
    pub running_for: Duration,
    /// Innermost frame last.
    pub frames: Vec<String>,
}

impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "\"{}\" running for {}ms",
            self.name,
            self.running_for.as_millis()
        )?;
        for frame in self.frames.iter().rev() {
            write!(f, "\n    at {}", frame)?;
        }
        Ok(())
    }
}

struct Unit {
    name: String,
    started: Instant,
    alive: Arc<AtomicBool>,
    frames: Arc<Mutex<Vec<String>>>,
    thread: Thread,
    handle: Option<JoinHandle<()>>,
}

/// Spawns, supervises and joins a named set of threads.
pub struct ThreadGroup {
    identifier: String,
    mode: FailureMode,
    sequences: Mutex<HashMap<String, usize>>,
    units: Mutex<Vec<Unit>>,
    first_failure: Arc<Mutex<Option<CapturedFailure>>>,
    interrupted: Arc<AtomicBool>,
}

impl ThreadGroup {
    pub fn new(identifier: impl Into<String>, mode: FailureMode) -> Self {
        Self {
            identifier: identifier.into(),
            mode,
            sequences: Mutex::new(HashMap::new()),
            units: Mutex::new(Vec::new()),
            first_failure: Arc::new(Mutex::new(None)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Group whose `await_completion` returns the first failure.
    pub fn propagating(identifier: impl Into<String>) -> Self {
        Self::new(identifier, FailureMode::Propagate)
    }

    /// Group that reports failures to `sink` and never fails.
    pub fn reporting(identifier: impl Into<String>, sink: Arc<ExceptionSink>) -> Self {
        Self::new(identifier, FailureMode::Report(sink))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Spawn `work` on a new thread named `prefix-N`. Returns the name.
    pub fn spawn<F>(&self, prefix: &str, work: F) -> Result<String>
    where
        F: FnOnce(&UnitContext) -> Result<()> + Send + 'static,
    {
        let name = self.next_name(prefix);
        let alive = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let ctx = UnitContext {
            name: name.clone(),
            interrupted: Arc::clone(&self.interrupted),
            frames: Arc::clone(&frames),
        };

        let identifier = self.identifier.clone();
        let mode = self.mode.clone();
        let first_failure = Arc::clone(&self.first_failure);
        let unit_alive = Arc::clone(&alive);

        // Hold the lock across spawn so a unit is never missed by await_completion.
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        // Finished units have already recorded their outcome.
        units.retain(|u| u.alive.load(Ordering::SeqCst));

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
                Ok(result) => result,
                Err(payload) => Err(HarnessError::ThreadGroup {
                    thread: ctx.name.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            };
            if let Err(err) = outcome {
                handle_failure(&identifier, &ctx.name, &mode, &first_failure, err);
            }
            unit_alive.store(false, Ordering::SeqCst);
        })?;

        tracing::trace!(group = %self.identifier, thread = %name, "Spawned unit");

        units.push(Unit {
            name: name.clone(),
            started: Instant::now(),
            alive,
            frames,
            thread: handle.thread().clone(),
            handle: Some(handle),
        });
        Ok(name)
    }

    /// Block until every spawned unit has finished.
    ///
    /// In propagate mode, returns the first captured failure, tagged with the
    /// thread that raised it. Units spawned after this call starts returning
    /// are not waited on.
    pub fn await_completion(&self) -> Result<()> {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
                units.iter_mut().filter_map(|u| u.handle.take()).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                // Unit bodies catch their own panics, so join only fails on
                // a panic inside failure handling itself.
                if handle.join().is_err() {
                    tracing::error!(group = %self.identifier, "Unit failed outside its work closure");
                }
            }
        }

        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|u| u.alive.load(Ordering::SeqCst));

        match &*self.first_failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(captured) => Err(captured.to_error()),
            None => Ok(()),
        }
    }

    /// Ask every unit to stop. Units observe this through their [`UnitContext`].
    pub fn interrupt_all(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        for unit in units.iter() {
            unit.thread.unpark();
        }
        tracing::debug!(group = %self.identifier, units = units.len(), "Interrupt requested");
    }

    /// Diagnostic trace of every unit that is still running.
    pub fn snapshot_stack_traces(&self) -> Vec<StackTrace> {
        let units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        units
            .iter()
            .filter(|u| u.alive.load(Ordering::SeqCst))
            .map(|u| StackTrace {
                name: u.name.clone(),
                running_for: u.started.elapsed(),
                frames: u
                    .frames
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            })
            .collect()
    }

    /// Number of units that have not finished yet.
    pub fn alive_count(&self) -> usize {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|u| u.alive.load(Ordering::SeqCst))
            .count()
    }

    fn next_name(&self, prefix: &str) -> String {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = sequences.entry(prefix.to_string()).or_insert(0);
        *seq += 1;
        format!("{}-{}", prefix, seq)
    }
}

/// The first failure of a propagating group, kept for every later await.
#[derive(Debug, Clone)]
struct CapturedFailure {
    thread: String,
    message: String,
}

impl CapturedFailure {
    fn new(thread_name: &str, err: HarnessError) -> Self {
        match err {
            HarnessError::ThreadGroup { thread, message } => Self { thread, message },
            other => Self {
                thread: thread_name.to_string(),
                message: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> HarnessError {
        HarnessError::ThreadGroup {
            thread: self.thread.clone(),
            message: self.message.clone(),
        }
    }
}

fn handle_failure(
    identifier: &str,
    thread_name: &str,
    mode: &FailureMode,
    first_failure: &Mutex<Option<CapturedFailure>>,
    err: HarnessError,
) {
    match mode {
        FailureMode::Propagate => {
            let mut slot = first_failure.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                tracing::debug!(group = identifier, thread = thread_name, error = %err, "Unit failed");
                *slot = Some(CapturedFailure::new(thread_name, err));
            } else {
                tracing::warn!(
                    group = identifier,
                    thread = thread_name,
                    error = %err,
                    "Unit failed after an earlier failure was captured"
                );
            }
        }
        FailureMode::Report(sink) => sink.report(identifier, thread_name, &err),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

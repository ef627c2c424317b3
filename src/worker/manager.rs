//! Lifecycle of the worker processes hosted by one agent.
//!
//! Workers move through `Spawning → Running → Terminated`. Only running workers
//! are kept in the registry; a worker leaves it when it is terminated, rolled
//! back, or declared dead through [`WorkerProcessManager::mark_terminated`].
//!
//! A worker whose pipe closes while it executes a command is reported as a
//! failure for that command, recorded in the [`FailureQueue`] with a crash
//! classification, and removed from the registry.

use super::proc::Proc;
use super::protocol::{TestCommand, WorkRequest, WorkResponse};
use super::signals::{TerminationReason, WorkerFailure};
use super::spawn::{Launcher, WorkerSettings, WorkerSpec};
use crate::error::{CommandFailure, ErrorKind, HarnessError, Result};
use crate::failure::{FailureQueue, FailureRecord};
use crate::thread_group::ThreadGroup;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::instrument;

/// How long a worker gets to exit after its pipe closes.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Running,
    Terminated,
}

/// Timeouts and identity for a [`WorkerProcessManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Time a spawn batch has to become ready.
    pub readiness_timeout: Duration,
    /// Time a worker has to honour an exit request before it is signalled.
    pub shutdown_timeout: Duration,
    /// Address stamped on failure records.
    pub agent_address: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            agent_address: None,
        }
    }
}

/// Result of one command on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub worker_id: String,
    pub result: std::result::Result<Value, CommandFailure>,
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Counters over the manager's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub running: usize,
    pub workers_spawned: usize,
    pub workers_lost: usize,
    pub jobs_completed: usize,
}

struct WorkerHandle {
    id: String,
    state: WorkerState,
    proc: Proc,
    /// Set when the process died under us; the manager reaps it.
    lost: Option<WorkerFailure>,
}

impl WorkerHandle {
    fn execute(&mut self, command: &TestCommand) -> Result<Value> {
        if self.state != WorkerState::Running {
            return Err(HarnessError::UnknownWorker(self.id.clone()));
        }
        let context = format!("executing {}", command.name());

        if let Err(e) = self.proc.send(&WorkRequest::execute(command.clone())) {
            return Err(self.lose(&context, Some(e.to_string())));
        }

        match self.proc.recv() {
            Ok(Some(WorkResponse::Result { value })) => {
                self.await_next_ready(&context);
                Ok(value)
            }
            Ok(Some(WorkResponse::Error { message })) => {
                self.await_next_ready(&context);
                Err(HarnessError::CommandExecution(message))
            }
            Ok(Some(WorkResponse::Ready)) => Err(HarnessError::Worker(format!(
                "Worker {} sent ready instead of a result",
                self.id
            ))),
            Ok(None) => Err(self.lose(&context, None)),
            Err(e) => Err(self.lose(&context, Some(e.to_string()))),
        }
    }

    /// Consume the `ready` that follows every answer.
    fn await_next_ready(&mut self, context: &str) {
        match self.proc.recv() {
            Ok(Some(WorkResponse::Ready)) => {}
            Ok(Some(other)) => {
                tracing::warn!(worker_id = %self.id, response = ?other, "Expected ready from worker");
            }
            // The answer already arrived; the loss is reaped afterwards.
            Ok(None) => {
                self.lose(context, None);
            }
            Err(e) => {
                self.lose(context, Some(e.to_string()));
            }
        }
    }

    fn lose(&mut self, context: &str, message: Option<String>) -> HarnessError {
        let reason = self.proc.termination_reason(EXIT_GRACE);
        if reason == TerminationReason::StillAlive {
            // Broken pipe but the process lingers; don't leave it behind.
            let _ = self.proc.kill();
        }

        let mut failure = WorkerFailure::new(reason).with_context(context);
        if let Some(message) = message {
            failure = failure.with_message(message);
        }
        tracing::warn!(
            worker_id = %self.id,
            reason = %failure.reason,
            context,
            "Worker died unexpectedly"
        );

        let err = HarnessError::Worker(format!("Worker {} {}", self.id, failure));
        self.state = WorkerState::Terminated;
        self.lost = Some(failure);
        err
    }
}

struct WorkerEntry {
    id: String,
    pid: Pid,
    handle: Mutex<WorkerHandle>,
}

impl WorkerEntry {
    fn lock(&self) -> MutexGuard<'_, WorkerHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the handle, giving a busy worker at most `timeout` to finish.
    fn lock_within(&self, timeout: Duration) -> Option<MutexGuard<'_, WorkerHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.handle.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10))
                }
                Err(TryLockError::WouldBlock) => return None,
            }
        }
    }

    fn execute(&self, command: &TestCommand) -> Result<Value> {
        self.lock().execute(command)
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        let mut handle = match self.lock_within(timeout) {
            Some(handle) => handle,
            None => {
                tracing::warn!(worker_id = %self.id, "Worker busy past shutdown timeout, killing");
                let _ = signal::kill(self.pid, Signal::SIGKILL);
                self.lock()
            }
        };
        handle.state = WorkerState::Terminated;
        handle.proc.stop(timeout)
    }
}

/// Spawns, drives and terminates the local worker processes.
pub struct WorkerProcessManager {
    launcher: Box<dyn Launcher>,
    config: ManagerConfig,
    workers: Mutex<Vec<Arc<WorkerEntry>>>,
    sequences: Mutex<HashMap<String, usize>>,
    failures: Arc<FailureQueue>,
    workers_spawned: AtomicUsize,
    workers_lost: AtomicUsize,
    jobs_completed: AtomicUsize,
}

impl WorkerProcessManager {
    pub fn new(
        launcher: impl Launcher + 'static,
        config: ManagerConfig,
        failures: Arc<FailureQueue>,
    ) -> Self {
        Self {
            launcher: Box::new(launcher),
            config,
            workers: Mutex::new(Vec::new()),
            sequences: Mutex::new(HashMap::new()),
            failures,
            workers_spawned: AtomicUsize::new(0),
            workers_lost: AtomicUsize::new(0),
            jobs_completed: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Start `settings.count` workers and wait until all of them are ready.
    ///
    /// All or nothing: if any worker fails to launch or misses the readiness
    /// deadline, every process of the batch is stopped and the registry is
    /// left as it was. Returns the new ids.
    #[instrument(level = "debug", skip(self, settings), fields(count = settings.count, role = %settings.role))]
    pub fn spawn(&self, settings: &WorkerSettings) -> Result<Vec<String>> {
        if settings.count == 0 {
            return Ok(Vec::new());
        }
        let timeout = settings
            .readiness_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.readiness_timeout);
        let deadline = Instant::now() + timeout;

        tracing::info!(
            count = settings.count,
            role = %settings.role,
            timeout_ms = timeout.as_millis() as u64,
            "Spawning workers"
        );

        let mut batch = Vec::with_capacity(settings.count);
        for _ in 0..settings.count {
            let id = self.next_id(&settings.role);
            match self.launcher.launch(&WorkerSpec::new(&id, settings)) {
                Ok(proc) => batch.push(WorkerHandle {
                    id,
                    state: WorkerState::Spawning,
                    proc,
                    lost: None,
                }),
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "Worker launch failed, rolling back batch");
                    self.rollback(batch);
                    return Err(e);
                }
            }
        }

        let mut failure = None;
        for handle in batch.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.proc.await_ready(remaining) {
                Ok(true) => {
                    handle.state = WorkerState::Running;
                    tracing::debug!(worker_id = %handle.id, pid = handle.proc.pid().as_raw(), "Worker ready");
                }
                Ok(false) => {
                    failure = Some(HarnessError::SpawnTimeout {
                        worker_id: handle.id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                    break;
                }
                Err(e) => {
                    failure = Some(HarnessError::Worker(format!(
                        "Worker {} failed to start: {}",
                        handle.id, e
                    )));
                    break;
                }
            }
        }
        if let Some(err) = failure {
            tracing::warn!(error = %err, "Spawn failed, rolling back batch");
            self.rollback(batch);
            return Err(err);
        }

        let ids: Vec<String> = batch.iter().map(|h| h.id.clone()).collect();
        self.workers_spawned.fetch_add(batch.len(), Ordering::Relaxed);
        let mut workers = self.lock_workers();
        for handle in batch {
            workers.push(Arc::new(WorkerEntry {
                id: handle.id.clone(),
                pid: handle.proc.pid(),
                handle: Mutex::new(handle),
            }));
        }
        tracing::info!(spawned = ids.len(), running = workers.len(), "Workers running");
        Ok(ids)
    }

    /// Run `command` on every running worker concurrently.
    ///
    /// Outcomes come back in registry order; one worker failing does not
    /// affect the others.
    #[instrument(level = "debug", skip(self, command), fields(command = command.name()))]
    pub fn execute_on_all(&self, command: &TestCommand) -> Vec<WorkerOutcome> {
        let entries = self.snapshot();
        if entries.is_empty() {
            return Vec::new();
        }

        let slots: Arc<Mutex<Vec<Option<WorkerOutcome>>>> =
            Arc::new(Mutex::new(vec![None; entries.len()]));
        let group = ThreadGroup::propagating(format!("execute-{}", command.name()));

        for (index, entry) in entries.iter().enumerate() {
            let unit_entry = Arc::clone(entry);
            let unit_slots = Arc::clone(&slots);
            let command = command.clone();
            let spawned = group.spawn("execute", move |ctx| {
                let _frame = ctx.enter(format!("{} on {}", command.name(), unit_entry.id));
                let result = unit_entry
                    .execute(&command)
                    .map_err(|e| CommandFailure::from(&e));
                unit_slots.lock().unwrap_or_else(PoisonError::into_inner)[index] =
                    Some(WorkerOutcome {
                        worker_id: unit_entry.id.clone(),
                        result,
                    });
                Ok(())
            });
            if let Err(e) = spawned {
                tracing::error!(worker_id = %entry.id, error = %e, "Failed to start execution thread");
            }
        }

        if let Err(e) = group.await_completion() {
            tracing::error!(error = %e, "Execution thread failed");
        }

        let collected = std::mem::take(&mut *slots.lock().unwrap_or_else(PoisonError::into_inner));
        let outcomes: Vec<WorkerOutcome> = collected
            .into_iter()
            .zip(&entries)
            .map(|(slot, entry)| {
                slot.unwrap_or_else(|| WorkerOutcome {
                    worker_id: entry.id.clone(),
                    result: Err(CommandFailure {
                        kind: ErrorKind::ThreadGroup,
                        message: format!("No result collected from worker {}", entry.id),
                        causes: Vec::new(),
                    }),
                })
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        self.jobs_completed.fetch_add(succeeded, Ordering::Relaxed);
        tracing::debug!(
            workers = outcomes.len(),
            succeeded,
            failed = outcomes.len() - succeeded,
            "Fan-out complete"
        );

        self.reap_lost();
        outcomes
    }

    /// Run `command` on the worker `id`.
    pub fn execute_on_one(&self, id: &str, command: &TestCommand) -> Result<Value> {
        let entry = self
            .find(id)
            .ok_or_else(|| HarnessError::UnknownWorker(id.to_string()))?;
        let result = entry.execute(command);
        if result.is_ok() {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        }
        self.reap_lost();
        result
    }

    /// Stop every worker concurrently and empty the registry.
    ///
    /// Each worker gets an exit request, then SIGTERM, then SIGKILL. Stop
    /// errors are recorded as failures. Returns how many workers were stopped.
    pub fn terminate_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.lock_workers());
        if entries.is_empty() {
            return 0;
        }
        tracing::info!(count = entries.len(), "Terminating workers");

        let timeout = self.config.shutdown_timeout;
        let results: Vec<(String, Result<()>)> = thread::scope(|s| {
            let handles: Vec<_> = entries
                .iter()
                .map(|entry| s.spawn(move || (entry.id.clone(), entry.shutdown(timeout))))
                .collect();
            handles
                .into_iter()
                .zip(&entries)
                .map(|(h, entry)| {
                    h.join().unwrap_or_else(|_| {
                        (
                            entry.id.clone(),
                            Err(HarnessError::Worker("Shutdown thread panicked".into())),
                        )
                    })
                })
                .collect()
        });

        for (id, result) in &results {
            if let Err(e) = result {
                tracing::warn!(worker_id = %id, error = %e, "Worker did not stop cleanly");
                self.failures.append(
                    FailureRecord::new(id.as_str(), format!("Failed to stop worker {}: {}", id, e))
                        .with_classification("shutdown")
                        .with_worker(id.as_str())
                        .with_agent(self.config.agent_address.clone()),
                );
            }
        }
        results.len()
    }

    /// Declare worker `id` dead: record `cause` and drop it from the registry.
    ///
    /// Returns `false` if the id is not registered.
    pub fn mark_terminated(&self, id: &str, cause: WorkerFailure) -> bool {
        let removed = {
            let mut workers = self.lock_workers();
            workers
                .iter()
                .position(|e| e.id == id)
                .map(|index| workers.remove(index))
        };
        let Some(entry) = removed else {
            tracing::debug!(worker_id = id, "Ignoring termination of unknown worker");
            return false;
        };

        match entry.handle.try_lock() {
            Ok(mut handle) => {
                handle.state = WorkerState::Terminated;
                let _ = handle.proc.kill();
            }
            // A command is in flight; killing the process unblocks it.
            Err(_) => {
                let _ = signal::kill(entry.pid, Signal::SIGKILL);
            }
        }

        self.workers_lost.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(worker_id = id, cause = %cause, "Worker terminated");
        self.failures
            .append(cause.to_record(id, self.config.agent_address.clone()));
        true
    }

    /// Ids of the registered workers in spawn order.
    pub fn list(&self) -> Vec<String> {
        self.lock_workers().iter().map(|e| e.id.clone()).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.lock_workers().len()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            running: self.worker_count(),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_lost: self.workers_lost.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Arc<WorkerEntry>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<WorkerEntry>> {
        self.lock_workers().clone()
    }

    fn find(&self, id: &str) -> Option<Arc<WorkerEntry>> {
        self.lock_workers().iter().find(|e| e.id == id).cloned()
    }

    fn next_id(&self, role: &str) -> String {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = sequences.entry(role.to_string()).or_insert(0);
        *seq += 1;
        format!("{}-{}", role, seq)
    }

    /// Hand workers that died mid-command over to `mark_terminated`.
    fn reap_lost(&self) {
        let lost: Vec<(String, WorkerFailure)> = self
            .lock_workers()
            .iter()
            .filter_map(|entry| {
                let mut handle = entry.handle.try_lock().ok()?;
                handle.lost.take().map(|failure| (entry.id.clone(), failure))
            })
            .collect();
        for (id, failure) in lost {
            self.mark_terminated(&id, failure);
        }
    }

    fn rollback(&self, batch: Vec<WorkerHandle>) {
        let timeout = self.config.shutdown_timeout;
        thread::scope(|s| {
            for mut handle in batch {
                s.spawn(move || {
                    if let Err(e) = handle.proc.stop(timeout) {
                        tracing::warn!(worker_id = %handle.id, error = %e, "Failed to stop worker during rollback");
                    }
                });
            }
        });
    }
}

impl Drop for WorkerProcessManager {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

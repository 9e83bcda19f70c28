//! The dispatch loop: claim, route, execute, then complete or recover.
//!
//! The store transaction is never held across an executor call. A worker
//! commits its claim, runs the executor, and records the outcome in a fresh
//! transaction, so other workers and the CLI stay responsive meanwhile.
//!
//! The executor runs on its own scoped thread and the worker waits at most
//! the tier's timeout for it. Past that the dispatch is recorded as a
//! timeout failure; a late result is dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionResult, Executor};
use crate::marker;
use crate::model::{FailureReport, RootCause, Status, WorkItem};
use crate::paths;
use crate::recovery::{self, RecoveryDecision, RecoveryPolicy};
use crate::router::{self, BoundedContext, Capability, TierTable};
use crate::scheduler;
use crate::store;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub tiers: TierTable,
    pub capabilities: Vec<Capability>,
    pub policy: RecoveryPolicy,
    pub poll_interval: Duration,
    /// Where completion markers go; `None` disables them.
    pub marker_dir: Option<PathBuf>,
    /// Stop once nothing is ready and nothing is in flight.
    pub exit_when_idle: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            tiers: TierTable::default(),
            capabilities: Vec::new(),
            policy: RecoveryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            marker_dir: None,
            exit_when_idle: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        EngineOptions {
            tiers: config.tiers.clone(),
            capabilities: config.capabilities.clone(),
            policy: config.recovery_policy(),
            poll_interval: config.poll_interval(),
            marker_dir: Some(paths::marker_dir()),
            exit_when_idle: false,
        }
    }
}

/// What one scheduling step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Idle,
    Completed(String),
    Retried(String),
    Halted(String),
    /// Cancelled while the executor ran; the outcome was discarded.
    Cancelled(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub retried: usize,
    pub halted: usize,
    pub cancelled: usize,
}

impl RunSummary {
    fn record(&mut self, dispatch: &Dispatch) {
        match dispatch {
            Dispatch::Idle => {}
            Dispatch::Completed(_) => self.completed += 1,
            Dispatch::Retried(_) => self.retried += 1,
            Dispatch::Halted(_) => self.halted += 1,
            Dispatch::Cancelled(_) => self.cancelled += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.halted += other.halted;
        self.cancelled += other.cancelled;
    }
}

pub struct Engine<E> {
    db_path: String,
    executor: E,
    options: EngineOptions,
    running: Arc<AtomicBool>,
}

impl<E: Executor> Engine<E> {
    pub fn new(db_path: &str, executor: E, options: EngineOptions, running: Arc<AtomicBool>) -> Self {
        Engine {
            db_path: db_path.to_string(),
            executor,
            options,
            running,
        }
    }

    /// Claim and dispatch at most one item.
    pub fn run_once(&self, conn: &Connection, worker: &str) -> Result<Dispatch> {
        let Some(item) = scheduler::next(conn, worker)? else {
            return Ok(Dispatch::Idle);
        };
        let id = item.id.clone();

        let notes = store::list_notes(conn, &id)?;
        let ctx = router::build_context(&item, &notes, &self.options.capabilities, &self.options.tiers);
        if ctx.dropped_context > 0 || !ctx.dropped_capabilities.is_empty() {
            debug!(
                "{id}: {} context entries and capabilities [{}] over the {} cap",
                ctx.dropped_context,
                ctx.dropped_capabilities.join(", "),
                ctx.tier
            );
        }
        store::record_event(conn, &id, "dispatched", &format!("{} by {worker}", ctx.tier))?;
        info!("{worker}: dispatching {id} at {}", ctx.tier);

        let dispatch = thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            let executor = &self.executor;
            let (item, ctx) = (&item, &ctx);
            let handle = s.spawn(move || {
                // Fails only once the worker has timed out and moved on.
                let _ = tx.send(executor.dispatch(item, ctx));
            });
            let result = self.await_result(&rx, item, ctx, worker);
            let dispatch = self.settle(conn, id, worker, result);
            if handle.join().is_err() {
                warn!("{worker}: executor thread for {} panicked", item.id);
            }
            dispatch
        })?;
        self.write_marker(&dispatch);
        Ok(dispatch)
    }

    /// Wait up to the tier timeout for the executor's answer and turn every
    /// way it can end into an [`ExecutionResult`].
    fn await_result(
        &self,
        rx: &mpsc::Receiver<anyhow::Result<ExecutionResult>>,
        item: &WorkItem,
        ctx: &BoundedContext,
        worker: &str,
    ) -> ExecutionResult {
        let started = Instant::now();
        let outcome = rx.recv_timeout(Duration::from_secs(ctx.timeout_secs));
        debug!("{}: executor settled after {:?}", item.id, started.elapsed());
        let error = match outcome {
            Ok(Ok(result)) => return result,
            Ok(Err(e)) => format!("{e:#}"),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{worker}: {} exceeded the {} timeout of {}s",
                    item.id, ctx.tier, ctx.timeout_secs
                );
                return ExecutionResult::failed(FailureReport::timeout(ctx.timeout_secs));
            }
            Err(RecvTimeoutError::Disconnected) => "executor panicked".to_string(),
        };
        warn!("{worker}: executor error on {}: {error}", item.id);
        ExecutionResult::failed(FailureReport::new(RootCause::ConfigurationError, &error, "", ""))
    }

    /// Apply an execution result to the store on behalf of `worker`. A claim
    /// lost in the meantime turns the outcome into `Cancelled`.
    fn settle(&self, conn: &Connection, id: String, worker: &str, result: ExecutionResult) -> Result<Dispatch> {
        if !self.still_claimed(conn, &id, worker)? {
            info!("{worker}: {id} was cancelled while running, discarding outcome");
            return Ok(Dispatch::Cancelled(id));
        }

        let dispatch = match result.failure() {
            None => match store::complete(conn, &id, Some(worker)) {
                Ok(()) => {
                    if !result.artifacts_changed.is_empty() {
                        store::record_event(conn, &id, "artifacts", &result.artifacts_changed.join(", "))?;
                    }
                    info!("{worker}: completed {id}");
                    Dispatch::Completed(id)
                }
                Err(e) if lost_claim(&e) => return Ok(Dispatch::Cancelled(id)),
                Err(e) => return Err(e),
            },
            Some(report) => {
                match recovery::record_failure(conn, &id, Some(worker), &report, &self.options.policy) {
                    Ok(RecoveryDecision::Retry { .. }) => Dispatch::Retried(id),
                    Ok(RecoveryDecision::Halt { .. }) => Dispatch::Halted(id),
                    Err(e) if lost_claim(&e) => return Ok(Dispatch::Cancelled(id)),
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(dispatch)
    }

    fn still_claimed(&self, conn: &Connection, id: &str, worker: &str) -> Result<bool> {
        let item = store::get(conn, id)?;
        Ok(item.status == Status::InProgress && item.claimed_by.as_deref() == Some(worker))
    }

    /// Markers are written for terminal outcomes only. A marker failure is
    /// logged, never fatal: the store already holds the outcome.
    fn write_marker(&self, dispatch: &Dispatch) {
        let Some(dir) = &self.options.marker_dir else {
            return;
        };
        let (id, status) = match dispatch {
            Dispatch::Completed(id) => (id, Status::Completed),
            Dispatch::Halted(id) => (id, Status::Halted),
            _ => return,
        };
        if let Err(e) = marker::write_once(dir, id, status) {
            warn!("failed to write marker for {id}: {e}");
        }
    }

    fn drained(&self, conn: &Connection) -> Result<bool> {
        let counts = store::count_by_status(conn)?;
        Ok(counts.get(&Status::InProgress).copied().unwrap_or(0) == 0)
    }

    fn idle_wait(&self) {
        let deadline = Instant::now() + self.options.poll_interval;
        while self.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(SLEEP_SLICE.min(self.options.poll_interval));
        }
    }

    fn worker_loop(&self, worker: &str) -> Result<RunSummary> {
        let conn = db::open(&self.db_path)?;
        let mut summary = RunSummary::default();
        info!("{worker}: started");

        while self.running.load(Ordering::SeqCst) {
            match self.run_once(&conn, worker) {
                Ok(Dispatch::Idle) => {
                    if self.options.exit_when_idle && self.drained(&conn)? {
                        break;
                    }
                    self.idle_wait();
                }
                Ok(dispatch) => summary.record(&dispatch),
                Err(e) => {
                    error!("{worker}: {e}");
                    self.idle_wait();
                }
            }
        }

        info!("{worker}: stopped ({summary:?})");
        Ok(summary)
    }

    /// Run a single worker until stopped (or drained, with `exit_when_idle`).
    pub fn run(&self) -> Result<RunSummary> {
        self.worker_loop(&worker_name(0))
    }

    /// Run `n` workers on scoped threads, each with its own connection.
    pub fn run_workers(&self, n: usize) -> Result<RunSummary> {
        let results: Vec<Result<RunSummary>> = thread::scope(|s| {
            let handles: Vec<_> = (0..n.max(1))
                .map(|w| s.spawn(move || self.worker_loop(&worker_name(w))))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut total = RunSummary::default();
        for result in results {
            total.merge(result?);
        }
        Ok(total)
    }
}

/// Unique across processes sharing one database.
fn worker_name(n: usize) -> String {
    format!("worker-{}-{n}", std::process::id())
}

fn lost_claim(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::ClaimConflict { .. } | EngineError::InvalidTransition { .. }
    )
}

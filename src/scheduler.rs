//! Bounded parallel execution with in-flight deduplication.
//!
//! ```text
//! caller A ─┐
//!           │                                         rayon pool
//! caller B ─┼──► in_flight: DashMap<hash, OnceLock> ──► (one run per hash)
//!           │         │                                    │
//! caller C ─┘         ▼                                    ▼
//!               [A, B, C all receive ◄──────────────── [result]
//!                the same result]
//! ```
//!
//! A [`Scheduler`] is shared process-wide behind an `Arc`. Every task carries
//! a [`ResourceHash`]. The first request for a hash registers a cell in the
//! in-flight table with the `DashMap` entry API (an atomic compare-and-insert)
//! and runs the task; any request for the same hash arriving while it runs
//! attaches to that cell and receives the same result without running again.
//! The leader removes the cell once the result is published.
//!
//! Work runs on a dedicated `rayon::ThreadPool`, so the pool size bounds how
//! many sources are decoded at once and with it peak memory. A task that
//! fails or panics produces a [`TaskError`] for its own hash only; sibling
//! tasks always run to completion.
//!
//! Task bodies must not call back into rayon. A worker blocked on another
//! worker's cell relies on that worker never stealing it.

use crate::hashing::ResourceHash;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rayon::prelude::*;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Anything the scheduler can deduplicate.
pub trait Task: Sync {
    fn resource_hash(&self) -> &ResourceHash;
}

/// Failure scoped to one task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{hash}: {message}")]
pub struct TaskError {
    pub hash: ResourceHash,
    pub message: String,
}

/// A successful run, possibly shared with other callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput<T> {
    pub value: T,
    /// True when this caller attached to a run started by someone else.
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<T> {
    pub hash: ResourceHash,
    pub outcome: Result<TaskOutput<T>, TaskError>,
}

/// Statistics for monitoring deduplication.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks submitted.
    pub total: u64,
    /// Tasks that attached to an in-flight run.
    pub coalesced: u64,
    /// Task bodies actually executed.
    pub executed: u64,
}

type Cell<T> = Arc<OnceLock<Result<T, TaskError>>>;

pub struct Scheduler<T> {
    pool: rayon::ThreadPool,
    threads: usize,
    in_flight: DashMap<ResourceHash, Cell<T>>,
    total: AtomicU64,
    coalesced: AtomicU64,
    executed: AtomicU64,
}

impl<T> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.threads)
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Clone + Send + Sync> Scheduler<T> {
    /// Create a scheduler with its own pool of `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("asset-worker-{i}"))
            .build()?;
        Ok(Self {
            pool,
            threads,
            in_flight: DashMap::new(),
            total: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        })
    }

    /// Run every task on the pool. Results come back in input order.
    ///
    /// Blocks until all tasks, including ones attached to runs started by
    /// other callers, have completed.
    pub fn execute<I, E, F>(&self, tasks: &[I], run: F) -> Vec<TaskResult<T>>
    where
        I: Task,
        E: fmt::Display,
        F: Fn(&I) -> Result<T, E> + Sync,
    {
        self.pool
            .install(|| tasks.par_iter().map(|task| self.run_one(task, &run)).collect())
    }

    fn run_one<I, E, F>(&self, task: &I, run: &F) -> TaskResult<T>
    where
        I: Task,
        E: fmt::Display,
        F: Fn(&I) -> Result<T, E> + Sync,
    {
        self.total.fetch_add(1, Ordering::Relaxed);
        let hash = task.resource_hash().clone();

        // Atomic check-and-insert; the shard lock is released before running
        let (cell, leader) = match self.in_flight.entry(hash.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let cell: Cell<T> = Arc::new(OnceLock::new());
                entry.insert(Arc::clone(&cell));
                (cell, true)
            }
        };
        if !leader {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %hash, "attaching to in-flight task");
        }

        let mut ran_here = false;
        let result = cell
            .get_or_init(|| {
                ran_here = true;
                self.executed.fetch_add(1, Ordering::Relaxed);
                guarded(&hash, || run(task))
            })
            .clone();

        if leader {
            self.in_flight
                .remove_if(&hash, |_, current| Arc::ptr_eq(current, &cell));
        }

        TaskResult {
            hash,
            outcome: result.map(|value| TaskOutput {
                value,
                coalesced: !ran_here,
            }),
        }
    }
}

impl<T> Scheduler<T> {
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Hashes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total: self.total.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
        }
    }
}

/// Run a task body, turning errors and panics into a [`TaskError`].
fn guarded<T, E: fmt::Display>(
    hash: &ResourceHash,
    body: impl FnOnce() -> Result<T, E>,
) -> Result<T, TaskError> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError {
            hash: hash.clone(),
            message: e.to_string(),
        }),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(hash = %hash, panic = %message, "task panicked");
            Err(TaskError {
                hash: hash.clone(),
                message: format!("panicked: {message}"),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Worker pools
//!
//! - [`ClosedPool`]: ramping workers, the stage target is a worker count
//! - [`OpenPool`]: ramping arrival rate over a fixed pre-allocated pool
//!
//! Both drain cooperatively: a worker always finishes the iteration it is
//! in. `run` returns only after every worker has stopped.

mod closed;
mod open;

pub use closed::{ClosedPool, ClosedPoolConfig};
pub use open::{OpenPool, OpenPoolConfig};

use crate::scenario::ScenarioExecutor;
use festload_core::{EventBus, MetricSink, RunEvent, StageSchedule, WorkerStatus};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a pool needs from the run.
#[derive(Clone)]
pub struct PoolContext {
    pub executor: Arc<ScenarioExecutor>,
    pub sink: MetricSink,
    pub events: EventBus,
    /// Stops scheduling: no new iterations start, in-flight ones finish.
    pub cancel: CancellationToken,
    /// Longest wait for in-flight iterations once draining; `None` waits.
    pub graceful_stop: Option<Duration>,
}

/// What a pool did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSummary {
    /// Iterations that ran to completion
    pub iterations: u64,
    /// Open model: iteration starts dropped for lack of an idle worker
    pub dropped: u64,
    /// Iterations cut off by `graceful_stop`
    pub interrupted: u64,
    /// Largest number of workers active at once
    pub peak_workers: usize,
    /// Pool run time, first tick to last worker stopped
    #[serde(with = "festload_core::stage::duration_str")]
    pub elapsed: Duration,
    /// When the last worker stopped
    #[serde(skip)]
    pub last_worker_stopped: Option<Instant>,
}

/// Per-worker state shared between a worker task and its controller.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    status: AtomicU8,
}

impl WorkerSlot {
    pub(crate) fn new(status: WorkerStatus) -> Self {
        Self {
            status: AtomicU8::new(status.as_u8()),
        }
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, status: WorkerStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    /// Move `from -> to`; on failure returns the status actually found.
    pub(crate) fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> Result<(), WorkerStatus> {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(WorkerStatus::from_u8)
    }
}

/// Counters every worker of a pool writes to.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    iterations: AtomicU64,
    last_stop: Mutex<Option<Instant>>,
}

impl PoolCounters {
    pub(crate) fn iteration_done(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_stopped(&self) {
        let now = Instant::now();
        let mut last = self.last_stop.lock();
        if last.map_or(true, |t| now > t) {
            *last = Some(now);
        }
    }

    pub(crate) fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub(crate) fn last_stop(&self) -> Option<Instant> {
        *self.last_stop.lock()
    }
}

/// Tracks stage transitions for `StageStarted` events.
pub(crate) struct StageTracker<'a> {
    schedule: &'a StageSchedule,
    current: Option<usize>,
}

impl<'a> StageTracker<'a> {
    pub(crate) fn new(schedule: &'a StageSchedule) -> Self {
        Self {
            schedule,
            current: None,
        }
    }

    pub(crate) fn observe(&mut self, stage: Option<usize>, events: &EventBus) {
        let Some(index) = stage else { return };
        if self.current == Some(index) {
            return;
        }
        // Zero-duration stages are skipped over by sampling; announce them too.
        let first = self.current.map_or(0, |c| c + 1);
        for i in first..=index {
            let spec = self.schedule.stages()[i];
            info!(stage = i, target = spec.target, duration = %festload_core::DisplayDuration(spec.duration), "Stage started");
            events.publish(RunEvent::StageStarted {
                index: i,
                target: spec.target,
                duration: spec.duration,
            });
        }
        self.current = Some(index);
    }
}

/// Wait for every worker, aborting stragglers after `graceful_stop`.
/// Returns how many workers were aborted mid-iteration.
///
/// Aborted workers are awaited too, so none outlives the pool.
pub(crate) async fn join_workers(
    handles: Vec<JoinHandle<()>>,
    graceful_stop: Option<Duration>,
) -> u64 {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let joined = join_all(handles);
    tokio::pin!(joined);

    let results = match graceful_stop {
        None => joined.await,
        Some(limit) => match tokio::time::timeout(limit, &mut joined).await {
            Ok(results) => results,
            Err(_) => {
                let stragglers = aborts.iter().filter(|a| !a.is_finished()).count();
                warn!(
                    stragglers,
                    graceful_stop = %festload_core::DisplayDuration(limit),
                    "Graceful stop exceeded, interrupting iterations"
                );
                for abort in &aborts {
                    abort.abort();
                }
                joined.await
            }
        },
    };

    let mut interrupted = 0;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => interrupted += 1,
            Err(e) => warn!(error = %e, "Worker panicked"),
        }
    }
    interrupted
}

/// Mark every slot an aborted worker left behind as Stopped.
/// Returns how many there were.
pub(crate) fn settle_slots(slots: &[WorkerSlot]) -> usize {
    let mut settled = 0;
    for (index, slot) in slots.iter().enumerate() {
        let status = slot.status();
        if status != WorkerStatus::Stopped {
            debug!(slot = index, %status, "Slot left behind by an aborted worker");
            slot.store(WorkerStatus::Stopped);
            settled += 1;
        }
    }
    settled
}

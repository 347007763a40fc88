//! Open model: iteration starts follow the stage rate, independent of how
//! long iterations take.
//!
//! A fixed set of pre-allocated workers waits Idle. Every `tick` the
//! dispatcher adds `rate * dt / time_unit` to a fractional carry and hands
//! one start to an Idle worker per whole unit. When no worker is Idle the
//! start is dropped and counted in `dropped_iterations`.

use super::{
    join_workers, settle_slots, PoolContext, PoolCounters, PoolSummary, StageTracker, WorkerSlot,
};
use festload_core::{names, RunEvent, StageSchedule, WorkerStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Open pool settings.
#[derive(Debug, Clone)]
pub struct OpenPoolConfig {
    pub schedule: StageSchedule,
    /// Stage targets are iteration starts per `time_unit`
    pub time_unit: Duration,
    /// Workers allocated up front; the pool never grows past this
    pub pre_allocated_workers: usize,
    /// Dispatcher interval
    pub tick: Duration,
}

/// Ramping-arrival-rate pool.
pub struct OpenPool {
    config: OpenPoolConfig,
}

struct Worker {
    start: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl OpenPool {
    pub fn new(config: OpenPoolConfig) -> Self {
        Self { config }
    }

    /// Dispatch iteration starts through every stage, then drain.
    pub async fn run(self, ctx: PoolContext) -> PoolSummary {
        let size = self.config.pre_allocated_workers;
        let slots: Arc<Vec<WorkerSlot>> = Arc::new(
            (0..size)
                .map(|_| WorkerSlot::new(WorkerStatus::Idle))
                .collect(),
        );
        // Idle worker ids; lowest id on top.
        let idle = Arc::new(Mutex::new((0..size).rev().collect::<Vec<_>>()));
        let counters = Arc::new(PoolCounters::default());

        let workers: Vec<Worker> = (0..size)
            .map(|index| spawn_worker(index, &slots, &idle, &counters, &ctx))
            .collect();

        ctx.sink.set_gauge(names::VUS_MAX, size as f64);
        ctx.sink.set_gauge(names::VUS, 0.0);

        let schedule = &self.config.schedule;
        let unit = self.config.time_unit.as_secs_f64();
        let mut stages = StageTracker::new(schedule);
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            pre_allocated = size,
            stages = %schedule.description(),
            "Starting open-model pool"
        );

        let started = Instant::now();
        let mut last = Duration::ZERO;
        let mut last_rate = schedule.sample(Duration::ZERO).target;
        let mut carry = 0.0f64;
        let mut dropped = 0u64;
        let mut peak = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    info!("Pool cancelled, draining");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = started.elapsed();
            let sample = schedule.sample(elapsed);
            if sample.drain_requested {
                ctx.events.publish(RunEvent::DrainRequested { elapsed });
                break;
            }
            stages.observe(sample.stage, &ctx.events);

            // Trapezoid over the tick so ramps integrate exactly.
            let dt = (elapsed - last).as_secs_f64();
            carry += (last_rate + sample.target) / 2.0 * dt / unit;
            last = elapsed;
            last_rate = sample.target;

            while carry >= 1.0 {
                carry -= 1.0;
                let claimed = idle.lock().pop();
                match claimed {
                    Some(id) => {
                        if workers[id].start.try_send(()).is_err() {
                            // The worker is gone; its slot never returns.
                            dropped += 1;
                            ctx.sink.increment_counter(names::DROPPED_ITERATIONS, 1);
                        }
                    }
                    None => {
                        dropped += 1;
                        ctx.sink.increment_counter(names::DROPPED_ITERATIONS, 1);
                    }
                }
            }

            let busy = size - idle.lock().len();
            peak = peak.max(busy);
            ctx.sink.set_gauge(names::VUS, busy as f64);
        }

        if dropped > 0 {
            warn!(dropped, "Iterations dropped: no idle worker");
        }

        let (senders, handles): (Vec<_>, Vec<_>) =
            workers.into_iter().map(|w| (w.start, w.handle)).unzip();
        drop(senders);

        let interrupted = join_workers(handles, ctx.graceful_stop).await;
        if settle_slots(&slots) > 0 {
            counters.worker_stopped();
        }
        ctx.sink.set_gauge(names::VUS, 0.0);

        let summary = PoolSummary {
            iterations: counters.iterations(),
            dropped,
            interrupted,
            peak_workers: peak,
            elapsed: started.elapsed(),
            last_worker_stopped: counters.last_stop(),
        };
        ctx.events.publish(RunEvent::PoolStopped {
            iterations: summary.iterations,
            dropped,
        });
        summary
    }
}

fn spawn_worker(
    index: usize,
    slots: &Arc<Vec<WorkerSlot>>,
    idle: &Arc<Mutex<Vec<usize>>>,
    counters: &Arc<PoolCounters>,
    ctx: &PoolContext,
) -> Worker {
    let (start, mut rx) = mpsc::channel::<()>(1);
    let slots = Arc::clone(slots);
    let idle = Arc::clone(idle);
    let counters = Arc::clone(counters);
    let executor = Arc::clone(&ctx.executor);
    let worker_index = index + 1;

    let handle = tokio::spawn(async move {
        let slot = &slots[index];
        while rx.recv().await.is_some() {
            slot.store(WorkerStatus::Running);
            match executor.run_iteration(worker_index).await {
                Ok(_) => counters.iteration_done(),
                Err(e) => debug!(worker = worker_index, error = %e, "Iteration not run"),
            }
            slot.store(WorkerStatus::Idle);
            idle.lock().push(index);
        }
        slot.store(WorkerStatus::Stopped);
        counters.worker_stopped();
    });

    Worker { start, handle }
}

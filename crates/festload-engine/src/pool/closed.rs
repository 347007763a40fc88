//! Closed model: the number of concurrently looping workers follows the
//! stage target.
//!
//! Slots are allocated up front, one per possible worker. A slot is owned by
//! its worker task except for two controller transitions:
//!
//! - shrink: `Running -> Draining` (highest slot first)
//! - grow: `Draining -> Running`, or respawn when the slot is `Stopped`
//!
//! A worker checks `Draining -> Stopped` before each iteration and exits when
//! that succeeds. Because both sides use compare-and-swap, a revived worker
//! never exits and an exiting worker is always respawned.

use super::{
    join_workers, settle_slots, PoolContext, PoolCounters, PoolSummary, StageTracker, WorkerSlot,
};
use festload_core::{names, RunEvent, StageSchedule, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Closed pool settings.
#[derive(Debug, Clone)]
pub struct ClosedPoolConfig {
    pub schedule: StageSchedule,
    /// Hard ceiling on concurrent workers
    pub max_workers: usize,
    /// Controller resize interval
    pub tick: Duration,
}

/// Ramping-workers pool.
pub struct ClosedPool {
    config: ClosedPoolConfig,
    slots: Arc<Vec<WorkerSlot>>,
    counters: Arc<PoolCounters>,
    handles: Vec<JoinHandle<()>>,
    // Slots `0..active` are Running or revived; the rest are Draining or Stopped.
    active: usize,
    peak: usize,
}

impl ClosedPool {
    pub fn new(config: ClosedPoolConfig) -> Self {
        let slots = (0..config.max_workers)
            .map(|_| WorkerSlot::new(WorkerStatus::Stopped))
            .collect();

        Self {
            config,
            slots: Arc::new(slots),
            counters: Arc::new(PoolCounters::default()),
            handles: Vec::new(),
            active: 0,
            peak: 0,
        }
    }

    /// Drive the pool through every stage, then drain it.
    pub async fn run(mut self, ctx: PoolContext) -> PoolSummary {
        let started = Instant::now();
        let schedule = self.config.schedule.clone();
        let mut stages = StageTracker::new(&schedule);
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        ctx.sink.set_gauge(names::VUS_MAX, self.config.max_workers as f64);
        info!(
            max_workers = self.config.max_workers,
            stages = %schedule.description(),
            "Starting closed-model pool"
        );

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

            let desired = (sample.target.floor() as usize).min(self.config.max_workers);
            self.resize(desired, sample.target, &ctx);
        }

        self.resize(0, 0.0, &ctx);

        let handles = std::mem::take(&mut self.handles);
        let interrupted = join_workers(handles, ctx.graceful_stop).await;
        if settle_slots(&self.slots) > 0 {
            self.counters.worker_stopped();
        }

        let summary = PoolSummary {
            iterations: self.counters.iterations(),
            dropped: 0,
            interrupted,
            peak_workers: self.peak,
            elapsed: started.elapsed(),
            last_worker_stopped: self.counters.last_stop(),
        };
        ctx.events.publish(RunEvent::PoolStopped {
            iterations: summary.iterations,
            dropped: 0,
        });
        summary
    }

    fn resize(&mut self, desired: usize, target: f64, ctx: &PoolContext) {
        if desired == self.active {
            return;
        }
        let from = self.active;

        while self.active < desired {
            self.grow(ctx);
        }
        while self.active > desired {
            self.active -= 1;
            // Only Running can be found here; the transition is a no-op otherwise.
            let _ = self.slots[self.active].transition(WorkerStatus::Running, WorkerStatus::Draining);
        }

        self.peak = self.peak.max(self.active);
        ctx.sink.set_gauge(names::VUS, self.active as f64);
        debug!(from, to = self.active, target, "Pool resized");
        ctx.events.publish(RunEvent::PoolResized {
            from,
            to: self.active,
            target,
        });
    }

    fn grow(&mut self, ctx: &PoolContext) {
        let index = self.active;
        let slot = &self.slots[index];

        match slot.transition(WorkerStatus::Draining, WorkerStatus::Running) {
            Ok(()) => {}
            Err(WorkerStatus::Stopped) => {
                slot.store(WorkerStatus::Running);
                let handle = self.spawn_worker(index, ctx);
                self.handles.retain(|h| !h.is_finished());
                self.handles.push(handle);
            }
            Err(other) => {
                debug!(slot = index, status = %other, "Unexpected slot status on grow");
            }
        }
        self.active += 1;
    }

    fn spawn_worker(&self, index: usize, ctx: &PoolContext) -> JoinHandle<()> {
        let slots = Arc::clone(&self.slots);
        let counters = Arc::clone(&self.counters);
        let executor = Arc::clone(&ctx.executor);
        let worker_index = index + 1;

        tokio::spawn(async move {
            let slot = &slots[index];
            loop {
                if slot
                    .transition(WorkerStatus::Draining, WorkerStatus::Stopped)
                    .is_ok()
                {
                    break;
                }
                if let Err(e) = executor.run_iteration(worker_index).await {
                    debug!(worker = worker_index, error = %e, "Worker giving up");
                    slot.store(WorkerStatus::Stopped);
                    break;
                }
                counters.iteration_done();
            }
            counters.worker_stopped();
            debug!(worker = worker_index, "Worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{ScenarioExecutor, ScenarioProfile};
    use crate::target::MockTargetService;
    use festload_core::{
        ConflictPolicy, Credential, EventBus, MetricSink, SharedContext, StageSpec,
    };
    use tokio_util::sync::CancellationToken;

    fn context(mock: MockTargetService, events: EventBus, cancel: CancellationToken) -> PoolContext {
        slow_context(mock, events, cancel, Duration::from_millis(200))
    }

    fn slow_context(
        mock: MockTargetService,
        events: EventBus,
        cancel: CancellationToken,
        think_time: Duration,
    ) -> PoolContext {
        let shared = SharedContext::new(
            1,
            (1..=10)
                .map(|i| Credential::new(format!("u{}", i), format!("t{}", i)))
                .collect(),
        );
        let sink = MetricSink::new();
        let profile = ScenarioProfile {
            conflict_policy: ConflictPolicy::Tolerate,
            think_time,
            position_polls: 0,
            poll_interval: Duration::ZERO,
            trailing_think_time: Duration::ZERO,
        };
        PoolContext {
            executor: Arc::new(ScenarioExecutor::new(
                Arc::new(mock),
                Arc::new(shared),
                sink.clone(),
                profile,
            )),
            sink,
            events,
            cancel,
            graceful_stop: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_transitions_are_exclusive() {
        let slot = WorkerSlot::new(WorkerStatus::Running);

        assert!(slot.transition(WorkerStatus::Running, WorkerStatus::Draining).is_ok());
        // Controller revives before the worker checks in.
        assert!(slot.transition(WorkerStatus::Draining, WorkerStatus::Running).is_ok());
        assert_eq!(slot.status(), WorkerStatus::Running);
        assert_eq!(
            slot.transition(WorkerStatus::Draining, WorkerStatus::Stopped),
            Err(WorkerStatus::Running)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_follows_target_within_ceiling() {
        let mock = MockTargetService::new();
        let events = EventBus::new(4096);
        let mut rx = events.subscribe();
        let schedule = StageSchedule::new(
            0.0,
            vec![
                StageSpec::new(Duration::from_secs(2), 8.0),
                StageSpec::new(Duration::from_secs(2), 8.0),
                StageSpec::new(Duration::from_secs(1), 0.0),
            ],
        )
        .unwrap();
        let pool = ClosedPool::new(ClosedPoolConfig {
            schedule: schedule.clone(),
            max_workers: 5,
            tick: Duration::from_millis(100),
        });

        let summary = pool
            .run(context(mock.clone(), events, CancellationToken::new()))
            .await;

        assert!(summary.iterations > 0);
        assert_eq!(summary.peak_workers, 5);
        assert!(mock.peak_in_flight() <= 5);

        while let Ok(event) = rx.try_recv() {
            if let RunEvent::PoolResized { to, target, .. } = event {
                assert!(to <= 5);
                assert_eq!(to, (target.floor() as usize).min(5));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_without_new_iterations() {
        let mock = MockTargetService::new();
        let cancel = CancellationToken::new();
        let schedule =
            StageSchedule::new(3.0, vec![StageSpec::new(Duration::from_secs(60), 3.0)]).unwrap();
        let pool = ClosedPool::new(ClosedPoolConfig {
            schedule,
            max_workers: 3,
            tick: Duration::from_millis(100),
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let summary = pool
            .run(context(mock.clone(), EventBus::default(), cancel))
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        let last_stop = summary.last_worker_stopped.unwrap();
        assert!(mock.last_call("enqueue").unwrap() < last_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_interrupts_long_iterations() {
        let mock = MockTargetService::new();
        let mut ctx = slow_context(
            mock.clone(),
            EventBus::default(),
            CancellationToken::new(),
            Duration::from_secs(100),
        );
        ctx.graceful_stop = Some(Duration::from_secs(1));
        let executor = Arc::clone(&ctx.executor);
        let schedule =
            StageSchedule::new(2.0, vec![StageSpec::new(Duration::from_secs(1), 2.0)]).unwrap();
        let pool = ClosedPool::new(ClosedPoolConfig {
            schedule,
            max_workers: 2,
            tick: Duration::from_millis(100),
        });

        let started = Instant::now();
        let summary = pool.run(ctx).await;

        assert_eq!(summary.interrupted, 2);
        assert_eq!(summary.iterations, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.last_worker_stopped.is_some());
        assert_eq!(mock.calls("enqueue"), 2);
        // Aborted workers no longer hold the executor.
        assert_eq!(Arc::strong_count(&executor), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regrow_forgets_finished_workers() {
        let ctx = context(MockTargetService::new(), EventBus::default(), CancellationToken::new());
        let schedule =
            StageSchedule::new(0.0, vec![StageSpec::new(Duration::from_secs(1), 0.0)]).unwrap();
        let mut pool = ClosedPool::new(ClosedPoolConfig {
            schedule,
            max_workers: 2,
            tick: Duration::from_millis(100),
        });

        for _ in 0..5 {
            pool.resize(2, 2.0, &ctx);
            pool.resize(0, 0.0, &ctx);
            // Long enough for both workers to finish their iteration and exit.
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(pool.slots.iter().all(|s| s.status() == WorkerStatus::Stopped));
        }
        pool.resize(2, 2.0, &ctx);

        assert_eq!(pool.handles.len(), 2);

        pool.resize(0, 0.0, &ctx);
        let handles = std::mem::take(&mut pool.handles);
        assert_eq!(join_workers(handles, None).await, 0);
    }
}

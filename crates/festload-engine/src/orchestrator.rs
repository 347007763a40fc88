//! Load test orchestrator
//!
//! Setup -> worker pool -> drain barrier -> teardown -> threshold evaluation.

use crate::error::{RunError, RunResult};
use crate::lifecycle::{Lifecycle, SetupSummary, TeardownSummary};
use crate::pool::{ClosedPool, ClosedPoolConfig, OpenPool, OpenPoolConfig, PoolContext, PoolSummary};
use crate::scenario::{ScenarioExecutor, ScenarioProfile};
use crate::target::TargetService;
use chrono::{DateTime, Utc};
use festload_core::{
    AbortReason, EventBus, ExecutorConfig, LoadTestConfig, MetricSink, MetricsSnapshot, RunEvent,
    ThresholdOutcome, ThresholdSet,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything known about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub setup: SetupSummary,
    pub pool: PoolSummary,
    pub teardown: TeardownSummary,
    pub metrics: MetricsSnapshot,
    pub thresholds: Vec<ThresholdOutcome>,
    pub aborted: Option<AbortReason>,
    /// When teardown issued its first call
    pub teardown_started: Instant,
}

impl RunReport {
    /// True when every threshold passed.
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    pub fn interrupted(&self) -> bool {
        matches!(self.aborted, Some(AbortReason::Interrupted))
    }

    /// Scheduled test time, excluding setup and teardown.
    pub fn test_duration(&self) -> Duration {
        self.pool.elapsed
    }
}

/// Runs one configured load test against a target.
pub struct LoadTestOrchestrator {
    config: LoadTestConfig,
    target: Arc<dyn TargetService>,
    events: EventBus,
    cancel: CancellationToken,
}

impl LoadTestOrchestrator {
    pub fn new(config: LoadTestConfig, target: Arc<dyn TargetService>) -> Self {
        Self {
            config,
            target,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Cancelling `cancel` interrupts the run; teardown still runs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    /// Run the load test to completion.
    ///
    /// Fails before any worker starts when setup issues no credential.
    pub async fn run(&self) -> RunResult<RunReport> {
        let thresholds = ThresholdSet::compile(self.config.threshold_specs())?;
        let schedule = self.config.schedule()?;
        let max_workers = self.config.scenario.executor.max_workers()?;
        let started_at = Utc::now();

        info!(
            scenario = %self.config.scenario.name,
            target = %self.config.target.base_url,
            booth_id = self.config.target.booth_id,
            thresholds = thresholds.len(),
            "Starting load test"
        );

        let lifecycle = Lifecycle::new(Arc::clone(&self.target), self.events.clone());
        let (context, setup) = lifecycle
            .setup(
                &self.config.identities,
                self.config.target.booth_id,
                &self.cancel,
            )
            .await?;
        let context = Arc::new(context);

        let sink = MetricSink::new();
        let run_cancel = self.cancel.child_token();
        let abort: Arc<Mutex<Option<AbortReason>>> = Arc::new(Mutex::new(None));

        let watcher = if thresholds.has_abort_on_fail() {
            Some(tokio::spawn(watch_thresholds(
                thresholds.clone(),
                sink.clone(),
                self.config.run.threshold_eval_interval,
                run_cancel.clone(),
                Arc::clone(&abort),
                self.events.clone(),
            )))
        } else {
            None
        };

        let pool_ctx = PoolContext {
            executor: Arc::new(ScenarioExecutor::new(
                Arc::clone(&self.target),
                Arc::clone(&context),
                sink.clone(),
                ScenarioProfile::from(&self.config.scenario),
            )),
            sink: sink.clone(),
            events: self.events.clone(),
            cancel: run_cancel.clone(),
            graceful_stop: self.config.run.graceful_stop,
        };

        let pool = if self.cancel.is_cancelled() {
            PoolSummary::default()
        } else {
            match &self.config.scenario.executor {
                ExecutorConfig::RampingVus { tick, .. } => {
                    ClosedPool::new(ClosedPoolConfig {
                        schedule,
                        max_workers,
                        tick: *tick,
                    })
                    .run(pool_ctx)
                    .await
                }
                ExecutorConfig::RampingArrivalRate {
                    time_unit,
                    pre_allocated_workers,
                    tick,
                    ..
                } => {
                    OpenPool::new(OpenPoolConfig {
                        schedule,
                        time_unit: *time_unit,
                        pre_allocated_workers: *pre_allocated_workers,
                        tick: *tick,
                    })
                    .run(pool_ctx)
                    .await
                }
            }
        };

        if let Some(handle) = watcher {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    return Err(RunError::Join(e));
                }
            }
        }

        let mut aborted = abort.lock().take();
        if aborted.is_none() && self.cancel.is_cancelled() {
            warn!("Run interrupted");
            self.events.publish(RunEvent::RunAborted {
                reason: AbortReason::Interrupted,
            });
            aborted = Some(AbortReason::Interrupted);
        }

        // Every worker has stopped: the pool joined all of them.
        let teardown_started = Instant::now();
        let teardown = lifecycle
            .teardown(&context, self.config.identities.login_batch_size)
            .await;

        let metrics = sink.snapshot();
        let outcomes = thresholds.evaluate(&metrics, pool.elapsed);
        for outcome in outcomes.iter().filter(|o| !o.passed) {
            warn!(
                metric = %outcome.metric,
                expression = %outcome.expression,
                observed = ?outcome.observed,
                "Threshold failed"
            );
        }

        Ok(RunReport {
            scenario: self.config.scenario.name.clone(),
            started_at,
            finished_at: Utc::now(),
            setup,
            pool,
            teardown,
            metrics,
            thresholds: outcomes,
            aborted,
            teardown_started,
        })
    }
}

async fn watch_thresholds(
    thresholds: ThresholdSet,
    sink: MetricSink,
    every: Duration,
    run_cancel: CancellationToken,
    abort: Arc<Mutex<Option<AbortReason>>>,
    events: EventBus,
) {
    let started = Instant::now();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = run_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Some(breach) = thresholds.abort_breach(&sink.snapshot(), started.elapsed()) {
            warn!(
                metric = %breach.metric,
                expression = %breach.expression,
                observed = ?breach.observed,
                "Threshold breached, aborting run"
            );
            let reason = AbortReason::ThresholdBreached {
                metric: breach.metric,
                expression: breach.expression,
            };
            *abort.lock() = Some(reason.clone());
            events.publish(RunEvent::RunAborted { reason });
            run_cancel.cancel();
            return;
        }
    }
}

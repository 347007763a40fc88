//! Scenario executor: one iteration of the waiting-queue journey
//!
//! enqueue -> think -> position check (xN, paused) -> trailing think.
//! Every call feeds the scenario metrics plus the built-in `http_*`
//! metrics; every check feeds `checks`. Transport failures and timeouts are
//! failed checks, never fatal.

use crate::error::{LifecycleError, TargetError};
use crate::target::{EnqueueResult, PositionResult, TargetService};
use festload_core::{
    names, ConflictPolicy, Credential, IterationResult, MetricSink, ScenarioConfig, SharedContext,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CHECK_ENQUEUE_CREATED: &str = "enqueue: status is 201";
pub const CHECK_ENQUEUE_POSITION: &str = "enqueue: has position";
pub const CHECK_ENQUEUE_ACCEPTED: &str = "enqueue: status is 201 or 409";
pub const CHECK_POSITION_OK: &str = "position: status is 200";
pub const CHECK_POSITION_FIELD: &str = "position: has position field";

/// What one iteration does.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioProfile {
    pub conflict_policy: ConflictPolicy,
    pub think_time: Duration,
    pub position_polls: u32,
    pub poll_interval: Duration,
    pub trailing_think_time: Duration,
}

impl From<&ScenarioConfig> for ScenarioProfile {
    fn from(config: &ScenarioConfig) -> Self {
        Self {
            conflict_policy: config.conflict_policy,
            think_time: config.think_time,
            position_polls: config.position_polls,
            poll_interval: config.poll_interval,
            trailing_think_time: config.trailing_think_time,
        }
    }
}

/// Runs iterations against the target and records their outcome.
pub struct ScenarioExecutor {
    target: Arc<dyn TargetService>,
    context: Arc<SharedContext>,
    sink: MetricSink,
    profile: ScenarioProfile,
}

impl ScenarioExecutor {
    pub fn new(
        target: Arc<dyn TargetService>,
        context: Arc<SharedContext>,
        sink: MetricSink,
        profile: ScenarioProfile,
    ) -> Self {
        Self {
            target,
            context,
            sink,
            profile,
        }
    }

    pub fn profile(&self) -> &ScenarioProfile {
        &self.profile
    }

    /// Run one iteration for 1-based `worker_index`.
    ///
    /// Fails fast with [`LifecycleError::NoCredentials`] when setup issued no
    /// credential; that attempt is counted in `enqueue_fail`.
    pub async fn run_iteration(
        &self,
        worker_index: usize,
    ) -> Result<Vec<IterationResult>, LifecycleError> {
        let credential = match self.context.credential_for(worker_index) {
            Some(credential) => credential,
            None => {
                self.sink.increment_counter(names::ENQUEUE_FAIL, 1);
                return Err(LifecycleError::NoCredentials { attempted: 0 });
            }
        };

        let started = Instant::now();
        let mut results = Vec::with_capacity(1 + self.profile.position_polls as usize);

        results.push(self.enqueue(credential).await);
        pause(self.profile.think_time).await;

        for _ in 0..self.profile.position_polls {
            results.push(self.check_position(credential).await);
            pause(self.profile.poll_interval).await;
        }

        pause(self.profile.trailing_think_time).await;

        self.sink.increment_counter(names::ITERATIONS, 1);
        self.sink
            .observe_trend(names::ITERATION_DURATION, elapsed_ms(started));

        Ok(results)
    }

    async fn enqueue(&self, credential: &Credential) -> IterationResult {
        let booth_id = self.context.booth_id();
        let started = Instant::now();
        let outcome = self.target.enqueue(&credential.token, booth_id).await;
        let latency_ms = elapsed_ms(started);

        self.sink.observe_trend(names::ENQUEUE_LATENCY, latency_ms);
        self.record_request(latency_ms, outcome.as_ref().ok().map(EnqueueResult::status));

        let result = IterationResult::new("enqueue", latency_ms);
        let result = match self.profile.conflict_policy {
            ConflictPolicy::Fail => {
                let created = matches!(outcome, Ok(EnqueueResult::Created { .. }));
                let has_position = matches!(
                    &outcome,
                    Ok(EnqueueResult::Created { position }) if position.is_present()
                );
                result
                    .with_check(CHECK_ENQUEUE_CREATED, created)
                    .with_check(CHECK_ENQUEUE_POSITION, has_position)
            }
            ConflictPolicy::Tolerate => {
                let accepted = matches!(
                    outcome,
                    Ok(EnqueueResult::Created { .. }) | Ok(EnqueueResult::Conflict)
                );
                result.with_check(CHECK_ENQUEUE_ACCEPTED, accepted)
            }
        };

        match &outcome {
            Ok(EnqueueResult::Conflict) => {
                debug!(identity = %credential.identity, "Enqueue conflict: already registered");
            }
            Ok(EnqueueResult::Error { status })
                if *status >= 500 && self.profile.conflict_policy == ConflictPolicy::Tolerate =>
            {
                warn!(identity = %credential.identity, status, "Enqueue server error");
            }
            Ok(_) => {}
            Err(e) => log_transport_failure(&credential.identity, e),
        }

        let success = result.passed();
        self.record_checks(&result);
        self.sink.increment_counter(
            if success {
                names::ENQUEUE_SUCCESS
            } else {
                names::ENQUEUE_FAIL
            },
            1,
        );
        self.sink.observe_rate(names::ERROR_RATE, !success);

        result
    }

    async fn check_position(&self, credential: &Credential) -> IterationResult {
        let started = Instant::now();
        let outcome = self
            .target
            .position(&credential.token, self.context.booth_id())
            .await;
        let latency_ms = elapsed_ms(started);

        self.sink.observe_trend(names::POSITION_LATENCY, latency_ms);
        self.record_request(latency_ms, outcome.as_ref().ok().map(PositionResult::status));

        let ok = matches!(outcome, Ok(PositionResult::Found { .. }));
        let has_field = outcome
            .as_ref()
            .map(PositionResult::has_position_field)
            .unwrap_or(false);
        if let Err(e) = &outcome {
            log_transport_failure(&credential.identity, e);
        }

        let result = IterationResult::new("position", latency_ms)
            .with_check(CHECK_POSITION_OK, ok)
            .with_check(CHECK_POSITION_FIELD, has_field);

        self.record_checks(&result);
        self.sink.increment_counter(
            if result.passed() {
                names::POSITION_SUCCESS
            } else {
                names::POSITION_FAIL
            },
            1,
        );

        result
    }

    // `status` is `None` when no response arrived.
    fn record_request(&self, latency_ms: f64, status: Option<u16>) {
        let failed = status.map_or(true, |s| !(200..400).contains(&s));

        self.sink.increment_counter(names::HTTP_REQS, 1);
        self.sink.observe_trend(names::HTTP_REQ_DURATION, latency_ms);
        self.sink.observe_rate(names::HTTP_REQ_FAILED, failed);
    }

    fn record_checks(&self, result: &IterationResult) {
        for passed in result.checks.values() {
            self.sink.observe_rate(names::CHECKS, *passed);
        }
    }
}

fn log_transport_failure(identity: &str, error: &TargetError) {
    if error.is_timeout() {
        debug!(identity, error = %error, "Request timed out");
    } else {
        warn!(identity, error = %error, "Request failed");
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{BodyField, MockResponse, MockTargetService};

    fn ramp_profile() -> ScenarioProfile {
        ScenarioProfile {
            conflict_policy: ConflictPolicy::Fail,
            think_time: Duration::from_secs(1),
            position_polls: 3,
            poll_interval: Duration::from_millis(500),
            trailing_think_time: Duration::from_secs(1),
        }
    }

    fn executor(mock: MockTargetService, credentials: usize, profile: ScenarioProfile) -> (ScenarioExecutor, MetricSink) {
        let context = SharedContext::new(
            1,
            (1..=credentials)
                .map(|i| Credential::new(format!("user{}", i), format!("token{}", i)))
                .collect(),
        );
        let sink = MetricSink::new();
        let executor = ScenarioExecutor::new(Arc::new(mock), Arc::new(context), sink.clone(), profile);
        (executor, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_iteration_records_every_metric() {
        let (executor, sink) = executor(MockTargetService::new(), 1, ramp_profile());

        let results = executor.run_iteration(1).await.unwrap();
        let snapshot = sink.snapshot();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(IterationResult::passed));
        assert_eq!(snapshot.counter(names::ENQUEUE_SUCCESS), 1);
        assert_eq!(snapshot.counter(names::POSITION_SUCCESS), 3);
        assert_eq!(snapshot.counter(names::HTTP_REQS), 4);
        assert_eq!(snapshot.counter(names::ITERATIONS), 1);
        assert_eq!(snapshot.rate(names::HTTP_REQ_FAILED), 0.0);
        assert_eq!(snapshot.rate(names::CHECKS), 1.0);

        // 4 calls at 10ms + 1s + 3 x 500ms + 1s
        let duration = snapshot.trend(names::ITERATION_DURATION).unwrap().max();
        assert!(duration >= 3540.0, "iteration took {}ms", duration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_failed_check() {
        let mock = MockTargetService::new()
            .with_enqueue_script(vec![MockResponse::Timeout])
            .with_position_script(vec![MockResponse::Transport("connection reset")]);
        let (executor, sink) = executor(mock, 1, ramp_profile());

        let results = executor.run_iteration(1).await.unwrap();
        let snapshot = sink.snapshot();

        assert!(!results[0].passed());
        assert!(!results[1].passed());
        assert_eq!(snapshot.counter(names::ENQUEUE_FAIL), 1);
        assert_eq!(snapshot.counter(names::POSITION_FAIL), 1);
        assert_eq!(snapshot.counter(names::POSITION_SUCCESS), 2);
        assert_eq!(snapshot.rate(names::HTTP_REQ_FAILED), 0.5);
        assert_eq!(snapshot.rate(names::ERROR_RATE), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_position_field_fails_check() {
        let mock = MockTargetService::new()
            .with_enqueue_script(vec![MockResponse::Reply(EnqueueResult::Created {
                position: BodyField::Absent,
            })])
            .with_position_script(vec![MockResponse::Reply(PositionResult::Found {
                position: BodyField::Absent,
                message: BodyField::Absent,
            })]);
        let (executor, sink) = executor(mock, 1, ramp_profile());

        let results = executor.run_iteration(1).await.unwrap();

        assert_eq!(results[0].checks[CHECK_ENQUEUE_CREATED], true);
        assert_eq!(results[0].checks[CHECK_ENQUEUE_POSITION], false);
        assert_eq!(results[1].checks[CHECK_POSITION_OK], true);
        assert_eq!(results[1].checks[CHECK_POSITION_FIELD], false);
        assert_eq!(sink.snapshot().counter(names::ENQUEUE_FAIL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_position_still_counts_as_field() {
        let mock = MockTargetService::new()
            .with_enqueue_script(vec![MockResponse::Reply(EnqueueResult::Created {
                position: BodyField::Present(None),
            })])
            .with_position_script(vec![MockResponse::Reply(PositionResult::Found {
                position: BodyField::Present(None),
                message: BodyField::Absent,
            })]);
        let (executor, sink) = executor(mock, 1, ramp_profile());

        let results = executor.run_iteration(1).await.unwrap();

        assert_eq!(results[0].checks[CHECK_ENQUEUE_POSITION], true);
        assert_eq!(results[1].checks[CHECK_POSITION_FIELD], true);
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.counter(names::ENQUEUE_SUCCESS), 1);
        assert_eq!(snapshot.counter(names::ENQUEUE_FAIL), 0);
        assert_eq!(snapshot.counter(names::POSITION_FAIL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_credentials_fails_fast() {
        let mock = MockTargetService::new();
        let (executor, sink) = executor(mock.clone(), 0, ramp_profile());

        let err = executor.run_iteration(1).await.unwrap_err();

        assert!(matches!(err, LifecycleError::NoCredentials { .. }));
        assert_eq!(sink.snapshot().counter(names::ENQUEUE_FAIL), 1);
        assert_eq!(mock.calls("enqueue"), 0);
    }
}

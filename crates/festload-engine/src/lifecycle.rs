//! Setup and teardown
//!
//! Setup logs identities in sequentially, before any worker exists, and
//! builds the [`SharedContext`]. Teardown cancels every issued registration
//! once the pool has fully drained. Both are best-effort per identity.

use crate::error::LifecycleError;
use crate::target::{LoginRequest, LoginResult, TargetService};
use festload_core::{Credential, EventBus, IdentityConfig, RunEvent, SharedContext};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Setup totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SetupSummary {
    pub planned: usize,
    pub attempted: usize,
    pub issued: usize,
}

/// Teardown totals. `failed` counts calls that got no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TeardownSummary {
    pub attempted: usize,
    pub failed: usize,
}

/// Runs setup and teardown against the target.
pub struct Lifecycle {
    target: Arc<dyn TargetService>,
    events: EventBus,
}

impl Lifecycle {
    pub fn new(target: Arc<dyn TargetService>, events: EventBus) -> Self {
        Self { target, events }
    }

    /// Log in identities `1..=pool_size` and collect their tokens.
    ///
    /// A failed login is logged and skipped. Pauses for `login_batch_pause`
    /// after every `login_batch_size` attempts. Stops early once `cancel`
    /// fires.
    pub async fn setup(
        &self,
        identities: &IdentityConfig,
        booth_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(SharedContext, SetupSummary), LifecycleError> {
        let planned = identities.pool_size;
        let batch = identities.login_batch_size.max(1);
        let mut credentials = Vec::with_capacity(planned);
        let mut attempted = 0;

        info!(planned, "Setting up identities");
        self.events.publish(RunEvent::SetupStarted { planned });

        for i in 1..=planned {
            if cancel.is_cancelled() {
                warn!(attempted, planned, "Setup interrupted");
                break;
            }

            let request = LoginRequest {
                role: identities.role.clone(),
                ..LoginRequest::visitor(identities.email(i), identities.nickname(i))
            };
            attempted += 1;

            match self.target.login(&request).await {
                Ok(LoginResult::Issued { token }) => {
                    credentials.push(Credential::new(request.email, token));
                }
                Ok(LoginResult::Rejected { status }) => {
                    debug!(email = %request.email, status, "Login rejected");
                }
                Ok(LoginResult::Malformed) => {
                    debug!(email = %request.email, "Login response carried no token");
                }
                Err(e) => {
                    debug!(email = %request.email, error = %e, "Login failed");
                }
            }

            if i % batch == 0 {
                self.events.publish(RunEvent::SetupProgress {
                    attempted,
                    issued: credentials.len(),
                    planned,
                });
                if i < planned && !identities.login_batch_pause.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(identities.login_batch_pause) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }

        let summary = SetupSummary {
            planned,
            attempted,
            issued: credentials.len(),
        };
        self.events.publish(RunEvent::SetupCompleted {
            issued: summary.issued,
            planned,
        });

        if credentials.is_empty() {
            return Err(if cancel.is_cancelled() {
                LifecycleError::Interrupted { attempted, planned }
            } else {
                LifecycleError::NoCredentials { attempted }
            });
        }

        if summary.issued < planned {
            warn!(issued = summary.issued, planned, "Some logins failed");
        }
        info!(issued = summary.issued, planned, "Setup complete");

        Ok((SharedContext::new(booth_id, credentials), summary))
    }

    /// Cancel every registration in `context`, one call per credential.
    ///
    /// Failures are logged and counted; the remaining calls still run.
    pub async fn teardown(&self, context: &SharedContext, progress_every: usize) -> TeardownSummary {
        let total = context.len();
        let progress_every = progress_every.max(1);
        let mut failed = 0;

        info!(credentials = total, "Tearing down");
        self.events
            .publish(RunEvent::TeardownStarted { credentials: total });

        for (done, credential) in context.credentials().iter().enumerate() {
            match self
                .target
                .cancel(&credential.token, context.booth_id())
                .await
            {
                Ok(result) if !result.is_success() => {
                    debug!(identity = %credential.identity, status = result.status, "Cancel not applied");
                }
                Ok(_) => {}
                Err(e) => {
                    failed += 1;
                    warn!(identity = %credential.identity, error = %e, "Cancel failed");
                }
            }

            let done = done + 1;
            if done % progress_every == 0 || done == total {
                self.events.publish(RunEvent::TeardownProgress { done, total });
            }
        }

        self.events.publish(RunEvent::TeardownCompleted {
            attempted: total,
            failed,
        });
        info!(attempted = total, failed, "Teardown complete");

        TeardownSummary {
            attempted: total,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{CancelResult, MockResponse, MockTargetService};
    use std::time::Duration;

    fn identities(pool_size: usize) -> IdentityConfig {
        IdentityConfig {
            pool_size,
            email_prefix: "loadtest".to_string(),
            nickname_prefix: "LoadTestUser".to_string(),
            role: "VISITOR".to_string(),
            login_batch_size: 2,
            login_batch_pause: Duration::from_millis(500),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_skips_failed_logins() {
        let mock = MockTargetService::new().with_login_script(vec![
            MockResponse::Reply(LoginResult::Issued {
                token: "t1".to_string(),
            }),
            MockResponse::Reply(LoginResult::Rejected { status: 500 }),
            MockResponse::Transport("connection refused"),
        ]);
        let lifecycle = Lifecycle::new(Arc::new(mock), EventBus::default());

        let (context, summary) = lifecycle
            .setup(&identities(4), 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.issued, 2);
        assert_eq!(context.credentials()[0].token, "t1");
        assert_eq!(context.credentials()[1].identity, "loadtest_user_4@test.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_emits_batch_progress_and_pauses() {
        let events = EventBus::new(32);
        let mut rx = events.subscribe();
        let lifecycle = Lifecycle::new(
            Arc::new(MockTargetService::new().with_latency(Duration::ZERO)),
            events,
        );

        let started = tokio::time::Instant::now();
        lifecycle
            .setup(&identities(5), 1, &CancellationToken::new())
            .await
            .unwrap();

        // Pauses after logins 2 and 4.
        assert_eq!(started.elapsed(), Duration::from_millis(1000));

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::SetupProgress { attempted, .. } = event {
                progress.push(attempted);
            }
        }
        assert_eq!(progress, vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_with_zero_logins_is_fatal() {
        let lifecycle = Lifecycle::new(
            Arc::new(MockTargetService::rejecting_logins()),
            EventBus::default(),
        );

        let err = lifecycle
            .setup(&identities(3), 1, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::NoCredentials { attempted: 3 }));
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_batch_pause_keeps_partial_context() {
        let mock = MockTargetService::new();
        let lifecycle = Lifecycle::new(Arc::new(mock.clone()), EventBus::default());
        // First batch is done by 20ms; the pause runs to 520ms.
        let cancel = cancel_after(Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        let (context, summary) = lifecycle.setup(&identities(6), 1, &cancel).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(
            summary,
            SetupSummary {
                planned: 6,
                attempted: 2,
                issued: 2,
            }
        );
        assert_eq!(context.len(), 2);
        assert_eq!(mock.calls("login"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_setup_without_credentials_is_interrupted() {
        let lifecycle = Lifecycle::new(
            Arc::new(MockTargetService::rejecting_logins()),
            EventBus::default(),
        );
        let cancel = cancel_after(Duration::from_millis(100));

        let err = lifecycle.setup(&identities(6), 1, &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::Interrupted {
                attempted: 2,
                planned: 6
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_best_effort() {
        let mock = MockTargetService::new().with_cancel_script(vec![
            MockResponse::Transport("connection reset"),
            MockResponse::Reply(CancelResult { status: 500 }),
        ]);
        let lifecycle = Lifecycle::new(Arc::new(mock.clone()), EventBus::default());
        let context = SharedContext::new(
            1,
            (1..=3)
                .map(|i| Credential::new(format!("u{}", i), format!("t{}", i)))
                .collect(),
        );

        let summary = lifecycle.teardown(&context, 100).await;

        assert_eq!(summary, TeardownSummary { attempted: 3, failed: 1 });
        assert_eq!(mock.calls("cancel"), 3);
    }
}

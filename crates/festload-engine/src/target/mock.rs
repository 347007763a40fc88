//! In-memory target service for tests
//!
//! Behaves like a small waiting-queue service: logins issue one token per
//! email, the first enqueue of a token is `201` with its queue position, a
//! repeat is `409`, and cancel removes the registration. Scripted responses
//! override that behaviour call by call.
//!
//! ```rust
//! use festload_engine::target::{MockResponse, MockTargetService, EnqueueResult};
//!
//! let mock = MockTargetService::new()
//!     .with_enqueue_script(vec![MockResponse::Reply(EnqueueResult::Error { status: 503 })]);
//! ```

use super::{
    BodyField, CancelResult, EnqueueResult, LoginRequest, LoginResult, PositionResult,
    TargetService,
};
use crate::error::{TargetError, TargetResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockResponse<T> {
    Reply(T),
    Timeout,
    Transport(&'static str),
}

impl<T> MockResponse<T> {
    fn into_result(self, operation: &'static str) -> TargetResult<T> {
        match self {
            Self::Reply(value) => Ok(value),
            Self::Timeout => Err(TargetError::Timeout {
                operation,
                timeout: Duration::from_secs(60),
            }),
            Self::Transport(message) => Err(TargetError::transport(operation, message)),
        }
    }
}

/// Mock behaviour knobs.
#[derive(Debug, Clone)]
pub struct MockTargetConfig {
    /// Simulated latency of every call
    pub latency: Duration,

    /// Answer every login with `401`
    pub reject_logins: bool,
}

impl Default for MockTargetConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            reject_logins: false,
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// `login`, `enqueue`, `position` or `cancel`
    pub operation: &'static str,

    /// Bearer token, or the email for logins
    pub subject: String,

    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct Scripts {
    login: VecDeque<MockResponse<LoginResult>>,
    enqueue: VecDeque<MockResponse<EnqueueResult>>,
    position: VecDeque<MockResponse<PositionResult>>,
    cancel: VecDeque<MockResponse<CancelResult>>,
}

/// In-memory [`TargetService`].
#[derive(Debug, Clone, Default)]
pub struct MockTargetService {
    config: MockTargetConfig,
    scripts: Arc<RwLock<Scripts>>,
    // Registered tokens in queue order.
    queue: Arc<RwLock<Vec<String>>>,
    history: Arc<RwLock<Vec<CallRecord>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockTargetService {
    pub fn new() -> Self {
        Self::new_with_config(MockTargetConfig::default())
    }

    pub fn new_with_config(config: MockTargetConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Mock whose logins all fail with `401`.
    pub fn rejecting_logins() -> Self {
        Self::new_with_config(MockTargetConfig {
            reject_logins: true,
            ..MockTargetConfig::default()
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.config.latency = latency;
        self
    }

    /// Answers consumed in order by the next logins.
    pub fn with_login_script(self, script: Vec<MockResponse<LoginResult>>) -> Self {
        self.scripts.write().login.extend(script);
        self
    }

    pub fn with_enqueue_script(self, script: Vec<MockResponse<EnqueueResult>>) -> Self {
        self.scripts.write().enqueue.extend(script);
        self
    }

    pub fn with_position_script(self, script: Vec<MockResponse<PositionResult>>) -> Self {
        self.scripts.write().position.extend(script);
        self
    }

    pub fn with_cancel_script(self, script: Vec<MockResponse<CancelResult>>) -> Self {
        self.scripts.write().cancel.extend(script);
        self
    }

    pub fn call_history(&self) -> Vec<CallRecord> {
        self.history.read().clone()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.history
            .read()
            .iter()
            .filter(|r| r.operation == operation)
            .count()
    }

    /// Start time of the first recorded call of `operation`.
    pub fn first_call(&self, operation: &str) -> Option<Instant> {
        self.history
            .read()
            .iter()
            .filter(|r| r.operation == operation)
            .map(|r| r.started_at)
            .min()
    }

    /// Start time of the last recorded call of `operation`.
    pub fn last_call(&self, operation: &str) -> Option<Instant> {
        self.history
            .read()
            .iter()
            .filter(|r| r.operation == operation)
            .map(|r| r.started_at)
            .max()
    }

    /// Most calls that were ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> usize {
        self.queue.read().len()
    }

    async fn enter(&self, operation: &'static str, subject: &str) -> InFlightGuard {
        self.history.write().push(CallRecord {
            operation,
            subject: subject.to_string(),
            started_at: Instant::now(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        guard
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TargetService for MockTargetService {
    async fn login(&self, request: &LoginRequest) -> TargetResult<LoginResult> {
        let _guard = self.enter("login", &request.email).await;

        if let Some(scripted) = self.scripts.write().login.pop_front() {
            return scripted.into_result("login");
        }
        if self.config.reject_logins {
            return Ok(LoginResult::Rejected { status: 401 });
        }
        Ok(LoginResult::Issued {
            token: format!("token-{}", request.email),
        })
    }

    async fn enqueue(&self, token: &str, _booth_id: i64) -> TargetResult<EnqueueResult> {
        let _guard = self.enter("enqueue", token).await;

        if let Some(scripted) = self.scripts.write().enqueue.pop_front() {
            return scripted.into_result("enqueue");
        }

        let mut queue = self.queue.write();
        if queue.iter().any(|t| t == token) {
            return Ok(EnqueueResult::Conflict);
        }
        queue.push(token.to_string());
        Ok(EnqueueResult::Created {
            position: (queue.len() as i64).into(),
        })
    }

    async fn position(&self, token: &str, _booth_id: i64) -> TargetResult<PositionResult> {
        let _guard = self.enter("position", token).await;

        if let Some(scripted) = self.scripts.write().position.pop_front() {
            return scripted.into_result("position");
        }

        let queue = self.queue.read();
        Ok(match queue.iter().position(|t| t == token) {
            Some(index) => PositionResult::Found {
                position: (index as i64 + 1).into(),
                message: BodyField::Absent,
            },
            None => PositionResult::Found {
                position: BodyField::Absent,
                message: "not in queue".to_string().into(),
            },
        })
    }

    async fn cancel(&self, token: &str, _booth_id: i64) -> TargetResult<CancelResult> {
        let _guard = self.enter("cancel", token).await;

        if let Some(scripted) = self.scripts.write().cancel.pop_front() {
            return scripted.into_result("cancel");
        }

        let mut queue = self.queue.write();
        let before = queue.len();
        queue.retain(|t| t != token);
        Ok(CancelResult {
            status: if queue.len() < before { 200 } else { 404 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_then_conflict_then_cancel() {
        let mock = MockTargetService::new();

        assert_eq!(
            mock.enqueue("t1", 1).await.unwrap(),
            EnqueueResult::Created { position: 1.into() }
        );
        assert_eq!(mock.enqueue("t1", 1).await.unwrap(), EnqueueResult::Conflict);
        assert_eq!(
            mock.position("t1", 1).await.unwrap(),
            PositionResult::Found {
                position: 1.into(),
                message: BodyField::Absent
            }
        );
        assert_eq!(mock.cancel("t1", 1).await.unwrap().status, 200);
        assert_eq!(mock.cancel("t1", 1).await.unwrap().status, 404);
        assert_eq!(mock.calls("enqueue"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripts_take_precedence() {
        let mock = MockTargetService::new()
            .with_login_script(vec![
                MockResponse::Reply(LoginResult::Malformed),
                MockResponse::Timeout,
            ]);
        let request = LoginRequest::visitor("a@test.com", "A");

        assert_eq!(mock.login(&request).await.unwrap(), LoginResult::Malformed);
        assert!(mock.login(&request).await.unwrap_err().is_timeout());
        assert!(matches!(
            mock.login(&request).await.unwrap(),
            LoginResult::Issued { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_logins() {
        let mock = MockTargetService::rejecting_logins();
        let result = mock
            .login(&LoginRequest::visitor("a@test.com", "A"))
            .await
            .unwrap();

        assert_eq!(result, LoginResult::Rejected { status: 401 });
    }
}

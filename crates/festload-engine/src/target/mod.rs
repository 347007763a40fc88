//! Target service seam
//!
//! The waiting-queue service under test is reached through the
//! [`TargetService`] trait. Every endpoint answers with an explicit result
//! type so that success classification in the scenario is exhaustive:
//!
//! - `login` -> [`LoginResult`]
//! - `enqueue` -> [`EnqueueResult`]
//! - `position` -> [`PositionResult`]
//! - `cancel` -> [`CancelResult`]
//!
//! Transport failures (timeouts, refused connections) surface as
//! [`crate::error::TargetError`].

mod http;
mod mock;

pub use http::{HttpTargetConfig, HttpTargetService};
pub use mock::{CallRecord, MockResponse, MockTargetConfig, MockTargetService};

use crate::error::TargetResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Login payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub nickname: String,
    pub role: String,
    pub managed_booth_id: Option<i64>,
}

impl LoginRequest {
    pub fn visitor(email: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            nickname: nickname.into(),
            role: "VISITOR".to_string(),
            managed_booth_id: None,
        }
    }
}

/// Outcome of a login call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResult {
    /// `200` with a bearer token.
    Issued { token: String },
    /// Any status other than `200`.
    Rejected { status: u16 },
    /// `200` without a usable token in the body.
    Malformed,
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// `201` with the body's `position` key.
    Created { position: BodyField<i64> },
    /// `409`: the identity is already registered at the booth.
    Conflict,
    /// Any other status.
    Error { status: u16 },
}

impl EnqueueResult {
    pub fn status(&self) -> u16 {
        match self {
            Self::Created { .. } => 201,
            Self::Conflict => 409,
            Self::Error { status } => *status,
        }
    }
}

/// One key of a JSON response body.
///
/// Presence is what the checks look at; the typed value is kept for
/// reporting only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyField<T> {
    /// The key is missing, or the body is not a JSON object.
    Absent,
    /// The key is there; `None` when its value is null or of another type.
    Present(Option<T>),
}

impl<T: DeserializeOwned> BodyField<T> {
    /// Read `key` from a response body.
    pub fn from_body(body: &Value, key: &str) -> Self {
        match body.get(key) {
            None => Self::Absent,
            Some(value) => Self::Present(T::deserialize(value).ok()),
        }
    }
}

impl<T> BodyField<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Present(Some(value)) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<T> for BodyField<T> {
    fn from(value: T) -> Self {
        Self::Present(Some(value))
    }
}

/// Outcome of a position check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionResult {
    /// `200`, with whichever of `position` / `message` the body carried.
    Found {
        position: BodyField<i64>,
        message: BodyField<String>,
    },
    /// Any other status.
    Error { status: u16 },
}

impl PositionResult {
    pub fn status(&self) -> u16 {
        match self {
            Self::Found { .. } => 200,
            Self::Error { status } => *status,
        }
    }

    /// True for a `200` carrying a position or an explanatory message.
    pub fn has_position_field(&self) -> bool {
        matches!(
            self,
            Self::Found { position, message } if position.is_present() || message.is_present()
        )
    }
}

/// Outcome of a cancel call. Cleanup is best-effort so only the status is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelResult {
    pub status: u16,
}

impl CancelResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The service under test.
///
/// Implementations must be thread-safe; one instance is shared by every
/// worker of a run. Each call must be bounded by a timeout owned by the
/// implementation.
#[async_trait]
pub trait TargetService: Send + Sync {
    /// `POST /api/v1/auth/login`
    async fn login(&self, request: &LoginRequest) -> TargetResult<LoginResult>;

    /// `POST /api/v1/waitings`
    async fn enqueue(&self, token: &str, booth_id: i64) -> TargetResult<EnqueueResult>;

    /// `GET /api/v1/waitings/booth/{booth_id}`
    async fn position(&self, token: &str, booth_id: i64) -> TargetResult<PositionResult>;

    /// `DELETE /api/v1/waitings/{booth_id}`
    async fn cancel(&self, token: &str, booth_id: i64) -> TargetResult<CancelResult>;
}

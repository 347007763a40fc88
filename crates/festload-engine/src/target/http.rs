//! reqwest-backed [`TargetService`]

use super::{
    BodyField, CancelResult, EnqueueResult, LoginRequest, LoginResult, PositionResult,
    TargetService,
};
use crate::error::{RunError, TargetError, TargetResult};
use async_trait::async_trait;
use festload_core::TargetConfig;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpTargetConfig {
    /// Base URL without trailing slash, e.g. `http://localhost:8080`
    pub base_url: String,

    /// Bound on every request, connect through body
    pub timeout: Duration,
}

impl HttpTargetConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&TargetConfig> for HttpTargetConfig {
    fn from(config: &TargetConfig) -> Self {
        Self::new(config.base_url.clone()).with_timeout(config.request_timeout())
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    token: Option<String>,
}

/// Talks to the waiting-queue service over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTargetService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTargetService {
    pub fn new(config: HttpTargetConfig) -> Result<Self, RunError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RunError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_error(&self, operation: &'static str, error: reqwest::Error) -> TargetError {
        if error.is_timeout() {
            TargetError::Timeout {
                operation,
                timeout: self.timeout,
            }
        } else {
            TargetError::transport(operation, error.to_string())
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> TargetResult<(StatusCode, Vec<u8>)> {
        let response = request
            .send()
            .await
            .map_err(|e| self.map_error(operation, e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                self.map_error(operation, e)
            } else {
                TargetError::decode(operation, e.to_string())
            }
        })?;

        debug!(operation, status = status.as_u16(), bytes = body.len(), "Response received");
        Ok((status, body.to_vec()))
    }
}

#[async_trait]
impl TargetService for HttpTargetService {
    async fn login(&self, request: &LoginRequest) -> TargetResult<LoginResult> {
        let (status, body) = self
            .send(
                "login",
                self.client.post(self.url("/api/v1/auth/login")).json(request),
            )
            .await?;

        if status != StatusCode::OK {
            return Ok(LoginResult::Rejected {
                status: status.as_u16(),
            });
        }

        let token = serde_json::from_slice::<TokenBody>(&body)
            .ok()
            .and_then(|b| b.access_token.or(b.token))
            .filter(|t| !t.is_empty());

        Ok(match token {
            Some(token) => LoginResult::Issued { token },
            None => LoginResult::Malformed,
        })
    }

    async fn enqueue(&self, token: &str, booth_id: i64) -> TargetResult<EnqueueResult> {
        let (status, body) = self
            .send(
                "enqueue",
                self.client
                    .post(self.url("/api/v1/waitings"))
                    .bearer_auth(token)
                    .json(&serde_json::json!({ "boothId": booth_id })),
            )
            .await?;

        Ok(match status {
            StatusCode::CREATED => EnqueueResult::Created {
                position: BodyField::from_body(&json_body(&body), "position"),
            },
            StatusCode::CONFLICT => EnqueueResult::Conflict,
            other => EnqueueResult::Error {
                status: other.as_u16(),
            },
        })
    }

    async fn position(&self, token: &str, booth_id: i64) -> TargetResult<PositionResult> {
        let (status, body) = self
            .send(
                "position",
                self.client
                    .get(self.url(&format!("/api/v1/waitings/booth/{}", booth_id)))
                    .bearer_auth(token),
            )
            .await?;

        if status != StatusCode::OK {
            return Ok(PositionResult::Error {
                status: status.as_u16(),
            });
        }

        let body = json_body(&body);
        Ok(PositionResult::Found {
            position: BodyField::from_body(&body, "position"),
            message: BodyField::from_body(&body, "message"),
        })
    }

    async fn cancel(&self, token: &str, booth_id: i64) -> TargetResult<CancelResult> {
        let (status, _) = self
            .send(
                "cancel",
                self.client
                    .delete(self.url(&format!("/api/v1/waitings/{}", booth_id)))
                    .bearer_auth(token),
            )
            .await?;

        Ok(CancelResult {
            status: status.as_u16(),
        })
    }
}

/// Response body as JSON; `Null` when it is empty or not JSON.
fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

//! Shared setup context handed to every worker

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity and bearer token issued during setup.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identity: String,
    pub token: String,
}

impl Credential {
    pub fn new(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: token.into(),
        }
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Immutable result of setup. Shared by `Arc` across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContext {
    booth_id: i64,
    credentials: Vec<Credential>,
}

impl SharedContext {
    pub fn new(booth_id: i64, credentials: Vec<Credential>) -> Self {
        Self {
            booth_id,
            credentials,
        }
    }

    pub fn booth_id(&self) -> i64 {
        self.booth_id
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Index of the credential used by 1-based `worker_index`:
    /// `(worker_index - 1) mod len`.
    pub fn credential_index(&self, worker_index: usize) -> Option<usize> {
        if self.credentials.is_empty() {
            return None;
        }
        Some(worker_index.saturating_sub(1) % self.credentials.len())
    }

    /// Credential used by 1-based `worker_index`; `None` when setup issued none.
    pub fn credential_for(&self, worker_index: usize) -> Option<&Credential> {
        self.credential_index(worker_index)
            .map(|index| &self.credentials[index])
    }
}

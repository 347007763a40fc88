//! Worker and iteration types shared by the engine and reporters

use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Waiting for its next iteration.
    Idle = 0,
    /// Executing an iteration.
    Running = 1,
    /// Told to stop; finishes its current iteration first.
    Draining = 2,
    /// Exited.
    Stopped = 3,
}

impl WorkerStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of one named operation inside an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationResult {
    pub request_name: String,
    pub latency_ms: f64,
    pub checks: BTreeMap<String, bool>,
}

impl IterationResult {
    pub fn new(request_name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            request_name: request_name.into(),
            latency_ms,
            checks: BTreeMap::new(),
        }
    }

    pub fn with_check(mut self, name: impl Into<String>, passed: bool) -> Self {
        self.checks.insert(name.into(), passed);
        self
    }

    /// True when every check passed (vacuously true without checks).
    pub fn passed(&self) -> bool {
        self.checks.values().all(|passed| *passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_u8() {
        for status in [
            WorkerStatus::Idle,
            WorkerStatus::Running,
            WorkerStatus::Draining,
            WorkerStatus::Stopped,
        ] {
            assert_eq!(WorkerStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_iteration_result_passes_only_when_all_checks_pass() {
        let ok = IterationResult::new("enqueue", 12.0)
            .with_check("enqueue: status is 201", true)
            .with_check("enqueue: has position", true);
        let failed = ok.clone().with_check("enqueue: has position", false);

        assert!(ok.passed());
        assert!(!failed.passed());
    }
}

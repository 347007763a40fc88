//! Structured run events
//!
//! The engine never prints. It publishes [`RunEvent`]s on an [`EventBus`]
//! and observers (console renderer, tests) subscribe to them.

use std::time::Duration;
use tokio::sync::broadcast;

/// Default buffered events per subscriber before the slowest one lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Why a run stopped before its stages completed.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// Operator interrupt or an external cancellation.
    Interrupted,
    /// A threshold flagged `abort_on_fail` was breached.
    ThresholdBreached { metric: String, expression: String },
}

/// Progress notification emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    SetupStarted {
        planned: usize,
    },
    SetupProgress {
        attempted: usize,
        issued: usize,
        planned: usize,
    },
    SetupCompleted {
        issued: usize,
        planned: usize,
    },
    StageStarted {
        index: usize,
        target: f64,
        duration: Duration,
    },
    PoolResized {
        from: usize,
        to: usize,
        target: f64,
    },
    DrainRequested {
        elapsed: Duration,
    },
    PoolStopped {
        iterations: u64,
        dropped: u64,
    },
    RunAborted {
        reason: AbortReason,
    },
    TeardownStarted {
        credentials: usize,
    },
    TeardownProgress {
        done: usize,
        total: usize,
    },
    TeardownCompleted {
        attempted: usize,
        failed: usize,
    },
}

/// Broadcast channel for run events. Publishing without subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: RunEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

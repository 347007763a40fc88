//! Core types for festload: stage schedules, metrics, thresholds and configuration.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod metrics;
pub mod stage;
pub mod threshold;
pub mod types;

pub use config::{
    ConflictPolicy, ExecutorConfig, IdentityConfig, LoadTestConfig, Preset, RunConfig,
    ScenarioConfig, TargetConfig, ThresholdEntry,
};
pub use context::{Credential, SharedContext};
pub use error::{CoreError, CoreResult};
pub use events::{AbortReason, EventBus, RunEvent, DEFAULT_EVENT_CAPACITY};
pub use metrics::{names, MetricKind, MetricSink, MetricValue, MetricsSnapshot, TrendSamples};
pub use stage::{
    format_duration, parse_duration, DisplayDuration, ScheduleSample, StageSchedule, StageSpec,
};
pub use threshold::{ThresholdOutcome, ThresholdSet, ThresholdSpec};
pub use types::{IterationResult, WorkerStatus};

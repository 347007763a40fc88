//! festload engine: drives worker pools against the waiting-queue service.
//!
//! A run goes through [`LoadTestOrchestrator::run`]: identities log in, a
//! closed or open [`pool`] executes the enqueue scenario through the stage
//! schedule, every queue entry is cancelled, and thresholds are evaluated
//! over the collected metrics. [`ResultWriter`] renders the final report.

pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod pool;
pub mod reporter;
pub mod scenario;
pub mod target;

pub use error::{LifecycleError, RunError, RunResult, TargetError, TargetResult};
pub use lifecycle::{Lifecycle, SetupSummary, TeardownSummary};
pub use orchestrator::{LoadTestOrchestrator, RunReport};
pub use pool::{ClosedPool, ClosedPoolConfig, OpenPool, OpenPoolConfig, PoolContext, PoolSummary};
pub use reporter::{ReportFormat, ResultWriter};
pub use scenario::{ScenarioExecutor, ScenarioProfile};
pub use target::{HttpTargetConfig, HttpTargetService, MockTargetService, TargetService};

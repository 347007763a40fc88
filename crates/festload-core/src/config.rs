//! Configuration management for festload
//!
//! Sources, lowest precedence first:
//! 1. A built-in preset (`ramp` or `spike`)
//! 2. A config file (JSON, YAML or TOML, chosen by extension)
//! 3. Environment variables with the `FESTLOAD_` prefix and `__` as the
//!    nesting separator, e.g. `FESTLOAD_TARGET__BOOTH_ID=7`
//! 4. The load-script variables `BASE_URL` and `BOOTH_ID`

use crate::error::{CoreError, CoreResult};
use crate::stage::{duration_str, StageSchedule, StageSpec};
use crate::threshold::{ThresholdSet, ThresholdSpec};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Built-in scenario presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Closed-model ramp to 200 workers with enqueue + position polling.
    Ramp,
    /// Open-model arrival-rate spike to 500 iterations/s, enqueue only.
    Spike,
}

impl FromStr for Preset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ramp" => Ok(Self::Ramp),
            "spike" => Ok(Self::Spike),
            other => Err(CoreError::validation(format!(
                "unknown preset '{}', expected 'ramp' or 'spike'",
                other
            ))),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ramp => f.write_str("ramp"),
            Self::Spike => f.write_str("spike"),
        }
    }
}

/// Root configuration of one load test.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoadTestConfig {
    #[serde(default)]
    pub target: TargetConfig,

    pub identities: IdentityConfig,

    pub scenario: ScenarioConfig,

    /// Metric name → threshold expressions.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdEntry>>,

    #[serde(default)]
    pub run: RunConfig,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self::preset(Preset::Ramp)
    }
}

impl LoadTestConfig {
    /// Load configuration layered over `preset`.
    pub fn load(preset: Preset, file: Option<&Path>) -> CoreResult<Self> {
        let mut builder = Self::base_builder(preset, file)?;

        builder = builder.add_source(
            Environment::with_prefix("FESTLOAD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("target.base_url", std::env::var("BASE_URL").ok())?
            .set_override_option("target.booth_id", std::env::var("BOOTH_ID").ok())?;

        let config: LoadTestConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load `preset` overlaid with `file` only, ignoring the environment.
    pub fn from_file<P: AsRef<Path>>(preset: Preset, path: P) -> CoreResult<Self> {
        let config: LoadTestConfig = Self::base_builder(preset, Some(path.as_ref()))?
            .build()?
            .try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn base_builder(
        preset: Preset,
        file: Option<&Path>,
    ) -> CoreResult<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = serde_json::to_string(&Self::preset(preset))?;

        let mut builder = Config::builder().add_source(File::from_str(&defaults, FileFormat::Json));
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        Ok(builder)
    }

    /// Built-in configuration for `preset`.
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Ramp => Self::ramp_preset(),
            Preset::Spike => Self::spike_preset(),
        }
    }

    fn ramp_preset() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("http_req_duration".to_string(), vec!["p(95)<2000".into()]);
        thresholds.insert("http_req_failed".to_string(), vec!["rate<0.1".into()]);
        thresholds.insert("enqueue_latency".to_string(), vec!["p(95)<3000".into()]);
        thresholds.insert("position_latency".to_string(), vec!["p(95)<500".into()]);

        Self {
            target: TargetConfig::default(),
            identities: IdentityConfig {
                pool_size: 500,
                email_prefix: "loadtest".to_string(),
                nickname_prefix: "LoadTestUser".to_string(),
                role: "VISITOR".to_string(),
                login_batch_size: 50,
                login_batch_pause: Duration::from_millis(500),
            },
            scenario: ScenarioConfig {
                name: "ramp".to_string(),
                conflict_policy: ConflictPolicy::Fail,
                think_time: Duration::from_secs(1),
                position_polls: 3,
                poll_interval: Duration::from_millis(500),
                trailing_think_time: Duration::from_secs(1),
                executor: ExecutorConfig::RampingVus {
                    start_workers: 0,
                    max_workers: None,
                    tick: default_ramp_tick(),
                    stages: vec![
                        StageSpec::new(Duration::from_secs(30), 10.0),
                        StageSpec::new(Duration::from_secs(60), 50.0),
                        StageSpec::new(Duration::from_secs(120), 100.0),
                        StageSpec::new(Duration::from_secs(60), 200.0),
                        StageSpec::new(Duration::from_secs(30), 0.0),
                    ],
                },
            },
            thresholds,
            run: RunConfig::default(),
        }
    }

    fn spike_preset() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("http_req_duration".to_string(), vec!["p(99)<5000".into()]);
        thresholds.insert("http_req_failed".to_string(), vec!["rate<0.2".into()]);

        Self {
            target: TargetConfig::default(),
            identities: IdentityConfig {
                pool_size: 1000,
                email_prefix: "spiketest".to_string(),
                nickname_prefix: "SpikeTestUser".to_string(),
                role: "VISITOR".to_string(),
                login_batch_size: 100,
                login_batch_pause: Duration::from_millis(300),
            },
            scenario: ScenarioConfig {
                name: "spike".to_string(),
                conflict_policy: ConflictPolicy::Tolerate,
                think_time: Duration::ZERO,
                position_polls: 0,
                poll_interval: Duration::ZERO,
                trailing_think_time: Duration::ZERO,
                executor: ExecutorConfig::RampingArrivalRate {
                    start_rate: 1.0,
                    time_unit: Duration::from_secs(1),
                    pre_allocated_workers: 500,
                    max_workers: 1000,
                    tick: default_dispatch_tick(),
                    stages: vec![
                        StageSpec::new(Duration::from_secs(10), 10.0),
                        StageSpec::new(Duration::from_secs(5), 500.0),
                        StageSpec::new(Duration::from_secs(30), 500.0),
                        StageSpec::new(Duration::from_secs(10), 10.0),
                        StageSpec::new(Duration::from_secs(10), 0.0),
                    ],
                },
            },
            thresholds,
            run: RunConfig::default(),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> CoreResult<()> {
        let url = self.target.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::validation(format!(
                "target.base_url must start with http:// or https://, got '{}'",
                self.target.base_url
            )));
        }

        if self.target.request_timeout_ms == 0 {
            return Err(CoreError::validation("target.request_timeout_ms must be > 0"));
        }

        if self.identities.pool_size == 0 {
            return Err(CoreError::validation("identities.pool_size must be > 0"));
        }

        if self.identities.login_batch_size == 0 {
            return Err(CoreError::validation(
                "identities.login_batch_size must be > 0",
            ));
        }

        if self.scenario.name.trim().is_empty() {
            return Err(CoreError::validation("scenario.name must not be empty"));
        }

        self.scenario.executor.validate()?;
        self.schedule()?;
        ThresholdSet::compile(self.threshold_specs())?;

        if self.run.threshold_eval_interval.is_zero() {
            return Err(CoreError::validation(
                "run.threshold_eval_interval must be > 0",
            ));
        }

        Ok(())
    }

    /// Stage schedule of the configured executor.
    pub fn schedule(&self) -> CoreResult<StageSchedule> {
        self.scenario.executor.schedule()
    }

    /// Flatten the threshold map into specs, ordered by metric name.
    pub fn threshold_specs(&self) -> Vec<ThresholdSpec> {
        self.thresholds
            .iter()
            .flat_map(|(metric, entries)| entries.iter().map(|e| e.to_spec(metric)))
            .collect()
    }

    /// Pretty JSON rendering, readable back through [`LoadTestConfig::from_file`].
    pub fn to_json_pretty(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Target service location.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Base URL of the waiting-queue service
    pub base_url: String,

    /// Booth every worker queues at
    pub booth_id: i64,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            booth_id: 1,
            request_timeout_ms: 60_000,
        }
    }
}

impl TargetConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Identities logged in during setup.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Number of identities to log in
    pub pool_size: usize,

    /// Email is `{email_prefix}_user_{i}@test.com`
    pub email_prefix: String,

    /// Nickname is `{nickname_prefix}{i}`
    pub nickname_prefix: String,

    pub role: String,

    /// Pause after every this many logins
    pub login_batch_size: usize,

    #[serde(with = "duration_str")]
    pub login_batch_pause: Duration,
}

impl IdentityConfig {
    pub fn email(&self, index: usize) -> String {
        format!("{}_user_{}@test.com", self.email_prefix, index)
    }

    pub fn nickname(&self, index: usize) -> String {
        format!("{}{}", self.nickname_prefix, index)
    }
}

/// How an enqueue answered with "already registered" is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Only `201 Created` with a position counts as success.
    Fail,
    /// `409 Conflict` counts as success as well.
    Tolerate,
}

/// What each iteration does and which executor drives it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScenarioConfig {
    pub name: String,

    pub conflict_policy: ConflictPolicy,

    /// Pause after the enqueue call
    #[serde(with = "duration_str")]
    pub think_time: Duration,

    /// Number of sequential position checks
    pub position_polls: u32,

    /// Pause after each position check
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Pause at the end of the iteration
    #[serde(with = "duration_str")]
    pub trailing_think_time: Duration,

    pub executor: ExecutorConfig,
}

fn default_ramp_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_dispatch_tick() -> Duration {
    Duration::from_millis(10)
}

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

/// Execution model.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutorConfig {
    /// Closed model: stage targets are concurrent workers.
    RampingVus {
        #[serde(default)]
        start_workers: u64,

        /// Pool ceiling; defaults to the schedule's peak target.
        #[serde(default)]
        max_workers: Option<usize>,

        #[serde(default = "default_ramp_tick", with = "duration_str")]
        tick: Duration,

        stages: Vec<StageSpec>,
    },

    /// Open model: stage targets are iteration starts per `time_unit`.
    RampingArrivalRate {
        #[serde(default)]
        start_rate: f64,

        #[serde(default = "default_time_unit", with = "duration_str")]
        time_unit: Duration,

        pre_allocated_workers: usize,

        max_workers: usize,

        #[serde(default = "default_dispatch_tick", with = "duration_str")]
        tick: Duration,

        stages: Vec<StageSpec>,
    },
}

impl ExecutorConfig {
    pub fn stages(&self) -> &[StageSpec] {
        match self {
            Self::RampingVus { stages, .. } | Self::RampingArrivalRate { stages, .. } => stages,
        }
    }

    pub fn schedule(&self) -> CoreResult<StageSchedule> {
        match self {
            Self::RampingVus {
                start_workers,
                stages,
                ..
            } => StageSchedule::new(*start_workers as f64, stages.clone()),
            Self::RampingArrivalRate {
                start_rate, stages, ..
            } => StageSchedule::new(*start_rate, stages.clone()),
        }
    }

    /// Hard pool ceiling.
    pub fn max_workers(&self) -> CoreResult<usize> {
        match self {
            Self::RampingVus { max_workers, .. } => match max_workers {
                Some(max) => Ok(*max),
                None => Ok(self.schedule()?.peak_target().floor() as usize),
            },
            Self::RampingArrivalRate { max_workers, .. } => Ok(*max_workers),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.stages().is_empty() {
            return Err(CoreError::validation(
                "scenario.executor.stages must not be empty",
            ));
        }

        match self {
            Self::RampingVus {
                max_workers, tick, ..
            } => {
                if *max_workers == Some(0) {
                    return Err(CoreError::validation(
                        "scenario.executor.max_workers must be > 0",
                    ));
                }
                if tick.is_zero() {
                    return Err(CoreError::validation("scenario.executor.tick must be > 0"));
                }
            }
            Self::RampingArrivalRate {
                time_unit,
                pre_allocated_workers,
                max_workers,
                tick,
                ..
            } => {
                if *pre_allocated_workers == 0 {
                    return Err(CoreError::validation(
                        "scenario.executor.pre_allocated_workers must be > 0",
                    ));
                }
                if pre_allocated_workers > max_workers {
                    return Err(CoreError::validation(format!(
                        "scenario.executor.pre_allocated_workers ({}) must be <= max_workers ({})",
                        pre_allocated_workers, max_workers
                    )));
                }
                if time_unit.is_zero() {
                    return Err(CoreError::validation(
                        "scenario.executor.time_unit must be > 0",
                    ));
                }
                if tick.is_zero() {
                    return Err(CoreError::validation("scenario.executor.tick must be > 0"));
                }
            }
        }

        Ok(())
    }
}

/// One declared threshold: either a bare expression or an expression with
/// abort settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default, with = "duration_str")]
        delay_abort_eval: Duration,
    },
}

impl From<&str> for ThresholdEntry {
    fn from(expression: &str) -> Self {
        Self::Expression(expression.to_string())
    }
}

impl ThresholdEntry {
    fn to_spec(&self, metric: &str) -> ThresholdSpec {
        match self {
            Self::Expression(expression) => ThresholdSpec::new(metric, expression.clone()),
            Self::Detailed {
                threshold,
                abort_on_fail,
                delay_abort_eval,
            } => {
                let spec = ThresholdSpec::new(metric, threshold.clone());
                if *abort_on_fail {
                    spec.with_abort_on_fail(*delay_abort_eval)
                } else {
                    spec
                }
            }
        }
    }
}

/// Run-level knobs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunConfig {
    /// How often `abort_on_fail` thresholds are checked while running
    #[serde(with = "duration_str")]
    pub threshold_eval_interval: Duration,

    /// Longest wait for in-flight iterations once a drain starts; unset
    /// waits for every iteration to finish.
    #[serde(default, with = "opt_duration_str")]
    pub graceful_stop: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threshold_eval_interval: Duration::from_secs(2),
            graceful_stop: None,
        }
    }
}

mod opt_duration_str {
    use crate::stage::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_ramp_preset_matches_script() {
        let config = LoadTestConfig::preset(Preset::Ramp);
        let schedule = config.schedule().unwrap();

        assert_eq!(config.identities.pool_size, 500);
        assert_eq!(config.identities.login_batch_size, 50);
        assert_eq!(schedule.total_duration(), Duration::from_secs(300));
        assert_eq!(schedule.peak_target(), 200.0);
        assert_eq!(config.scenario.executor.max_workers().unwrap(), 200);
        assert_eq!(config.scenario.conflict_policy, ConflictPolicy::Fail);
        assert_eq!(config.scenario.position_polls, 3);
        assert_eq!(config.threshold_specs().len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_spike_preset_matches_script() {
        let config = LoadTestConfig::preset(Preset::Spike);
        let schedule = config.schedule().unwrap();

        assert_eq!(config.identities.pool_size, 1000);
        assert_eq!(schedule.start_target(), 1.0);
        assert_eq!(schedule.total_duration(), Duration::from_secs(65));
        assert_eq!(config.scenario.conflict_policy, ConflictPolicy::Tolerate);
        assert_eq!(config.scenario.position_polls, 0);
        assert!(matches!(
            config.scenario.executor,
            ExecutorConfig::RampingArrivalRate {
                pre_allocated_workers: 500,
                max_workers: 1000,
                ..
            }
        ));
        config.validate().unwrap();
    }

    #[test]
    fn test_identity_naming() {
        let identities = LoadTestConfig::preset(Preset::Ramp).identities;
        assert_eq!(identities.email(7), "loadtest_user_7@test.com");
        assert_eq!(identities.nickname(7), "LoadTestUser7");
    }

    #[test]
    fn test_json_round_trip_of_preset() {
        let config = LoadTestConfig::preset(Preset::Spike);
        let json = config.to_json_pretty().unwrap();
        let parsed: LoadTestConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_file_overrides_preset() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "target": {{ "base_url": "https://queue.example.com", "booth_id": 7 }},
                "identities": {{ "pool_size": 20 }},
                "run": {{ "graceful_stop": "30s" }}
            }}"#
        )
        .unwrap();

        let config = LoadTestConfig::from_file(Preset::Ramp, file.path()).unwrap();

        assert_eq!(config.target.base_url, "https://queue.example.com");
        assert_eq!(config.target.booth_id, 7);
        assert_eq!(config.target.request_timeout_ms, 60_000);
        assert_eq!(config.identities.pool_size, 20);
        assert_eq!(config.identities.email_prefix, "loadtest");
        assert_eq!(config.run.graceful_stop, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let err = LoadTestConfig::from_file(Preset::Ramp, &path).unwrap_err();

        assert!(matches!(err, CoreError::Config(_)), "{:?}", err);
    }

    #[test]
    fn test_detailed_threshold_entry() {
        let entries: Vec<ThresholdEntry> = serde_json::from_str(
            r#"["rate<0.1", {"threshold": "rate<0.5", "abort_on_fail": true, "delay_abort_eval": "10s"}]"#,
        )
        .unwrap();

        let specs: Vec<_> = entries.iter().map(|e| e.to_spec("http_req_failed")).collect();
        assert!(!specs[0].abort_on_fail);
        assert!(specs[1].abort_on_fail);
        assert_eq!(specs[1].delay_abort_eval, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = LoadTestConfig::preset(Preset::Ramp);
        config.target.base_url = "localhost:8080".to_string();
        assert!(config.validate().is_err());

        let mut config = LoadTestConfig::preset(Preset::Ramp);
        config.identities.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = LoadTestConfig::preset(Preset::Spike);
        if let ExecutorConfig::RampingArrivalRate {
            pre_allocated_workers,
            ..
        } = &mut config.scenario.executor
        {
            *pre_allocated_workers = 2000;
        }
        assert!(config.validate().is_err());

        let mut config = LoadTestConfig::preset(Preset::Ramp);
        config
            .thresholds
            .insert("checks".to_string(), vec!["rate>>0.9".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("spike".parse::<Preset>().unwrap(), Preset::Spike);
        assert_eq!("RAMP".parse::<Preset>().unwrap(), Preset::Ramp);
        assert!("soak".parse::<Preset>().is_err());
    }
}

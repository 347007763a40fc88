//! Stage schedules: how the concurrency or arrival-rate target moves over time
//!
//! A schedule is an ordered list of [`StageSpec`]s laid back-to-back on the
//! wall clock. Inside a stage the target moves linearly from the previous
//! stage's end target (or the schedule's start target) to the stage's own end
//! target. Once the last stage has elapsed the schedule asks for a drain.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One time-boxed linear ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// How long the ramp lasts. Zero means "jump to `target` immediately".
    #[serde(with = "duration_str")]
    pub duration: Duration,

    /// End target: concurrent workers (closed model) or iteration starts per
    /// time unit (open model).
    pub target: f64,
}

impl StageSpec {
    /// Create a stage.
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// Instantaneous reading of a schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleSample {
    /// Interpolated target, never negative.
    pub target: f64,

    /// Index of the stage currently in effect; `None` once drained.
    pub stage: Option<usize>,

    /// True once every stage has elapsed.
    pub drain_requested: bool,
}

impl ScheduleSample {
    fn active(stage: usize, target: f64) -> Self {
        Self {
            target: target.max(0.0),
            stage: Some(stage),
            drain_requested: false,
        }
    }

    fn drained() -> Self {
        Self {
            target: 0.0,
            stage: None,
            drain_requested: true,
        }
    }
}

/// Ordered stage list plus the target in effect before the first stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    start_target: f64,
    stages: Vec<StageSpec>,
    total: Duration,
}

impl StageSchedule {
    /// Build a schedule, rejecting negative or non-finite targets.
    pub fn new(start_target: f64, stages: Vec<StageSpec>) -> CoreResult<Self> {
        if !start_target.is_finite() || start_target < 0.0 {
            return Err(CoreError::validation(format!(
                "start target must be a non-negative number, got {}",
                start_target
            )));
        }

        for (index, stage) in stages.iter().enumerate() {
            if !stage.target.is_finite() || stage.target < 0.0 {
                return Err(CoreError::validation(format!(
                    "stage {} target must be a non-negative number, got {}",
                    index, stage.target
                )));
            }
        }

        let total = stages.iter().map(|s| s.duration).sum();

        Ok(Self {
            start_target,
            stages,
            total,
        })
    }

    /// Target in effect before the first stage starts.
    pub fn start_target(&self) -> f64 {
        self.start_target
    }

    /// Declared stages, in order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Largest target the schedule ever asks for.
    pub fn peak_target(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, f64::max)
    }

    /// Offset from test start at which stage `index` begins.
    pub fn stage_start(&self, index: usize) -> Option<Duration> {
        if index >= self.stages.len() {
            return None;
        }
        Some(self.stages[..index].iter().map(|s| s.duration).sum())
    }

    /// Index of the stage in effect at `elapsed`; `None` once drained.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        self.sample(elapsed).stage
    }

    /// Get the target at a given time offset from test start.
    pub fn sample(&self, elapsed: Duration) -> ScheduleSample {
        let mut offset = Duration::ZERO;
        let mut carried = self.start_target;

        for (index, stage) in self.stages.iter().enumerate() {
            let end = offset + stage.duration;
            // `elapsed >= offset` holds here, so a stage that matches has a
            // non-zero duration.
            if elapsed < end {
                let progress =
                    (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                let target = carried + (stage.target - carried) * progress;
                return ScheduleSample::active(index, target);
            }
            offset = end;
            carried = stage.target;
        }

        match self.stages.len() {
            0 => ScheduleSample::drained(),
            len if elapsed == self.total => ScheduleSample::active(len - 1, carried),
            _ => ScheduleSample::drained(),
        }
    }

    /// Human-readable description, e.g. `0 → 10 (30s) → 50 (1m)`.
    pub fn description(&self) -> String {
        let mut out = format!("{}", self.start_target);
        for stage in &self.stages {
            out.push_str(&format!(
                " → {} ({})",
                stage.target,
                format_duration(stage.duration)
            ));
        }
        out
    }
}

/// Parse a k6-style duration: `"500ms"`, `"30s"`, `"1m"`, `"2m30s"`, `"1h"`.
///
/// A bare `"0"` is accepted as zero.
pub fn parse_duration(input: &str) -> CoreResult<Duration> {
    let text = input.trim();
    if text.is_empty() {
        return Err(CoreError::invalid_duration(input, "empty duration"));
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = text;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| CoreError::invalid_duration(input, "missing unit"))?;
        if number_len == 0 {
            return Err(CoreError::invalid_duration(input, "expected a number"));
        }

        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| CoreError::invalid_duration(input, "malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: f64 = match &rest[..unit_len] {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => {
                return Err(CoreError::invalid_duration(
                    input,
                    format!("unknown unit `{}`", other),
                ))
            }
        };
        rest = &rest[unit_len..];

        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
    }

    Ok(total)
}

/// Format a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }

    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    out
}

/// Display wrapper used in log lines.
pub struct DisplayDuration(pub Duration);

impl fmt::Display for DisplayDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

/// Serde adapter reading and writing durations as k6-style strings.
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

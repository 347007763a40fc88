//! Metric sink: named counters, rates, trends and gauges
//!
//! A [`MetricSink`] is an injected handle, cheap to clone, shared by every
//! worker of one run. Two runs in the same process never see each other's
//! samples. Counters, rates and gauges accumulate in atomics; trends keep
//! every observation behind a mutex so that arbitrary percentiles can be
//! computed at evaluation time.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Metric names written by the harness.
pub mod names {
    pub const ENQUEUE_SUCCESS: &str = "enqueue_success";
    pub const ENQUEUE_FAIL: &str = "enqueue_fail";
    pub const ENQUEUE_LATENCY: &str = "enqueue_latency";
    pub const POSITION_SUCCESS: &str = "position_success";
    pub const POSITION_FAIL: &str = "position_fail";
    pub const POSITION_LATENCY: &str = "position_latency";
    pub const ERROR_RATE: &str = "error_rate";

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const CHECKS: &str = "checks";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
}

/// Kind of a named metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Trend => "trend",
            Self::Gauge => "gauge",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Accumulator {
    Counter(AtomicU64),
    Rate { passes: AtomicU64, total: AtomicU64 },
    Trend(Mutex<Vec<f64>>),
    // f64 bit patterns
    Gauge { value: AtomicU64, max: AtomicU64 },
}

impl Accumulator {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(AtomicU64::new(0)),
            MetricKind::Rate => Self::Rate {
                passes: AtomicU64::new(0),
                total: AtomicU64::new(0),
            },
            MetricKind::Trend => Self::Trend(Mutex::new(Vec::new())),
            MetricKind::Gauge => Self::Gauge {
                value: AtomicU64::new(0f64.to_bits()),
                max: AtomicU64::new(0f64.to_bits()),
            },
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
            Self::Gauge { .. } => MetricKind::Gauge,
        }
    }

    fn snapshot(&self) -> MetricValue {
        match self {
            Self::Counter(count) => MetricValue::Counter {
                count: count.load(Ordering::Relaxed),
            },
            Self::Rate { passes, total } => MetricValue::Rate {
                passes: passes.load(Ordering::Relaxed),
                total: total.load(Ordering::Relaxed),
            },
            Self::Trend(samples) => MetricValue::Trend(TrendSamples::new(samples.lock().clone())),
            Self::Gauge { value, max } => MetricValue::Gauge {
                value: f64::from_bits(value.load(Ordering::Relaxed)),
                max: f64::from_bits(max.load(Ordering::Relaxed)),
            },
        }
    }
}

/// Thread-safe, per-run metric registry.
#[derive(Debug, Clone, Default)]
pub struct MetricSink {
    metrics: Arc<RwLock<HashMap<String, Arc<Accumulator>>>>,
}

impl MetricSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to a counter.
    pub fn increment_counter(&self, name: &str, n: u64) {
        if let Some(acc) = self.accumulator(name, MetricKind::Counter) {
            if let Accumulator::Counter(count) = acc.as_ref() {
                count.fetch_add(n, Ordering::Relaxed);
            }
        }
    }

    /// Record one boolean observation into a rate.
    pub fn observe_rate(&self, name: &str, success: bool) {
        if let Some(acc) = self.accumulator(name, MetricKind::Rate) {
            if let Accumulator::Rate { passes, total } = acc.as_ref() {
                if success {
                    passes.fetch_add(1, Ordering::Relaxed);
                }
                total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record one numeric observation into a trend.
    pub fn observe_trend(&self, name: &str, value: f64) {
        if let Some(acc) = self.accumulator(name, MetricKind::Trend) {
            if let Accumulator::Trend(samples) = acc.as_ref() {
                samples.lock().push(value);
            }
        }
    }

    /// Set a gauge to its current value, remembering the maximum seen.
    pub fn set_gauge(&self, name: &str, value: f64) {
        if let Some(acc) = self.accumulator(name, MetricKind::Gauge) {
            if let Accumulator::Gauge { value: current, max } = acc.as_ref() {
                current.store(value.to_bits(), Ordering::Relaxed);
                let _ = max.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    (value > f64::from_bits(bits)).then(|| value.to_bits())
                });
            }
        }
    }

    /// Copy out every metric's current state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read();
        MetricsSnapshot {
            metrics: metrics
                .iter()
                .map(|(name, acc)| (name.clone(), acc.snapshot()))
                .collect(),
        }
    }

    fn accumulator(&self, name: &str, kind: MetricKind) -> Option<Arc<Accumulator>> {
        if let Some(acc) = self.metrics.read().get(name) {
            return Self::check_kind(name, acc, kind);
        }

        let mut metrics = self.metrics.write();
        let acc = metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Accumulator::new(kind)));
        Self::check_kind(name, acc, kind)
    }

    fn check_kind(name: &str, acc: &Arc<Accumulator>, kind: MetricKind) -> Option<Arc<Accumulator>> {
        if acc.kind() == kind {
            Some(Arc::clone(acc))
        } else {
            warn!(
                metric = name,
                registered = %acc.kind(),
                attempted = %kind,
                "Metric kind mismatch, sample dropped"
            );
            None
        }
    }
}

/// Point-in-time copy of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter { count: u64 },
    Rate { passes: u64, total: u64 },
    Trend(TrendSamples),
    Gauge { value: f64, max: f64 },
}

impl MetricValue {
    /// Kind of this value.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
            Self::Gauge { .. } => MetricKind::Gauge,
        }
    }

    /// Fraction of passing observations (0.0-1.0); zero for an empty rate.
    pub fn rate(&self) -> f64 {
        match self {
            Self::Rate { passes, total } if *total > 0 => *passes as f64 / *total as f64,
            _ => 0.0,
        }
    }

    /// Number of observations (counter total, rate observations, trend samples).
    pub fn count(&self) -> u64 {
        match self {
            Self::Counter { count } => *count,
            Self::Rate { total, .. } => *total,
            Self::Trend(samples) => samples.count() as u64,
            Self::Gauge { .. } => 1,
        }
    }
}

/// Sorted copy of a trend's observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSamples {
    sorted: Vec<f64>,
}

impl TrendSamples {
    /// Sort `samples` and wrap them. NaN observations are discarded.
    pub fn new(mut samples: Vec<f64>) -> Self {
        samples.retain(|v| !v.is_nan());
        samples.sort_by(f64::total_cmp);
        Self { sorted: samples }
    }

    pub fn count(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn min(&self) -> f64 {
        self.sorted.first().copied().unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.sorted.last().copied().unwrap_or(0.0)
    }

    pub fn avg(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        self.sorted.iter().sum::<f64>() / self.sorted.len() as f64
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    /// Percentile `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> f64 {
        percentile(&self.sorted, p)
    }
}

/// Percentile of an ascending sample set, interpolating linearly between the
/// closest ranks. Empty input yields zero.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Every metric of a run at one instant, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, MetricValue>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    /// Counter total, zero when the counter was never written.
    pub fn counter(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(MetricValue::Counter { count }) => *count,
            _ => 0,
        }
    }

    /// Rate value, zero when the rate was never written.
    pub fn rate(&self, name: &str) -> f64 {
        self.metrics.get(name).map(MetricValue::rate).unwrap_or(0.0)
    }

    /// Trend samples, if the trend was written.
    pub fn trend(&self, name: &str) -> Option<&TrendSamples> {
        match self.metrics.get(name) {
            Some(MetricValue::Trend(samples)) => Some(samples),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

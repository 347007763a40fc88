//! Threshold parsing and evaluation
//!
//! A threshold pairs a metric name with an expression such as `p(95)<2000`
//! or `rate<0.1`. Thresholds are a reporting concern: a breach marks the run
//! as failed. Only thresholds flagged `abort_on_fail` stop a run early.

use crate::error::{CoreError, CoreResult};
use crate::metrics::{MetricValue, MetricsSnapshot, TrendSamples};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Statistic a threshold reads from a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    Percentile(f64),
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
            Self::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => observed == bound,
            Self::Ne => observed != bound,
        }
    }
}

/// Parsed `<statistic> <operator> <bound>` expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub bound: f64,
}

impl ThresholdExpr {
    /// Parse an expression declared on `metric`.
    pub fn parse(metric: &str, expression: &str) -> CoreResult<Self> {
        let invalid = |reason: &str| CoreError::invalid_threshold(metric, expression, reason);
        let text: String = expression.chars().filter(|c| !c.is_whitespace()).collect();

        let (statistic, rest) = if let Some(after) = text.strip_prefix("p(") {
            let close = after.find(')').ok_or_else(|| invalid("unclosed `p(`"))?;
            let p: f64 = after[..close]
                .parse()
                .map_err(|_| invalid("percentile is not a number"))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(invalid("percentile must be within 0-100"));
            }
            (Statistic::Percentile(p), &after[close + 1..])
        } else {
            let name_len = text
                .find(|c: char| !c.is_ascii_alphabetic())
                .ok_or_else(|| invalid("missing comparison"))?;
            let statistic = match &text[..name_len] {
                "avg" => Statistic::Avg,
                "min" => Statistic::Min,
                "max" => Statistic::Max,
                "med" => Statistic::Med,
                "count" => Statistic::Count,
                "rate" => Statistic::Rate,
                "value" => Statistic::Value,
                "" => return Err(invalid("missing statistic")),
                _ => return Err(invalid("unknown statistic")),
            };
            (statistic, &text[name_len..])
        };

        let (comparison, bound) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .iter()
        .find_map(|(symbol, op)| rest.strip_prefix(symbol).map(|b| (*op, b)))
        .ok_or_else(|| invalid("missing comparison"))?;

        let bound: f64 = bound.parse().map_err(|_| invalid("bound is not a number"))?;

        Ok(Self {
            statistic,
            comparison,
            bound,
        })
    }

    /// Read the statistic from a metric value. `None` when the statistic does
    /// not apply to the metric's kind.
    fn observe(&self, value: Option<&MetricValue>, elapsed: Duration) -> Option<f64> {
        let empty = TrendSamples::default();
        match (value, self.statistic) {
            (Some(MetricValue::Trend(samples)), stat) => trend_statistic(samples, stat),
            (Some(MetricValue::Rate { .. }), Statistic::Rate) => value.map(MetricValue::rate),
            (Some(MetricValue::Counter { count }), Statistic::Count) => Some(*count as f64),
            (Some(MetricValue::Counter { count }), Statistic::Rate) => {
                let secs = elapsed.as_secs_f64();
                Some(if secs > 0.0 { *count as f64 / secs } else { 0.0 })
            }
            (Some(MetricValue::Gauge { value, .. }), Statistic::Value) => Some(*value),
            (Some(MetricValue::Gauge { max, .. }), Statistic::Max) => Some(*max),
            (Some(_), _) => None,
            // Never written: evaluate as an empty aggregate.
            (None, Statistic::Rate | Statistic::Count | Statistic::Value) => Some(0.0),
            (None, stat) => trend_statistic(&empty, stat),
        }
    }
}

fn trend_statistic(samples: &TrendSamples, statistic: Statistic) -> Option<f64> {
    match statistic {
        Statistic::Avg => Some(samples.avg()),
        Statistic::Min => Some(samples.min()),
        Statistic::Max => Some(samples.max()),
        Statistic::Med => Some(samples.med()),
        Statistic::Count => Some(samples.count() as f64),
        Statistic::Percentile(p) => Some(samples.percentile(p)),
        Statistic::Rate | Statistic::Value => None,
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.statistic, self.comparison.symbol(), self.bound)
    }
}

/// Declared threshold on one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric_name: String,
    pub expression: String,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

impl ThresholdSpec {
    pub fn new(metric_name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            expression: expression.into(),
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        }
    }

    /// Stop the run as soon as this threshold is breached, once `delay` has
    /// elapsed since the first stage started.
    pub fn with_abort_on_fail(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }
}

/// Result of evaluating one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone)]
struct CompiledThreshold {
    spec: ThresholdSpec,
    expr: ThresholdExpr,
}

impl CompiledThreshold {
    fn evaluate(&self, snapshot: &MetricsSnapshot, elapsed: Duration) -> ThresholdOutcome {
        let observed = self
            .expr
            .observe(snapshot.get(&self.spec.metric_name), elapsed);
        let passed = observed
            .map(|v| self.expr.comparison.holds(v, self.expr.bound))
            .unwrap_or(false);

        ThresholdOutcome {
            metric: self.spec.metric_name.clone(),
            expression: self.spec.expression.clone(),
            observed,
            passed,
        }
    }
}

/// Every threshold of a run, parsed up front.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    thresholds: Vec<CompiledThreshold>,
}

impl ThresholdSet {
    /// Compile every threshold; the first malformed expression is returned as an error.
    pub fn compile(specs: Vec<ThresholdSpec>) -> CoreResult<Self> {
        let thresholds = specs
            .into_iter()
            .map(|spec| {
                let expr = ThresholdExpr::parse(&spec.metric_name, &spec.expression)?;
                Ok(CompiledThreshold { spec, expr })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Self { thresholds })
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// True when any threshold may stop the run early.
    pub fn has_abort_on_fail(&self) -> bool {
        self.thresholds.iter().any(|t| t.spec.abort_on_fail)
    }

    /// Evaluate every threshold. `elapsed` is the run time used for
    /// per-second counter rates.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot, elapsed: Duration) -> Vec<ThresholdOutcome> {
        self.thresholds
            .iter()
            .map(|t| t.evaluate(snapshot, elapsed))
            .collect()
    }

    /// First breached `abort_on_fail` threshold whose delay has elapsed.
    pub fn abort_breach(
        &self,
        snapshot: &MetricsSnapshot,
        elapsed: Duration,
    ) -> Option<ThresholdOutcome> {
        self.thresholds
            .iter()
            .filter(|t| t.spec.abort_on_fail && elapsed >= t.spec.delay_abort_eval)
            .map(|t| t.evaluate(snapshot, elapsed))
            .find(|outcome| !outcome.passed)
    }
}

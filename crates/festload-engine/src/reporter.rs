//! Report generation for load test runs

use crate::error::{RunError, RunResult};
use crate::orchestrator::RunReport;
use festload_core::{AbortReason, MetricValue, TrendSamples};
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// End-of-test summary for the console
    Text,
    Json,
    Markdown,
    /// Prometheus text exposition
    Prometheus,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            other => Err(format!(
                "unknown report format '{}', expected text, json, markdown or prometheus",
                other
            )),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Prometheus => "prometheus",
        };
        f.write_str(name)
    }
}

const TREND_STATS: [(&str, Option<f64>); 6] = [
    ("avg", None),
    ("min", Some(0.0)),
    ("med", Some(50.0)),
    ("max", Some(100.0)),
    ("p(90)", Some(90.0)),
    ("p(95)", Some(95.0)),
];

fn trend_stat(samples: &TrendSamples, percentile: Option<f64>) -> f64 {
    match percentile {
        None => samples.avg(),
        Some(p) => samples.percentile(p),
    }
}

/// Result writer for generating run reports
pub struct ResultWriter {
    report: RunReport,
}

impl ResultWriter {
    pub fn new(report: RunReport) -> Self {
        Self { report }
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Check if every threshold passed
    pub fn passes(&self) -> bool {
        self.report.thresholds_passed()
    }

    /// One line per failed threshold
    pub fn failure_summary(&self) -> String {
        let failures: Vec<String> = self
            .report
            .failed_thresholds()
            .map(|t| {
                format!(
                    "{}: {} (observed {})",
                    t.metric,
                    t.expression,
                    observed(t.observed)
                )
            })
            .collect();

        if failures.is_empty() {
            return "All thresholds passed".to_string();
        }
        failures.join("\n")
    }

    /// Write report to file
    pub fn write_report(&self, path: impl AsRef<Path>, format: ReportFormat) -> RunResult<()> {
        let content = self.render(format)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    pub fn render(&self, format: ReportFormat) -> RunResult<String> {
        match format {
            ReportFormat::Text => Ok(self.generate_text()),
            ReportFormat::Json => serde_json::to_string_pretty(&self.generate_json())
                .map_err(|e| RunError::report(e.to_string())),
            ReportFormat::Markdown => Ok(self.generate_markdown()),
            ReportFormat::Prometheus => self.generate_prometheus(),
        }
    }

    fn status(&self) -> &'static str {
        if self.passes() {
            "PASSED"
        } else {
            "FAILED"
        }
    }

    fn aborted(&self) -> Option<String> {
        self.report.aborted.as_ref().map(|reason| match reason {
            AbortReason::Interrupted => "interrupted".to_string(),
            AbortReason::ThresholdBreached { metric, expression } => {
                format!("threshold {} {} breached", metric, expression)
            }
        })
    }

    fn metric_summary(&self, value: &MetricValue) -> String {
        let secs = self.report.test_duration().as_secs_f64();
        match value {
            MetricValue::Counter { count } => {
                let per_sec = if secs > 0.0 { *count as f64 / secs } else { 0.0 };
                format!("{} {:.2}/s", count, per_sec)
            }
            MetricValue::Rate { passes, total } => format!(
                "{:.2}% ✓ {} ✗ {}",
                value.rate() * 100.0,
                passes,
                total.saturating_sub(*passes)
            ),
            MetricValue::Trend(samples) => TREND_STATS
                .iter()
                .map(|(label, p)| format!("{}={:.2}", label, trend_stat(samples, *p)))
                .collect::<Vec<_>>()
                .join(" "),
            MetricValue::Gauge { value, max } => format!("{} max={}", value, max),
        }
    }

    /// k6-style end-of-test summary
    fn generate_text(&self) -> String {
        let r = &self.report;
        let mut out = String::new();

        out.push_str(&format!(
            "\n  scenario: {}  status: {}  duration: {}\n",
            r.scenario,
            self.status(),
            festload_core::format_duration(r.test_duration())
        ));
        out.push_str(&format!(
            "  setup: {}/{} identities  iterations: {}  dropped: {}  peak workers: {}\n",
            r.setup.issued, r.setup.planned, r.pool.iterations, r.pool.dropped, r.pool.peak_workers
        ));
        if let Some(reason) = self.aborted() {
            out.push_str(&format!("  aborted: {}\n", reason));
        }

        if !r.thresholds.is_empty() {
            out.push_str("\n  thresholds\n");
            for t in &r.thresholds {
                out.push_str(&format!(
                    "    {} {} {} (observed {})\n",
                    if t.passed { "✓" } else { "✗" },
                    t.metric,
                    t.expression,
                    observed(t.observed)
                ));
            }
        }

        let width = r.metrics.metrics.keys().map(String::len).max().unwrap_or(0) + 3;
        out.push_str("\n  metrics\n");
        for (name, value) in &r.metrics.metrics {
            out.push_str(&format!(
                "    {:.<width$}: {}\n",
                name,
                self.metric_summary(value),
                width = width
            ));
        }
        out
    }

    /// Generate JSON report
    fn generate_json(&self) -> Value {
        let r = &self.report;
        let mut metrics = Map::new();

        for (name, value) in &r.metrics.metrics {
            let values = match value {
                MetricValue::Counter { count } => json!({ "count": count }),
                MetricValue::Rate { passes, total } => json!({
                    "rate": value.rate(),
                    "passes": passes,
                    "fails": total.saturating_sub(*passes),
                }),
                MetricValue::Trend(samples) => {
                    let mut stats = Map::new();
                    for (label, p) in TREND_STATS {
                        stats.insert(label.to_string(), json!(trend_stat(samples, p)));
                    }
                    stats.insert("count".to_string(), json!(samples.count()));
                    Value::Object(stats)
                }
                MetricValue::Gauge { value, max } => json!({ "value": value, "max": max }),
            };
            metrics.insert(
                name.clone(),
                json!({ "type": value.kind().to_string(), "values": values }),
            );
        }

        json!({
            "scenario": r.scenario,
            "status": self.status().to_lowercase(),
            "started_at": r.started_at.to_rfc3339(),
            "finished_at": r.finished_at.to_rfc3339(),
            "duration_seconds": r.test_duration().as_secs_f64(),
            "aborted": self.aborted(),
            "setup": r.setup,
            "pool": r.pool,
            "teardown": r.teardown,
            "thresholds": r.thresholds,
            "metrics": metrics,
        })
    }

    /// Generate Markdown report
    fn generate_markdown(&self) -> String {
        let r = &self.report;
        let pass_emoji = if self.passes() { "✅" } else { "❌" };

        let mut thresholds = String::from("| Metric | Expression | Observed | Status |\n|---|---|---|---|\n");
        for t in &r.thresholds {
            thresholds.push_str(&format!(
                "| {} | `{}` | {} | {} |\n",
                t.metric,
                t.expression,
                observed(t.observed),
                if t.passed { "✅" } else { "❌" }
            ));
        }

        let mut metrics = String::from("| Metric | Type | Value |\n|---|---|---|\n");
        for (name, value) in &r.metrics.metrics {
            metrics.push_str(&format!(
                "| {} | {} | {} |\n",
                name,
                value.kind(),
                self.metric_summary(value)
            ));
        }

        format!(
            r#"# Load Test Report: {}

**Status**: {} {}

---

## Summary

- **Started**: {}
- **Duration**: {:.1} seconds
- **Identities**: {} of {} issued
- **Iterations**: {}
- **Dropped iterations**: {}
- **Peak workers**: {}
- **Teardown**: {} cancels, {} failed
- **Aborted**: {}

---

## Thresholds

{}
---

## Metrics

{}
---

**Report Generated**: {}
"#,
            r.scenario,
            pass_emoji,
            self.status(),
            r.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            r.test_duration().as_secs_f64(),
            r.setup.issued,
            r.setup.planned,
            r.pool.iterations,
            r.pool.dropped,
            r.pool.peak_workers,
            r.teardown.attempted,
            r.teardown.failed,
            self.aborted().unwrap_or_else(|| "no".to_string()),
            thresholds,
            metrics,
            r.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Prometheus text exposition built from a registry owned by this report
    fn generate_prometheus(&self) -> RunResult<String> {
        let registry = Registry::new();
        let prom = |e: prometheus::Error| RunError::report(e.to_string());

        for (name, value) in &self.report.metrics.metrics {
            let base = format!("festload_{}", name);
            match value {
                MetricValue::Counter { count } => {
                    let counter = IntCounter::with_opts(Opts::new(
                        format!("{}_total", base),
                        format!("Counter {}", name),
                    ))
                    .map_err(prom)?;
                    counter.inc_by(*count);
                    registry.register(Box::new(counter)).map_err(prom)?;
                }
                MetricValue::Rate { .. } => {
                    let gauge =
                        Gauge::with_opts(Opts::new(format!("{}_rate", base), format!("Rate {}", name)))
                            .map_err(prom)?;
                    gauge.set(value.rate());
                    registry.register(Box::new(gauge)).map_err(prom)?;
                }
                MetricValue::Trend(samples) => {
                    let gauges = GaugeVec::new(
                        Opts::new(base.clone(), format!("Trend {} by statistic", name)),
                        &["stat"],
                    )
                    .map_err(prom)?;
                    for (label, p) in TREND_STATS {
                        gauges
                            .with_label_values(&[label])
                            .set(trend_stat(samples, p));
                    }
                    registry.register(Box::new(gauges)).map_err(prom)?;
                }
                MetricValue::Gauge { value, .. } => {
                    let gauge = Gauge::with_opts(Opts::new(base, format!("Gauge {}", name)))
                        .map_err(prom)?;
                    gauge.set(*value);
                    registry.register(Box::new(gauge)).map_err(prom)?;
                }
            }
        }

        let thresholds = GaugeVec::new(
            Opts::new("festload_threshold_passed", "1 when the threshold passed"),
            &["metric", "expression"],
        )
        .map_err(prom)?;
        for t in &self.report.thresholds {
            thresholds
                .with_label_values(&[&t.metric, &t.expression])
                .set(if t.passed { 1.0 } else { 0.0 });
        }
        registry.register(Box::new(thresholds)).map_err(prom)?;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prom)?;
        String::from_utf8(buffer).map_err(|e| RunError::report(e.to_string()))
    }
}

fn observed(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "n/a".to_string())
}

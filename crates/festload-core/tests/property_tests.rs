// Property-based tests for stage schedules, percentiles and threshold parsing
//
// Properties tested:
// 1. Stage boundaries: the target at the end of a stage equals its declared target
// 2. Interpolation stays between the neighbouring targets and is never negative
// 3. Every instant after the last stage asks for a drain
// 4. Percentiles are monotone in p and bounded by min/max
// 5. Formatted threshold expressions parse back to the same expression

use festload_core::metrics::percentile;
use festload_core::threshold::ThresholdExpr;
use festload_core::{format_duration, parse_duration, StageSchedule, StageSpec};
use proptest::prelude::*;
use std::time::Duration;

fn stages_strategy() -> impl Strategy<Value = Vec<StageSpec>> {
    prop::collection::vec((1u64..=600, 0u32..=500), 1..8).prop_map(|raw| {
        raw.into_iter()
            .map(|(secs, target)| StageSpec::new(Duration::from_secs(secs), target as f64))
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_stage_end_hits_declared_target(
        start in 0u32..=100,
        stages in stages_strategy(),
    ) {
        let schedule = StageSchedule::new(start as f64, stages.clone()).unwrap();

        let mut end = Duration::ZERO;
        for (index, stage) in stages.iter().enumerate() {
            end += stage.duration;
            let sample = schedule.sample(end);
            prop_assert!(!sample.drain_requested);
            prop_assert!(
                (sample.target - stage.target).abs() < 1e-9,
                "stage {} ends at {} but sampled {}",
                index,
                stage.target,
                sample.target
            );
        }
    }

    #[test]
    fn prop_interpolation_is_bounded(
        start in 0u32..=100,
        stages in stages_strategy(),
        fraction in 0.0f64..1.0,
    ) {
        let schedule = StageSchedule::new(start as f64, stages.clone()).unwrap();
        let elapsed = schedule.total_duration().mul_f64(fraction);
        let sample = schedule.sample(elapsed);

        let index = sample.stage.unwrap();
        let from = if index == 0 { start as f64 } else { stages[index - 1].target };
        let to = stages[index].target;

        prop_assert!(sample.target >= 0.0);
        prop_assert!(sample.target >= from.min(to) - 1e-9);
        prop_assert!(sample.target <= from.max(to) + 1e-9);
    }

    #[test]
    fn prop_drain_after_total(
        stages in stages_strategy(),
        extra_ms in 1u64..=100_000,
    ) {
        let schedule = StageSchedule::new(0.0, stages).unwrap();
        let sample = schedule.sample(schedule.total_duration() + Duration::from_millis(extra_ms));

        prop_assert!(sample.drain_requested);
        prop_assert_eq!(sample.target, 0.0);
    }

    #[test]
    fn prop_percentile_monotone_and_bounded(
        mut samples in prop::collection::vec(0.0f64..10_000.0, 1..200),
        p1 in 0.0f64..=100.0,
        p2 in 0.0f64..=100.0,
    ) {
        samples.sort_by(f64::total_cmp);
        let (lo, hi) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };

        let a = percentile(&samples, lo);
        let b = percentile(&samples, hi);
        prop_assert!(a <= b + 1e-9);
        prop_assert!(a >= samples[0] - 1e-9);
        prop_assert!(b <= samples[samples.len() - 1] + 1e-9);
    }

    #[test]
    fn prop_threshold_display_parses_back(
        p in 1u32..=99,
        bound in 0u32..=100_000,
        op in prop::sample::select(vec!["<", "<=", ">", ">=", "==", "!="]),
    ) {
        let text = format!("p({}){}{}", p, op, bound);
        let parsed = ThresholdExpr::parse("http_req_duration", &text).unwrap();
        let reparsed = ThresholdExpr::parse("http_req_duration", &parsed.to_string()).unwrap();

        prop_assert_eq!(parsed, reparsed);
    }

    #[test]
    fn prop_duration_format_parses_back(ms in 0u64..=10_000_000) {
        let duration = Duration::from_millis(ms);
        prop_assert_eq!(parse_duration(&format_duration(duration)).unwrap(), duration);
    }
}

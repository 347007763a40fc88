//! Console rendering of run events

use festload_core::{AbortReason, DisplayDuration, RunEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Render events until every publisher is gone.
pub fn spawn_observer(mut events: broadcast::Receiver<RunEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = render(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Console observer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Console line for `event`; `None` for events too frequent to print.
pub fn render(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::SetupStarted { planned } => Some(format!("🔐 Logging in {} identities...", planned)),
        RunEvent::SetupProgress {
            attempted,
            issued,
            planned,
        } => Some(format!("   {}/{} logins attempted, {} issued", attempted, planned, issued)),
        RunEvent::SetupCompleted { issued, planned } => {
            Some(format!("✅ Setup complete: {}/{} tokens", issued, planned))
        }
        RunEvent::StageStarted {
            index,
            target,
            duration,
        } => Some(format!(
            "▶️  Stage {}: ramp to {} over {}",
            index + 1,
            target,
            DisplayDuration(*duration)
        )),
        RunEvent::PoolResized { from, to, target } => {
            debug!(from, to, target, "Pool resized");
            None
        }
        RunEvent::DrainRequested { elapsed } => Some(format!(
            "⏹️  Stages complete after {}, draining workers",
            DisplayDuration(*elapsed)
        )),
        RunEvent::PoolStopped { iterations, dropped } => Some(if *dropped > 0 {
            format!("   {} iterations, {} dropped", iterations, dropped)
        } else {
            format!("   {} iterations", iterations)
        }),
        RunEvent::RunAborted { reason } => {
            let line = match reason {
                AbortReason::Interrupted => "⚠️  Interrupted, finishing in-flight iterations".to_string(),
                AbortReason::ThresholdBreached { metric, expression } => {
                    format!("❌ Threshold {} {} breached, aborting", metric, expression)
                }
            };
            warn!("{}", line);
            Some(line)
        }
        RunEvent::TeardownStarted { credentials } => {
            Some(format!("🧹 Cancelling {} queue entries...", credentials))
        }
        RunEvent::TeardownProgress { done, total } => Some(format!("   {}/{} cancelled", done, total)),
        RunEvent::TeardownCompleted { attempted, failed } => Some(if *failed > 0 {
            format!("⚠️  Teardown complete: {} of {} cancels failed", failed, attempted)
        } else {
            format!("✅ Teardown complete: {} cancels", attempted)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use festload_core::EventBus;
    use std::time::Duration;

    #[test]
    fn test_render_skips_resizes() {
        assert!(render(&RunEvent::PoolResized {
            from: 1,
            to: 2,
            target: 2.5
        })
        .is_none());
    }

    #[test]
    fn test_render_stage_is_one_based() {
        let line = render(&RunEvent::StageStarted {
            index: 0,
            target: 50.0,
            duration: Duration::from_secs(90),
        })
        .unwrap();

        assert!(line.contains("Stage 1: ramp to 50 over 1m30s"));
    }

    #[test]
    fn test_render_threshold_abort() {
        let line = render(&RunEvent::RunAborted {
            reason: AbortReason::ThresholdBreached {
                metric: "http_req_failed".to_string(),
                expression: "rate<0.1".to_string(),
            },
        })
        .unwrap();

        assert!(line.contains("http_req_failed rate<0.1"));
    }

    #[tokio::test]
    async fn test_observer_stops_when_bus_dropped() {
        let bus = EventBus::default();
        let handle = spawn_observer(bus.subscribe());

        bus.publish(RunEvent::SetupStarted { planned: 1 });
        drop(bus);

        handle.await.unwrap();
    }
}

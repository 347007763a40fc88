use clap::{Parser, Subcommand};
use festload_core::{DisplayDuration, LoadTestConfig, Preset, StageSchedule};
use festload_engine::{
    HttpTargetConfig, HttpTargetService, LoadTestOrchestrator, ReportFormat, ResultWriter,
    RunReport,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod observer;

use observer::spawn_observer;

/// Every threshold passed
const EXIT_PASSED: u8 = 0;
/// Setup, config or I/O failure
const EXIT_ERROR: u8 = 1;
/// At least one threshold failed
const EXIT_THRESHOLDS_FAILED: u8 = 99;
/// Interrupted by the operator
const EXIT_INTERRUPTED: u8 = 105;

#[derive(Parser, Debug)]
#[command(name = "festload")]
#[command(about = "Load generator for the festin waiting-queue service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a load test
    Run {
        /// Built-in scenario the config starts from (ramp or spike)
        #[arg(long, default_value = "ramp", value_parser = Preset::from_str)]
        preset: Preset,

        /// JSON/TOML/YAML file layered over the preset
        #[arg(long, env = "FESTLOAD_CONFIG")]
        config: Option<PathBuf>,

        /// Write the report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Report file format (defaults from the file extension)
        #[arg(long, value_parser = ReportFormat::from_str)]
        format: Option<ReportFormat>,
    },

    /// Print a preset as a JSON config template
    InitConfig {
        #[arg(long, default_value = "ramp", value_parser = Preset::from_str)]
        preset: Preset,

        /// Output file (defaults to stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show the resolved stage schedule
    ShowStages {
        #[arg(long, default_value = "ramp", value_parser = Preset::from_str)]
        preset: Preset,

        #[arg(long, env = "FESTLOAD_CONFIG")]
        config: Option<PathBuf>,

        /// Print stages as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            preset,
            config,
            report,
            format,
        } => {
            let config = LoadTestConfig::load(preset, config.as_deref())?;
            match run(config, report, format).await {
                Ok(code) => Ok(ExitCode::from(code)),
                Err(e) => {
                    error!(error = %e, "Load test failed");
                    println!("❌ {}", e);
                    Ok(ExitCode::from(EXIT_ERROR))
                }
            }
        }

        Commands::InitConfig { preset, output } => {
            let json = LoadTestConfig::preset(preset).to_json_pretty()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("✅ Wrote {} config to {}", preset, path.display());
                }
                None => println!("{}", json),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::ShowStages {
            preset,
            config,
            json,
        } => {
            let config = LoadTestConfig::load(preset, config.as_deref())?;
            let schedule = config.schedule()?;

            if json {
                println!("{}", serde_json::to_string_pretty(schedule.stages())?);
                return Ok(ExitCode::SUCCESS);
            }

            println!("Scenario: {}", config.scenario.name);
            println!("Stages: {}", schedule.description());
            for line in stage_lines(&schedule) {
                println!("{}", line);
            }
            println!("Total: {}", DisplayDuration(schedule.total_duration()));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One line per stage with the window it covers.
fn stage_lines(schedule: &StageSchedule) -> Vec<String> {
    schedule
        .stages()
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let start = schedule.stage_start(i).unwrap_or_default();
            format!(
                "  {}. {:>8} -> {:<6} ({} to {})",
                i + 1,
                DisplayDuration(stage.duration).to_string(),
                stage.target,
                DisplayDuration(start),
                DisplayDuration(start + stage.duration)
            )
        })
        .collect()
}

async fn run(
    config: LoadTestConfig,
    report_path: Option<PathBuf>,
    format: Option<ReportFormat>,
) -> Result<u8, Box<dyn std::error::Error>> {
    let target = HttpTargetService::new(HttpTargetConfig::from(&config.target))?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            interrupt.cancel();
        }
    });

    let orchestrator =
        LoadTestOrchestrator::new(config, Arc::new(target)).with_cancellation(cancel);
    let observer = spawn_observer(orchestrator.events().subscribe());

    let result = orchestrator.run().await;
    // The observer drains once the last publisher is gone.
    drop(orchestrator);
    observer.await?;

    let writer = ResultWriter::new(result?);
    println!("{}", writer.render(ReportFormat::Text)?);

    if let Some(path) = report_path {
        let format = format.unwrap_or_else(|| format_for(&path));
        writer.write_report(&path, format)?;
        info!(path = %path.display(), %format, "Report written");
    }

    if !writer.passes() {
        println!("❌ Thresholds failed:\n{}", writer.failure_summary());
    }
    Ok(exit_status(writer.report()))
}

fn exit_status(report: &RunReport) -> u8 {
    if !report.thresholds_passed() {
        EXIT_THRESHOLDS_FAILED
    } else if report.interrupted() {
        EXIT_INTERRUPTED
    } else {
        EXIT_PASSED
    }
}

/// Report format implied by a file extension.
fn format_for(path: &Path) -> ReportFormat {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ReportFormat::from_str(ext).ok())
        .unwrap_or(ReportFormat::Text)
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}

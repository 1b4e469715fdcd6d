//! CLI entrypoint for the ossync stress harness.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ossync_core::{InstrumentLevel, Platform, PlatformConfig, SemKind, TimerService};
use ossync_harness::scenario::{
    self, MutexStormParams, PersistentParams, SemStatsParams, TimerStormParams,
};
use ossync_harness::{HarnessError, RunArtifacts, ScenarioRunner};

/// Stress tooling for ossync.
#[derive(Debug, Parser)]
#[command(name = "ossync-harness")]
#[command(about = "Stress and verification harness for ossync")]
struct Cli {
    /// Directory receiving logs, reports and the artifact index.
    #[arg(long, global = true, default_value = "target/ossync-harness")]
    out_dir: PathBuf,
    /// Run id stamped into every log entry (default: derived from the clock).
    #[arg(long, global = true)]
    run_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Plain,
    Timed,
}

impl From<KindArg> for SemKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Plain => SemKind::Plain,
            KindArg::Timed => SemKind::Timed,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hammer one semaphore from many threads and check mutual exclusion.
    MutexStorm {
        #[arg(long, default_value_t = 8)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        iterations: u64,
        #[arg(long, value_enum, default_value = "plain")]
        kind: KindArg,
        /// Every n-th attempt uses a zero timeout (0 disables).
        #[arg(long, default_value_t = 4)]
        try_every: u64,
    },
    /// Schedule randomized one-shot requests and check exactly-once, in-order firing.
    TimerStorm {
        #[arg(long, default_value_t = 1_000)]
        requests: usize,
        #[arg(long, default_value_t = 100)]
        max_timeout_ms: u32,
        /// PRNG seed (decimal or 0x...).
        #[arg(long, default_value = "0x5EED")]
        seed: String,
    },
    /// Count firings of one periodic request over a window, then cancel it.
    Persistent {
        #[arg(long, default_value_t = 20)]
        period_ms: u32,
        #[arg(long, default_value_t = 1_000)]
        window_ms: u64,
    },
    /// Run a contended workload on instrumented semaphores and dump per-number statistics.
    SemStats {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 5_000)]
        iterations: u64,
        #[arg(long, default_value_t = 3)]
        sems: u32,
    },
}

fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|_| HarnessError::InvalidArgument(format!("invalid seed '{raw}'")))
}

fn default_run_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("run-{secs}")
}

fn install_platform(command: &Command) -> Result<(), HarnessError> {
    let mut config = PlatformConfig::from_env().map_err(ossync_core::PlatformError::from)?;
    if matches!(command, Command::SemStats { .. }) {
        config.instrument = InstrumentLevel::Stats;
    }
    Platform::install(config)?;
    Ok(())
}

fn run(cli: Cli) -> Result<RunArtifacts, HarnessError> {
    install_platform(&cli.command)?;
    let runner = ScenarioRunner::new(
        &cli.out_dir,
        cli.run_id.clone().unwrap_or_else(default_run_id),
    )?;
    tracing::debug!(out_dir = %runner.out_dir().display(), run_id = runner.run_id(), "harness run");

    match cli.command {
        Command::MutexStorm {
            threads,
            iterations,
            kind,
            try_every,
        } => runner.run("mutex-storm", threads, iterations, || {
            scenario::mutex_storm(MutexStormParams {
                threads,
                iterations,
                kind: kind.into(),
                try_every,
            })
        }),
        Command::TimerStorm {
            requests,
            max_timeout_ms,
            seed,
        } => {
            let seed = parse_seed(&seed)?;
            let timers = TimerService::with_defaults();
            let artifacts = runner.run("timer-storm", 1, requests as u64, || {
                scenario::timer_storm(
                    &timers,
                    TimerStormParams {
                        requests,
                        max_timeout_ms,
                        seed,
                        ..TimerStormParams::default()
                    },
                )
            });
            timers.shutdown();
            artifacts
        }
        Command::Persistent {
            period_ms,
            window_ms,
        } => {
            let timers = TimerService::with_defaults();
            let artifacts = runner.run("persistent", 1, window_ms, || {
                scenario::persistent(
                    &timers,
                    PersistentParams {
                        period_ms,
                        window: Duration::from_millis(window_ms),
                    },
                )
            });
            timers.shutdown();
            artifacts
        }
        Command::SemStats {
            threads,
            iterations,
            sems,
        } => runner.run("sem-stats", threads, iterations, || {
            scenario::sem_stats(SemStatsParams {
                threads,
                iterations,
                sems,
            })
        }),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(artifacts) => {
            println!("{}", artifacts.summary);
            println!("log: {}", artifacts.log.display());
            println!("report: {}", artifacts.report.display());
            println!("index: {}", artifacts.index.display());
            if artifacts.passed {
                ExitCode::SUCCESS
            } else {
                eprintln!("FAIL");
                ExitCode::from(1)
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

//! Stress and verification harness for ossync.
//!
//! This crate provides:
//! - Scenarios: mutex storms, randomized timer storms, persistent timer
//!   cadence and instrumented contention, each yielding a JSON report
//! - Structured logging: JSONL entries per scenario with SHA-256 artifact
//!   indexing
//! - The `harness` binary driving both from the command line

#![forbid(unsafe_code)]

pub mod runner;
pub mod scenario;
pub mod structured_log;

use thiserror::Error;

pub use runner::{RunArtifacts, ScenarioRunner};
pub use scenario::Report;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("platform: {0}")]
    Platform(#[from] ossync_core::PlatformError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{count} worker thread(s) of {scenario} panicked")]
    WorkerPanicked { scenario: &'static str, count: usize },
    #[error("semaphore statistics need the platform installed with OSSYNC_INSTRUMENT=stats")]
    InstrumentationOff,
}

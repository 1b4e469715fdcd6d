//! Scenario execution and evidence output.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::HarnessError;
use crate::scenario::Report;
use crate::structured_log::{ArtifactIndex, LogEmitter, LogLevel, Outcome};

/// Files written for one scenario run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub log: PathBuf,
    pub report: PathBuf,
    pub index: PathBuf,
    pub passed: bool,
    pub summary: String,
}

/// Writes every scenario of a run into one output directory.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    out_dir: PathBuf,
    run_id: String,
}

impl ScenarioRunner {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        run_id: impl Into<String>,
    ) -> Result<Self, HarnessError> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        Ok(Self {
            out_dir,
            run_id: run_id.into(),
        })
    }

    #[must_use]
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run `scenario`, logging its start and verdict, then write its report
    /// and refresh the artifact index. A scenario error is logged before it
    /// is returned.
    pub fn run<R: Report>(
        &self,
        name: &'static str,
        threads: usize,
        iterations: u64,
        scenario: impl FnOnce() -> Result<R, HarnessError>,
    ) -> Result<RunArtifacts, HarnessError> {
        let log_name = format!("{name}.log.jsonl");
        let report_name = format!("{name}.report.json");
        let log_path = self.out_dir.join(&log_name);
        let report_path = self.out_dir.join(&report_name);

        let mut log = LogEmitter::to_file(&log_path, &self.run_id, name)?;
        let start_entry = log
            .entry(LogLevel::Info, "scenario_start")
            .with_workload(threads, iterations);
        log.emit_entry(start_entry)?;
        tracing::info!(scenario = name, threads, iterations, "scenario started");

        let started = Instant::now();
        let result = scenario();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                let entry = log
                    .entry(LogLevel::Error, "scenario_error")
                    .with_outcome(Outcome::Error)
                    .with_duration_ms(duration_ms)
                    .with_details(serde_json::json!({ "error": err.to_string() }));
                log.emit_entry(entry)?;
                log.flush()?;
                tracing::error!(scenario = name, %err, "scenario failed to run");
                return Err(err);
            }
        };

        std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;

        let passed = report.passed();
        let summary = report.summary();
        let level = if passed { LogLevel::Info } else { LogLevel::Error };
        let end_entry = log
            .entry(level, "scenario_end")
            .with_outcome(Outcome::from_passed(passed))
            .with_workload(threads, iterations)
            .with_duration_ms(duration_ms)
            .with_artifacts(vec![report_name.clone()])
            .with_details(serde_json::to_value(&report)?);
        log.emit_entry(end_entry)?;
        log.flush()?;
        drop(log);

        if passed {
            tracing::info!(scenario = name, duration_ms, "{summary}");
        } else {
            tracing::error!(scenario = name, duration_ms, "{summary}");
        }

        let index = self.write_index(&[
            (log_name.as_str(), "log"),
            (report_name.as_str(), "report"),
        ])?;
        Ok(RunArtifacts {
            log: log_path,
            report: report_path,
            index,
            passed,
            summary,
        })
    }

    /// Merge the given files into `artifact_index.json`, replacing entries
    /// with the same path.
    fn write_index(&self, files: &[(&str, &str)]) -> Result<PathBuf, HarnessError> {
        let index_path = self.out_dir.join("artifact_index.json");
        let mut index = match std::fs::read_to_string(&index_path) {
            Ok(text) => match serde_json::from_str::<ArtifactIndex>(&text) {
                Ok(existing) if existing.run_id == self.run_id => existing,
                _ => ArtifactIndex::new(self.run_id.clone()),
            },
            Err(_) => ArtifactIndex::new(self.run_id.clone()),
        };
        for (name, kind) in files {
            index.artifacts.retain(|a| a.path != *name);
            index.add_file(&self.out_dir.join(name), *name, *kind)?;
        }
        std::fs::write(&index_path, index.to_json()?)?;
        Ok(index_path)
    }
}

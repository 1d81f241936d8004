//! Step, scenario and run outcomes, and the sinks they are written to

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::runner::RunState;

/// Report file written into the report directory
pub const REPORT_FILE: &str = "flowprobe-report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed_out",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub step: String,
    pub kind: String,
    pub status: StepStatus,
    pub elapsed_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl StepResult {
    pub fn skipped(index: usize, step: &crate::scenario::Step) -> Self {
        Self {
            index,
            step: step.describe(),
            kind: step.kind().to_string(),
            status: StepStatus::Skipped,
            elapsed_ms: 0,
            message: None,
            error_kind: None,
            optional: step.optional,
        }
    }

    /// Whether this step makes its scenario fail.
    pub fn blocks(&self) -> bool {
        !self.optional && self.status != StepStatus::Passed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Aborted,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Passed => "passed",
            ScenarioStatus::Failed => "failed",
            ScenarioStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub status: ScenarioStatus,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub steps: Vec<StepResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// First required step that did not pass.
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.blocks() && s.status != StepStatus::Skipped)
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub scenarios: Vec<ScenarioResult>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, elapsed_ms: u64, scenarios: Vec<ScenarioResult>) -> Self {
        let count = |status| scenarios.iter().filter(|s| s.status == status).count();
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            elapsed_ms,
            total: scenarios.len(),
            passed: count(ScenarioStatus::Passed),
            failed: count(ScenarioStatus::Failed),
            aborted: count(ScenarioStatus::Aborted),
            scenarios,
        }
    }

    pub fn success(&self) -> bool {
        self.passed == self.total
    }

    /// 0 when every scenario passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn write_to_path(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Write the report into `dir` and return its path.
    pub fn write_results(&self, dir: &Path) -> EngineResult<PathBuf> {
        let path = dir.join(REPORT_FILE);
        self.write_to_path(&path)?;
        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// A durable sink for run outcomes
pub trait Reporter {
    fn report(&mut self, report: &RunReport) -> EngineResult<()>;
}

/// Writes outcomes as log lines
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, report: &RunReport) -> EngineResult<()> {
        for scenario in &report.scenarios {
            for step in &scenario.steps {
                match (step.status, &step.message) {
                    (StepStatus::Passed, _) | (StepStatus::Skipped, _) => {
                        debug!("  [{}] {} {} ({} ms)", step.index, step.status, step.step, step.elapsed_ms)
                    }
                    (status, message) => warn!(
                        "  [{}] {} {} ({} ms): {}",
                        step.index,
                        status,
                        step.step,
                        step.elapsed_ms,
                        message.as_deref().unwrap_or("no message")
                    ),
                }
            }
            if scenario.passed() {
                info!("✓ {} ({} ms)", scenario.name, scenario.elapsed_ms);
            } else {
                error!(
                    "✗ {} [{}] - {}",
                    scenario.name,
                    scenario.status,
                    scenario.message.as_deref().unwrap_or("unknown error")
                );
            }
        }
        info!(
            "Scenario results: {} passed, {} failed, {} aborted ({} ms)",
            report.passed, report.failed, report.aborted, report.elapsed_ms
        );
        Ok(())
    }
}

/// Writes the run report as JSON into a directory
#[derive(Debug, Clone)]
pub struct JsonReporter {
    dir: PathBuf,
    written: Option<PathBuf>,
}

impl JsonReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: None,
        }
    }

    pub fn written(&self) -> Option<&Path> {
        self.written.as_deref()
    }
}

impl Reporter for JsonReporter {
    fn report(&mut self, report: &RunReport) -> EngineResult<()> {
        self.written = Some(report.write_results(&self.dir)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Step;

    fn scenario(name: &str, status: ScenarioStatus) -> ScenarioResult {
        ScenarioResult {
            name: name.into(),
            status,
            state: if status == ScenarioStatus::Aborted {
                RunState::Aborted
            } else {
                RunState::Completed
            },
            started_at: Utc::now(),
            elapsed_ms: 10,
            steps: vec![],
            message: None,
        }
    }

    #[test]
    fn test_exit_code() {
        let ok = RunReport::new(Utc::now(), 5, vec![scenario("a", ScenarioStatus::Passed)]);
        assert!(ok.success());
        assert_eq!(ok.exit_code(), 0);

        let bad = RunReport::new(
            Utc::now(),
            5,
            vec![
                scenario("a", ScenarioStatus::Passed),
                scenario("b", ScenarioStatus::Aborted),
            ],
        );
        assert_eq!(bad.aborted, 1);
        assert_eq!(bad.exit_code(), 1);
    }

    #[test]
    fn test_skipped_step_shape() {
        let step = Step::navigate("/home").optional();
        let result = StepResult::skipped(3, &step);
        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(result.kind, "navigate");
        assert!(!result.blocks());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_json_reporter_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let report = RunReport::new(Utc::now(), 1, vec![scenario("a", ScenarioStatus::Failed)]);
        let mut reporter = JsonReporter::new(dir.path().join("out"));
        reporter.report(&report).unwrap();

        let path = reporter.written().unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["failed"], 1);
        assert_eq!(parsed["scenarios"][0]["state"], "completed");
        assert_eq!(parsed["scenarios"][0]["status"], "failed");
    }
}

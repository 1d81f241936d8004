//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use flowprobe_engine::{RunReport, ScenarioResult, ScenarioStatus, StepResult, StepStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table<T: TableDisplay>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if items.is_empty() {
        println!("No items found.");
        return;
    }

    match format {
        OutputFormat::Table => println!("{}", table(items)),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(items).unwrap_or_default());
        }
        OutputFormat::Plain => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                let row = item.row();
                for (header, value) in T::headers().iter().zip(row.iter()) {
                    println!("{}: {}", header, value);
                }
            }
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}

fn colored_status(status: ScenarioStatus) -> String {
    match status {
        ScenarioStatus::Passed => format!("✓ {status}").green().to_string(),
        ScenarioStatus::Failed => format!("✗ {status}").red().to_string(),
        ScenarioStatus::Aborted => format!("✗ {status}").yellow().to_string(),
    }
}

fn colored_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Passed => status.to_string().green().to_string(),
        StepStatus::Failed => status.to_string().red().to_string(),
        StepStatus::TimedOut => status.to_string().yellow().to_string(),
        StepStatus::Skipped => status.to_string().dimmed().to_string(),
    }
}

impl TableDisplay for ScenarioResult {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Status", "State", "Steps", "Elapsed", "Message"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            colored_status(self.status),
            self.state.to_string(),
            format!("{}/{}", self.count(StepStatus::Passed), self.steps.len()),
            format!("{} ms", self.elapsed_ms),
            self.message.clone().unwrap_or_default(),
        ]
    }
}

impl TableDisplay for StepResult {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Status", "Elapsed", "Message"]
    }

    fn row(&self) -> Vec<String> {
        let step = if self.optional {
            format!("{} (optional)", self.step)
        } else {
            self.step.clone()
        };
        vec![
            self.index.to_string(),
            step,
            colored_step_status(self.status),
            format!("{} ms", self.elapsed_ms),
            self.message.clone().unwrap_or_default(),
        ]
    }
}

/// Print a run report: the full document for machine formats, otherwise a
/// scenario table plus step detail for every scenario that did not pass.
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(report).unwrap_or_default());
        }
        OutputFormat::Table | OutputFormat::Plain => {
            print_list(&report.scenarios, format);
            for scenario in report.scenarios.iter().filter(|s| !s.passed()) {
                println!();
                println!("{}", scenario.name.bold());
                print_list(&scenario.steps, format);
            }
            println!();
            let summary = format!(
                "{} passed, {} failed, {} aborted in {} ms",
                report.passed, report.failed, report.aborted, report.elapsed_ms
            );
            if report.success() {
                print_success(&summary);
            } else {
                print_error(&summary);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowprobe_engine::RunState;

    fn step(index: usize, status: StepStatus, optional: bool) -> StepResult {
        StepResult {
            index,
            step: format!("click:text=Step {index}"),
            kind: "click".into(),
            status,
            elapsed_ms: 12,
            message: None,
            error_kind: None,
            optional,
        }
    }

    #[test]
    fn test_scenario_row_counts_passed_steps() {
        colored::control::set_override(false);
        let result = ScenarioResult {
            name: "brand-building".into(),
            status: ScenarioStatus::Failed,
            state: RunState::Completed,
            started_at: chrono::Utc::now(),
            elapsed_ms: 5100,
            steps: vec![
                step(1, StepStatus::Passed, false),
                step(2, StepStatus::TimedOut, false),
                step(3, StepStatus::Skipped, false),
            ],
            message: Some("click timed out".into()),
        };
        let row = result.row();
        assert_eq!(row.len(), ScenarioResult::headers().len());
        assert_eq!(row[1], "✗ failed");
        assert_eq!(row[2], "completed");
        assert_eq!(row[3], "1/3");
        assert_eq!(row[5], "click timed out");
    }

    #[test]
    fn test_optional_step_is_marked() {
        colored::control::set_override(false);
        let row = step(4, StepStatus::Failed, true).row();
        assert_eq!(row[1], "click:text=Step 4 (optional)");
        assert_eq!(row[2], "failed");
    }
}

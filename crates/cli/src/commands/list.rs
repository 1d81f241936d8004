//! List command

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use flowprobe_engine::{EngineConfig, Scenario};

use super::SelectArgs;
use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub select: SelectArgs,
}

/// Scenario display
#[derive(Serialize)]
struct ScenarioDisplay {
    name: String,
    tags: Vec<String>,
    steps: usize,
    timeout_ms: Option<u64>,
    base_url: Option<String>,
    description: String,
}

impl From<&Scenario> for ScenarioDisplay {
    fn from(scenario: &Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            tags: scenario.tags.clone(),
            steps: scenario.steps.len(),
            timeout_ms: scenario.timeout_ms,
            base_url: scenario.base_url.clone(),
            description: scenario.description.clone(),
        }
    }
}

impl TableDisplay for ScenarioDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Tags", "Steps", "Timeout", "Base URL", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.tags.join(", "),
            self.steps.to_string(),
            self.timeout_ms
                .map(|ms| format!("{ms} ms"))
                .unwrap_or_else(|| "default".to_string()),
            self.base_url.clone().unwrap_or_else(|| "-".to_string()),
            self.description.clone(),
        ]
    }
}

pub fn execute(args: ListArgs, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let scenarios = args.select.load(config)?;
    let displays: Vec<ScenarioDisplay> = scenarios.iter().map(ScenarioDisplay::from).collect();
    output::print_list(&displays, format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_row() {
        let scenario = Scenario::from_yaml(
            "name: login\ntags: [smoke, auth]\ntimeout_ms: 60000\nsteps:\n  - kind: navigate\n    url: /\n",
        )
        .unwrap();
        let row = ScenarioDisplay::from(&scenario).row();
        assert_eq!(row[0], "login");
        assert_eq!(row[1], "smoke, auth");
        assert_eq!(row[2], "1");
        assert_eq!(row[3], "60000 ms");
        assert_eq!(row[4], "-");
    }
}

//! Validate command

use anyhow::{Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;

use flowprobe_engine::{EngineConfig, Scenario, SimApp, SimFactory};

use super::SelectArgs;
use crate::output;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Also check a simulated application definition
    #[arg(long)]
    pub app: Option<PathBuf>,
}

/// Names used by more than one scenario, with their counts.
fn duplicate_names(scenarios: &[Scenario]) -> Vec<(&str, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for scenario in scenarios {
        *counts.entry(scenario.name.as_str()).or_default() += 1;
    }
    counts.into_iter().filter(|(_, n)| *n > 1).collect()
}

pub fn execute(args: ValidateArgs, config: &EngineConfig) -> Result<()> {
    let scenarios = args.select.load(config)?;

    for (name, count) in duplicate_names(&scenarios) {
        output::print_warning(&format!("Scenario name '{name}' is used {count} times"));
    }

    let steps: usize = scenarios.iter().map(|s| s.steps.len()).sum();
    output::print_success(&format!(
        "{} scenario(s), {} step(s) valid in {}",
        scenarios.len(),
        steps,
        args.select.specs.display()
    ));

    if let Some(path) = &args.app {
        let app = SimApp::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
        let pages = app.pages.len();
        SimFactory::new(app).with_context(|| format!("Invalid page pattern in {}", path.display()))?;
        output::print_success(&format!(
            "Simulated application with {pages} page(s) valid in {}",
            path.display()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names() {
        let make = |name: &str| {
            Scenario::from_yaml(&format!(
                "name: {name}\nsteps:\n  - kind: navigate\n    url: /\n"
            ))
            .unwrap()
        };
        let scenarios = vec![make("login"), make("search"), make("login")];
        assert_eq!(duplicate_names(&scenarios), vec![("login", 2)]);
    }
}

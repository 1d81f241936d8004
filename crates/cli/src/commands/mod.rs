//! CLI Commands

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;

use flowprobe_engine::{EngineConfig, Scenario, ScenarioLoader};

pub mod list;
pub mod run;
pub mod validate;

/// Which scenarios to load, and how
#[derive(Args, Debug, Clone)]
pub struct SelectArgs {
    /// Scenario file or directory
    #[arg(short, long, default_value = "scenarios")]
    pub specs: PathBuf,

    /// Only scenarios carrying this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only the scenario with this name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Override a scenario variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Base URL for scenarios that do not declare one
    #[arg(long, env = "FLOWPROBE_BASE_URL")]
    pub base_url: Option<String>,
}

impl SelectArgs {
    /// Load, expand and filter scenarios. An empty selection is an error.
    pub fn load(&self, config: &EngineConfig) -> Result<Vec<Scenario>> {
        let loader = ScenarioLoader::new()
            .with_env_overrides()
            .with_variables(self.vars.iter().cloned())
            .with_base_url(self.base_url.clone().or_else(|| config.base_url.clone()));

        let mut scenarios = loader
            .load_all(&self.specs)
            .with_context(|| format!("Failed to load scenarios from {}", self.specs.display()))?;

        if let Some(tag) = &self.tag {
            scenarios = Scenario::filter_by_tag(scenarios, tag);
        }
        let selected: Vec<Scenario> = scenarios
            .into_iter()
            .filter(|s| self.name.as_ref().map_or(true, |name| &s.name == name))
            .collect();

        if selected.is_empty() {
            bail!("No scenarios matched in {}", self.specs.display());
        }
        Ok(selected)
    }
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("username=ci.user", "username", "ci.user" ; "plain")]
    #[test_case("query=a=b", "query", "a=b" ; "value keeps later equals signs")]
    #[test_case("empty=", "empty", "" ; "empty value")]
    fn test_parse_var(raw: &str, name: &str, value: &str) {
        assert_eq!(parse_var(raw), Ok((name.to_string(), value.to_string())));
    }

    #[test_case("novalue" ; "missing equals")]
    #[test_case("=value" ; "missing name")]
    fn test_parse_var_rejects(raw: &str) {
        assert!(parse_var(raw).is_err());
    }

    fn select(specs: PathBuf) -> SelectArgs {
        SelectArgs {
            specs,
            tag: None,
            name: None,
            vars: Vec::new(),
            base_url: None,
        }
    }

    #[test]
    fn test_select_filters_by_tag_and_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("suite.yaml"),
            r#"
scenarios:
  - name: login
    tags: [smoke]
    steps:
      - kind: navigate
        url: /login
  - name: search
    tags: [smoke, search]
    steps:
      - kind: navigate
        url: /search
"#,
        )
        .unwrap();
        let config = EngineConfig {
            base_url: Some("https://app.test".into()),
            ..EngineConfig::default()
        };

        let mut args = select(dir.path().to_path_buf());
        args.tag = Some("search".into());
        let scenarios = args.load(&config).unwrap();
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].name, "search");
        assert_eq!(scenarios[0].base_url.as_deref(), Some("https://app.test"));

        args.tag = Some("smoke".into());
        args.name = Some("login".into());
        assert_eq!(args.load(&config).unwrap()[0].name, "login");

        args.name = Some("checkout".into());
        let err = args.load(&config).unwrap_err();
        assert!(err.to_string().contains("No scenarios matched"));
    }
}

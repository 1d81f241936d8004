//! Declarative scenario definitions (YAML or JSON)
//!
//! A document is either a single scenario or a suite:
//!
//! ```yaml
//! base_url: https://app.example.com
//! variables: { username: demo }
//! fragments:
//!   login:
//!     - kind: fill
//!       locator: "role=textbox[name=Username]"
//!       text: ${username}
//! scenarios:
//!   - name: login
//!     steps:
//!       - kind: navigate
//!         url: /login
//!       - include: login
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::locator::Locator;
use crate::session::LoadState;
use crate::wait::{Condition, UrlPattern, WaitCondition};

/// Environment prefix for variable overrides (`FLOWPROBE_VAR_USERNAME=...`)
pub const VAR_ENV_PREFIX: &str = "FLOWPROBE_VAR_";

/// A named, ordered workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Relative navigation targets are joined onto this
    #[serde(default)]
    pub base_url: Option<String>,

    /// Overall budget for the scenario
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Default budget for each step
    #[serde(default)]
    pub step_timeout_ms: Option<u64>,

    #[serde(default)]
    pub isolation: Isolation,

    /// Steps to execute in order
    pub steps: Vec<Step>,
}

/// Session isolation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// New browsing context with empty cookies and storage
    #[default]
    FreshSession,
}

/// One atomic UI action plus its gating conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_condition: Option<WaitCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_condition: Option<WaitCondition>,

    /// Best-effort step: a failure is recorded but does not halt the scenario
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Navigate to a URL (relative to the base URL)
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: LoadState,
    },

    /// Replace the value of a text input
    Fill { locator: Locator, text: String },

    /// Click an element
    Click { locator: Locator },

    /// Press a key on an element, or on whatever has focus
    #[serde(alias = "press_key")]
    Press {
        #[serde(default)]
        locator: Option<Locator>,
        key: String,
    },

    /// Wait for a condition
    WaitFor { condition: WaitCondition },

    /// Scroll an element into view, or the page to a fraction of its height
    Scroll {
        #[serde(default)]
        locator: Option<Locator>,
        #[serde(default)]
        fraction: Option<f64>,
    },

    /// Evaluate a script in the page
    Custom {
        script: String,
        #[serde(default)]
        expect: Option<serde_json::Value>,
    },
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self {
            name: None,
            action,
            timeout_ms: None,
            pre_condition: None,
            post_condition: None,
            optional: false,
        }
    }

    pub fn navigate(url: &str) -> Self {
        Self::new(Action::Navigate {
            url: url.to_string(),
            wait_until: LoadState::default(),
        })
    }

    pub fn fill(locator: Locator, text: &str) -> Self {
        Self::new(Action::Fill {
            locator,
            text: text.to_string(),
        })
    }

    pub fn click(locator: Locator) -> Self {
        Self::new(Action::Click { locator })
    }

    pub fn press(locator: Option<Locator>, key: &str) -> Self {
        Self::new(Action::Press {
            locator,
            key: key.to_string(),
        })
    }

    pub fn wait_for(condition: WaitCondition) -> Self {
        Self::new(Action::WaitFor { condition })
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_post(mut self, condition: WaitCondition) -> Self {
        self.post_condition = Some(condition);
        self
    }

    pub fn with_pre(mut self, condition: WaitCondition) -> Self {
        self.pre_condition = Some(condition);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn kind(&self) -> &'static str {
        match &self.action {
            Action::Navigate { .. } => "navigate",
            Action::Fill { .. } => "fill",
            Action::Click { .. } => "click",
            Action::Press { .. } => "press",
            Action::WaitFor { .. } => "wait_for",
            Action::Scroll { .. } => "scroll",
            Action::Custom { .. } => "custom",
        }
    }

    /// Conditions gating this step, including the one a `wait_for` waits on.
    pub fn conditions(&self) -> impl Iterator<Item = &WaitCondition> {
        let waited = match &self.action {
            Action::WaitFor { condition } => Some(condition),
            _ => None,
        };
        self.pre_condition
            .iter()
            .chain(waited)
            .chain(self.post_condition.iter())
    }

    /// Compile every locator and URL pattern the step refers to.
    pub fn check(&self) -> EngineResult<()> {
        match &self.action {
            Action::Fill { locator, .. } | Action::Click { locator } => locator.check()?,
            Action::Press {
                locator: Some(locator),
                ..
            }
            | Action::Scroll {
                locator: Some(locator),
                ..
            } => locator.check()?,
            Action::Scroll {
                locator: None,
                fraction: Some(fraction),
            } if !(0.0..=1.0).contains(fraction) => {
                return Err(EngineError::InvalidScenario(format!(
                    "scroll fraction {fraction} outside 0..=1"
                )));
            }
            _ => {}
        }
        for wait in self.conditions() {
            if wait.timeout_ms == Some(0) {
                return Err(EngineError::InvalidScenario(
                    "condition timeout_ms must be positive".into(),
                ));
            }
            match &wait.condition {
                Condition::ElementVisible { locator } | Condition::ElementHidden { locator } => {
                    locator.check()?
                }
                Condition::UrlMatches { pattern } => {
                    UrlPattern::new(pattern)?;
                }
                Condition::TextVisible { .. } => {}
            }
        }
        Ok(())
    }

    /// Short label for logs and reports.
    pub fn describe(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.action {
            Action::Navigate { url, .. } => format!("navigate:{url}"),
            Action::Fill { locator, .. } => format!("fill:{locator}"),
            Action::Click { locator } => format!("click:{locator}"),
            Action::Press {
                locator: Some(locator),
                key,
            } => format!("press:{key}@{locator}"),
            Action::Press { locator: None, key } => format!("press:{key}"),
            Action::WaitFor { condition } => format!("wait_for:{}", condition.condition),
            Action::Scroll {
                locator: Some(locator),
                ..
            } => format!("scroll:{locator}"),
            Action::Scroll { fraction, .. } => format!("scroll:{:.2}", fraction.unwrap_or(1.0)),
            Action::Custom { script, .. } => {
                let head: String = script.chars().take(30).collect();
                format!("custom:{head}")
            }
        }
    }
}

impl Scenario {
    /// Parse a single scenario from YAML or JSON, without suite features.
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidScenario("scenario without a name".into()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::InvalidScenario(format!(
                "{}: scenario has no steps",
                self.name
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(EngineError::InvalidScenario(format!(
                "{}: timeout_ms must be positive",
                self.name
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.check().map_err(|e| {
                EngineError::InvalidScenario(format!(
                    "{}: step {} ({}): {e}",
                    self.name,
                    index + 1,
                    step.describe()
                ))
            })?;
        }
        Ok(())
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Step budget: step override, then scenario default, then engine default.
    pub fn step_timeout(&self, step: &Step, default: Duration) -> Duration {
        step.timeout_ms
            .or(self.step_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Join a relative navigation target onto the base URL.
    pub fn resolve_url(&self, url: &str) -> String {
        let absolute = ["http://", "https://", "file:", "about:", "data:"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        match &self.base_url {
            Some(base) if !absolute => {
                format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
            }
            _ => url.to_string(),
        }
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag(scenarios: Vec<Self>, tag: &str) -> Vec<Self> {
        scenarios
            .into_iter()
            .filter(|s| s.tags.iter().any(|t| t == tag))
            .collect()
    }
}

/// Loads scenario documents, expanding fragments and variables
#[derive(Debug, Clone, Default)]
pub struct ScenarioLoader {
    overrides: BTreeMap<String, String>,
    base_url: Option<String>,
}

#[derive(Deserialize)]
struct SuiteDocument {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    fragments: BTreeMap<String, Vec<Value>>,
    scenarios: Vec<Value>,
}

impl ScenarioLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables that win over anything declared in documents.
    pub fn with_variables<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.overrides.extend(vars);
        self
    }

    /// Pick up `FLOWPROBE_VAR_<NAME>` overrides; the name is lower-cased.
    pub fn with_env_overrides(self) -> Self {
        let vars: Vec<(String, String)> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(VAR_ENV_PREFIX)
                    .map(|name| (name.to_lowercase(), v))
            })
            .collect();
        self.with_variables(vars)
    }

    /// Base URL for documents that do not declare one.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn load_str(&self, text: &str) -> EngineResult<Vec<Scenario>> {
        let doc: Value = serde_yaml::from_str(text)?;
        let suite = if doc.get("scenarios").is_some() {
            serde_yaml::from_value::<SuiteDocument>(doc)?
        } else {
            let fragments = match doc.get("fragments") {
                Some(f) => serde_yaml::from_value(f.clone())?,
                None => BTreeMap::new(),
            };
            SuiteDocument {
                base_url: None,
                variables: BTreeMap::new(),
                fragments,
                scenarios: vec![doc],
            }
        };

        let base_url = suite.base_url.clone().or_else(|| self.base_url.clone());
        let mut scenarios = Vec::with_capacity(suite.scenarios.len());
        for raw in &suite.scenarios {
            scenarios.push(self.build(raw, &suite, base_url.as_deref())?);
        }
        Ok(scenarios)
    }

    pub fn load_file(&self, path: &Path) -> EngineResult<Vec<Scenario>> {
        let content = std::fs::read_to_string(path)?;
        self.load_str(&content).map_err(|e| match e {
            EngineError::Io(io) => EngineError::Io(io),
            other => EngineError::InvalidScenario(format!("{}: {}", path.display(), other)),
        })
    }

    /// Load a file, or every `*.yaml`/`*.yml`/`*.json` below a directory in
    /// path order.
    pub fn load_all(&self, path: &Path) -> EngineResult<Vec<Scenario>> {
        if path.is_file() {
            return self.load_file(path);
        }

        let mut files: Vec<_> = walkdir::WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml" || ext == "json")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let mut scenarios = Vec::new();
        let mut seen = HashSet::new();
        for file in files {
            debug!("Loading scenarios from {}", file.display());
            for scenario in self.load_file(&file)? {
                if !seen.insert(scenario.name.clone()) {
                    return Err(EngineError::InvalidScenario(format!(
                        "duplicate scenario name '{}' in {}",
                        scenario.name,
                        file.display()
                    )));
                }
                scenarios.push(scenario);
            }
        }
        Ok(scenarios)
    }

    fn build(
        &self,
        raw: &Value,
        suite: &SuiteDocument,
        base_url: Option<&str>,
    ) -> EngineResult<Scenario> {
        let Value::Mapping(map) = raw else {
            return Err(EngineError::InvalidScenario(
                "scenario must be a mapping".into(),
            ));
        };
        let mut map = map.clone();
        let label = map
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string();
        let invalid = |reason: String| EngineError::InvalidScenario(format!("{label}: {reason}"));

        let mut vars = suite.variables.clone();
        if let Some(local) = map.remove("variables") {
            let local: BTreeMap<String, String> =
                serde_yaml::from_value(local).map_err(|e| invalid(e.to_string()))?;
            vars.extend(local);
        }
        vars.extend(self.overrides.clone());
        map.remove("fragments");

        let steps = match map.remove("steps") {
            Some(Value::Sequence(steps)) => steps,
            Some(_) => return Err(invalid("steps must be a list".into())),
            None => Vec::new(),
        };
        let mut expanded = Vec::new();
        expand_steps(&steps, &suite.fragments, &mut Vec::new(), &mut expanded)
            .map_err(invalid)?;
        map.insert(Value::from("steps"), Value::Sequence(expanded));

        if let Some(base) = base_url {
            let key = Value::from("base_url");
            if map.get(&key).map_or(true, Value::is_null) {
                map.insert(key, Value::from(base));
            }
        }

        let mut value = Value::Mapping(map);
        substitute(&mut value, &vars).map_err(invalid)?;

        let scenario: Scenario =
            serde_yaml::from_value(value).map_err(|e| invalid(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }
}

fn expand_steps(
    steps: &[Value],
    fragments: &BTreeMap<String, Vec<Value>>,
    stack: &mut Vec<String>,
    out: &mut Vec<Value>,
) -> Result<(), String> {
    for step in steps {
        let include = match step {
            Value::Mapping(m) if m.len() == 1 => m.get("include").and_then(Value::as_str),
            _ => None,
        };
        let Some(name) = include else {
            out.push(step.clone());
            continue;
        };
        if stack.iter().any(|s| s == name) {
            return Err(format!(
                "fragment cycle: {} -> {}",
                stack.join(" -> "),
                name
            ));
        }
        let fragment = fragments
            .get(name)
            .ok_or_else(|| format!("unknown fragment '{name}'"))?;
        stack.push(name.to_string());
        expand_steps(fragment, fragments, stack, out)?;
        stack.pop();
    }
    Ok(())
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
    })
}

fn substitute(value: &mut Value, vars: &BTreeMap<String, String>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            let mut missing = None;
            let replaced = variable_pattern().replace_all(s, |caps: &regex::Captures<'_>| {
                match vars.get(&caps[1]) {
                    Some(v) => v.clone(),
                    None => {
                        missing.get_or_insert_with(|| caps[1].to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                return Err(format!("undefined variable '{name}'"));
            }
            *s = replaced.into_owned();
        }
        Value::Sequence(items) => {
            for item in items {
                substitute(item, vars)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, vars)?;
            }
        }
        Value::Tagged(tagged) => substitute(&mut tagged.value, vars)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::Nth;

    const SUITE: &str = r#"
base_url: https://eoc.example.com/aops/eoc
variables:
  username: consumption.user1
  password: not-a-secret
fragments:
  login:
    - kind: fill
      locator: "role=textbox[name=Username]"
      text: ${username}
    - kind: fill
      locator: "role=textbox[name=Password]"
      text: ${password}
    - kind: click
      locator: "role=button[name=\"Sign in\"]"
scenarios:
  - name: login
    tags: [smoke, auth]
    timeout_ms: 60000
    steps:
      - kind: navigate
        url: /mu-obi?from=All&sort=4
        wait_until: networkidle
      - include: login
      - kind: wait_for
        condition:
          until: url_matches
          pattern: "**/mu-obi?from=All&sort=4"
        timeout_ms: 30000
  - name: search
    variables:
      username: other.user
    steps:
      - include: login
      - kind: press_key
        key: Enter
      - kind: click
        locator:
          by: text
          text: Explore Akasa
          nth: first
        post_condition:
          until: text_visible
          text: Add Analytical Output
          timeout_ms: 10000
"#;

    #[test]
    fn test_suite_expands_fragments_and_variables() {
        let scenarios = ScenarioLoader::new().load_str(SUITE).unwrap();
        assert_eq!(scenarios.len(), 2);

        let login = &scenarios[0];
        assert_eq!(login.steps.len(), 5);
        assert_eq!(login.timeout_ms, Some(60000));
        assert_eq!(
            login.base_url.as_deref(),
            Some("https://eoc.example.com/aops/eoc")
        );
        assert_eq!(
            login.steps[1].action,
            Action::Fill {
                locator: Locator::role("textbox", "Username"),
                text: "consumption.user1".into(),
            }
        );
        assert!(matches!(
            &login.steps[4].action,
            Action::WaitFor { condition } if matches!(condition.condition, Condition::UrlMatches { .. })
        ));
        assert_eq!(login.steps[4].timeout_ms, Some(30000));

        let search = &scenarios[1];
        assert_eq!(
            search.steps[0].action,
            Action::Fill {
                locator: Locator::role("textbox", "Username"),
                text: "other.user".into(),
            }
        );
        assert_eq!(search.steps[3].kind(), "press");
        match &search.steps[4].action {
            Action::Click { locator } => assert_eq!(locator.nth, Some(Nth::First)),
            other => panic!("unexpected action {other:?}"),
        }
        assert!(search.steps[4].post_condition.is_some());
    }

    #[test]
    fn test_overrides_win() {
        let loader = ScenarioLoader::new()
            .with_variables([("username".to_string(), "ci.user".to_string())]);
        let scenarios = loader.load_str(SUITE).unwrap();
        for scenario in &scenarios {
            match &scenario.steps.iter().find(|s| s.kind() == "fill").unwrap().action {
                Action::Fill { text, .. } => assert_eq!(text, "ci.user"),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let yaml = r#"
name: broken
steps:
  - kind: navigate
    url: ${missing}/home
"#;
        let err = ScenarioLoader::new().load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("undefined variable 'missing'"));
    }

    #[test]
    fn test_fragment_cycle_is_an_error() {
        let yaml = r#"
fragments:
  a:
    - include: b
  b:
    - include: a
scenarios:
  - name: loop
    steps:
      - include: a
"#;
        let err = ScenarioLoader::new().load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("fragment cycle"));
    }

    #[test]
    fn test_single_scenario_document() {
        let json = r#"{
  "name": "json-flow",
  "steps": [
    { "kind": "navigate", "url": "https://app.test/" },
    { "kind": "scroll", "fraction": 0.5 },
    { "kind": "custom", "script": "document.title", "expect": "Home" }
  ]
}"#;
        let scenarios = ScenarioLoader::new().load_str(json).unwrap();
        assert_eq!(scenarios[0].steps[1].describe(), "scroll:0.50");
        assert_eq!(scenarios[0].isolation, Isolation::FreshSession);
    }

    #[test]
    fn test_empty_scenario_rejected() {
        assert!(Scenario::from_yaml("name: nothing\nsteps: []\n").is_err());
    }

    #[test]
    fn test_bad_references_rejected_at_load() {
        let yaml = r#"
name: broken-selector
steps:
  - kind: click
    locator:
      by: css
      selector: "div[data-x"
"#;
        assert!(ScenarioLoader::new().load_str(yaml).is_err());

        let yaml = r#"
name: bad-scroll
steps:
  - kind: scroll
    fraction: 1.5
"#;
        assert!(Scenario::from_yaml(yaml).is_err());

        let mut scenario =
            Scenario::from_yaml("name: built\nsteps:\n  - kind: navigate\n    url: /\n").unwrap();
        scenario.steps.push(Step::click(Locator::css("div[data-x")));
        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("built: step 2"));
    }

    #[test]
    fn test_resolve_url() {
        let mut scenario = Scenario::from_yaml(
            "name: x\nbase_url: https://app.test/base/\nsteps:\n  - kind: navigate\n    url: /a\n",
        )
        .unwrap();
        assert_eq!(scenario.resolve_url("/a?b=1"), "https://app.test/base/a?b=1");
        assert_eq!(scenario.resolve_url("https://other.test/"), "https://other.test/");
        scenario.base_url = None;
        assert_eq!(scenario.resolve_url("/a"), "/a");
    }

    #[test]
    fn test_load_all_walks_directory_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "name: second\nsteps:\n  - kind: navigate\n    url: https://app.test/\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "name: first\nsteps:\n  - kind: navigate\n    url: https://app.test/\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nested/c.json"),
            r#"{"name": "third", "steps": [{"kind": "navigate", "url": "https://app.test/"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scenarios = ScenarioLoader::new().load_all(dir.path()).unwrap();
        let names: Vec<_> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }
}

//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Default configuration file name
pub const CONFIG_FILE: &str = "flowprobe.toml";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Condition polling interval
    pub poll_interval_ms: u64,

    /// Step budget when neither step nor scenario sets one
    pub default_step_timeout_ms: u64,

    /// Scenario budget when the scenario does not set one
    pub default_scenario_timeout_ms: u64,

    /// Number of scenarios run at once
    pub concurrency: usize,

    /// Base URL for scenarios that do not declare one
    pub base_url: Option<String>,

    /// Where run reports are written
    pub report_dir: PathBuf,

    /// Browser driver configuration
    pub playwright: PlaywrightConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            default_step_timeout_ms: 5_000,
            default_scenario_timeout_ms: 120_000,
            concurrency: 1,
            base_url: None,
            report_dir: PathBuf::from("test-results"),
            playwright: PlaywrightConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults when missing
    pub fn load(path: &Path) -> EngineResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(1..=1000).contains(&self.poll_interval_ms) {
            return Err(EngineError::InvalidConfig(format!(
                "poll_interval_ms must be within 1..=1000, got {}",
                self.poll_interval_ms
            )));
        }
        if self.default_step_timeout_ms == 0 || self.default_scenario_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn default_scenario_timeout(&self) -> Duration {
        Duration::from_millis(self.default_scenario_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" | "safari" => Ok(Browser::Webkit),
            other => Err(EngineError::InvalidConfig(format!("unknown browser '{other}'"))),
        }
    }
}

/// Configuration for the Playwright driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Node.js executable used to run the driver
    pub node_binary: PathBuf,
    /// Delay inserted by Playwright before each operation
    pub slow_mo_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_binary: PathBuf::from("node"),
            slow_mo_ms: 0,
        }
    }
}

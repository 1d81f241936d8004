//! Run command

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowprobe_engine::{
    Browser, EngineConfig, JsonReporter, LogReporter, PlaywrightFactory, Reporter, RunReport,
    ScenarioRunner, SessionFactory, SimFactory,
};

use super::SelectArgs;
use crate::output::{self, OutputFormat};

/// Session backend
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Backend {
    /// In-process simulated application
    #[default]
    Sim,
    /// Real browser through the Playwright driver
    Playwright,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Session backend
    #[arg(short, long, value_enum, default_value = "sim")]
    pub backend: Backend,

    /// Simulated application definition (sim backend)
    #[arg(long, env = "FLOWPROBE_SIM_APP")]
    pub app: Option<PathBuf>,

    /// Scenarios run at once
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Directory for the JSON run report
    #[arg(short, long)]
    pub report_dir: Option<PathBuf>,

    /// Condition polling interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Step budget when neither step nor scenario sets one
    #[arg(long)]
    pub step_timeout_ms: Option<u64>,

    /// Browser engine (chromium, firefox, webkit)
    #[arg(long)]
    pub browser: Option<Browser>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,
}

impl RunArgs {
    /// Flags win over the configuration file.
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = dir.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = self.step_timeout_ms {
            config.default_step_timeout_ms = ms;
        }
        if let Some(browser) = self.browser {
            config.playwright.browser = browser;
        }
        if self.headed {
            config.playwright.headless = false;
        }
    }

    fn factory(&self, config: &EngineConfig) -> Result<Arc<dyn SessionFactory>> {
        let factory: Arc<dyn SessionFactory> = match self.backend {
            Backend::Sim => {
                let path = self
                    .app
                    .as_ref()
                    .context("--app is required with the sim backend")?;
                let factory = SimFactory::load(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                Arc::new(factory)
            }
            Backend::Playwright => Arc::new(PlaywrightFactory::new(
                config.playwright.clone(),
                config.default_step_timeout(),
            )?),
        };
        Ok(factory)
    }
}

/// Execute the run command; returns the process exit status.
pub async fn execute(args: RunArgs, mut config: EngineConfig, format: OutputFormat) -> Result<i32> {
    args.apply(&mut config);
    config.validate()?;

    let scenarios = args.select.load(&config)?;
    let factory = args.factory(&config)?;
    info!(
        "Running {} scenario(s) on {} backend",
        scenarios.len(),
        factory.name()
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining steps");
            interrupt.cancel();
        }
    });

    let report_dir = config.report_dir.clone();
    let runner = ScenarioRunner::new(config, factory).with_cancel(cancel);
    let report = runner.run_all(&scenarios).await;
    publish(&report, &report_dir, format);

    Ok(report.exit_code())
}

/// Show the outcomes, then persist them. A reporter failure is logged and
/// never changes the exit status. Returns the JSON report path, if written.
fn publish(report: &RunReport, report_dir: &Path, format: OutputFormat) -> Option<PathBuf> {
    output::print_report(report, format);

    if let Err(e) = LogReporter.report(report) {
        warn!("Log reporter failed: {}", e);
    }
    let mut json = JsonReporter::new(report_dir);
    match json.report(report) {
        Ok(()) => {
            let path = json.written().map(Path::to_path_buf);
            if let Some(path) = &path {
                output::print_info(&format!("Report: {}", path.display()));
            }
            path
        }
        Err(e) => {
            output::print_warning(&format!(
                "Could not write report to {}: {}",
                report_dir.display(),
                e
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            select: SelectArgs {
                specs: PathBuf::from("scenarios"),
                tag: None,
                name: None,
                vars: Vec::new(),
                base_url: None,
            },
            backend: Backend::Sim,
            app: None,
            concurrency: Some(4),
            report_dir: Some(PathBuf::from("out")),
            poll_interval_ms: None,
            step_timeout_ms: Some(2_000),
            browser: Some(Browser::Firefox),
            headed: true,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = EngineConfig::default();
        args().apply(&mut config);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.report_dir, PathBuf::from("out"));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.default_step_timeout_ms, 2_000);
        assert_eq!(config.playwright.browser, Browser::Firefox);
        assert!(!config.playwright.headless);
    }

    #[test]
    fn test_unwritable_report_dir_keeps_results() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let report = RunReport::new(chrono::Utc::now(), 0, vec![]);

        assert!(publish(&report, &blocker.join("results"), OutputFormat::Json).is_none());
        assert_eq!(report.exit_code(), 0);

        let written = publish(&report, dir.path(), OutputFormat::Json).unwrap();
        assert!(written.exists());
    }

    #[test]
    fn test_sim_backend_requires_app() {
        let err = args().factory(&EngineConfig::default()).err().unwrap();
        assert!(err.to_string().contains("--app"));
    }
}

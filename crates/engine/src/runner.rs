//! Workflow runner: sequences steps into scenarios over fresh sessions

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{Disposition, StepExecutor};
use crate::report::{RunReport, ScenarioResult, ScenarioStatus, StepResult};
use crate::scenario::Scenario;
use crate::session::{Session, SessionFactory};
use crate::wait::{Budget, Waiter};

/// Upper bound on closing a session after the scenario is done
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one scenario run: `Idle -> Running -> {Completed, Aborted}`.
/// Opening the session is the first thing a running scenario does, so a
/// session that cannot be opened aborts from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }

    pub fn can_become(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Idle, RunState::Running)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Aborted)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle<'a> {
    scenario: &'a str,
    state: RunState,
}

impl<'a> Lifecycle<'a> {
    fn new(scenario: &'a str) -> Self {
        Self {
            scenario,
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!("{}: {} -> {}", self.scenario, self.state, next);
        self.state = next;
    }
}

/// Runs scenarios, each on its own session
pub struct ScenarioRunner {
    config: EngineConfig,
    factory: Arc<dyn SessionFactory>,
    waiter: Waiter,
    executor: StepExecutor,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(config: EngineConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let waiter = Waiter::new(config.poll_interval());
        let executor = StepExecutor::new(waiter.clone(), config.default_step_timeout());
        Self {
            config,
            factory,
            waiter,
            executor,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an external token to cancel in-flight scenarios.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run scenarios with the configured concurrency. Results keep
    /// declaration order and a failing scenario never stops the others.
    pub async fn run_all(&self, scenarios: &[Scenario]) -> RunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let concurrency = self.config.concurrency.max(1);

        info!(
            "Running {} scenario(s) on '{}' backend (concurrency {})...",
            scenarios.len(),
            self.factory.name(),
            concurrency
        );

        let results: Vec<ScenarioResult> = stream::iter(scenarios)
            .map(|scenario| self.run(scenario))
            .buffered(concurrency)
            .collect()
            .await;

        RunReport::new(started_at, started.elapsed().as_millis() as u64, results)
    }

    /// Run a single scenario to a terminal state.
    pub async fn run(&self, scenario: &Scenario) -> ScenarioResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(&scenario.name);
        let budget = Budget::scenario(scenario.timeout(self.config.default_scenario_timeout()));

        info!("Running scenario: {}", scenario.name);
        lifecycle.advance(RunState::Running);

        let mut session = match self.open(scenario, budget).await {
            Ok(session) => session,
            Err(e) => {
                lifecycle.advance(RunState::Aborted);
                warn!("{}: could not open session: {}", scenario.name, e);
                return ScenarioResult {
                    name: scenario.name.clone(),
                    status: ScenarioStatus::Aborted,
                    state: lifecycle.state,
                    started_at,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    steps: scenario
                        .steps
                        .iter()
                        .enumerate()
                        .map(|(i, step)| StepResult::skipped(i, step))
                        .collect(),
                    message: Some(format!("session could not be opened: {e}")),
                };
            }
        };

        let mut steps = Vec::with_capacity(scenario.steps.len());
        let mut stopped: Option<RunState> = None;
        let mut message = None;

        for (index, step) in scenario.steps.iter().enumerate() {
            if stopped.is_some() {
                steps.push(StepResult::skipped(index, step));
                continue;
            }

            if self.cancel.is_cancelled() || budget.scenario_expired() {
                let reason = budget.exhausted(&self.cancel, EngineError::Cancelled);
                message = Some(reason.to_string());
                stopped = Some(RunState::Aborted);
                steps.push(StepResult::skipped(index, step));
                continue;
            }

            let outcome = self
                .executor
                .execute(session.as_mut(), scenario, step, index, budget, &self.cancel)
                .await;

            match outcome.disposition {
                Disposition::Continue => {}
                Disposition::Halt => {
                    message = outcome.result.message.clone();
                    stopped = Some(RunState::Completed);
                }
                Disposition::Abort => {
                    message = outcome.result.message.clone();
                    stopped = Some(RunState::Aborted);
                }
            }
            steps.push(outcome.result);
        }

        match tokio::time::timeout(CLOSE_GRACE, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: failed to close session: {}", scenario.name, e),
            Err(_) => warn!("{}: session close timed out", scenario.name),
        }

        let terminal = stopped.unwrap_or(RunState::Completed);
        lifecycle.advance(terminal);

        let status = if terminal == RunState::Aborted {
            ScenarioStatus::Aborted
        } else if steps.iter().any(StepResult::blocks) {
            ScenarioStatus::Failed
        } else {
            ScenarioStatus::Passed
        };

        ScenarioResult {
            name: scenario.name.clone(),
            status,
            state: lifecycle.state,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            steps,
            message,
        }
    }

    async fn open(
        &self,
        scenario: &Scenario,
        budget: Budget,
    ) -> Result<Box<dyn Session>, EngineError> {
        let ticker = self.waiter.ticker(budget, &self.cancel);
        match ticker.bounded(self.factory.open(&scenario.name)).await {
            Ok(result) => result,
            Err(_) => Err(budget.exhausted(
                &self.cancel,
                EngineError::ScenarioTimeout {
                    budget_ms: budget.scenario_budget().as_millis() as u64,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(RunState::Idle.can_become(RunState::Running));
        assert!(!RunState::Idle.can_become(RunState::Aborted));
        assert!(RunState::Running.can_become(RunState::Aborted));
        assert!(RunState::Running.can_become(RunState::Completed));
        assert!(!RunState::Completed.can_become(RunState::Running));
        assert!(!RunState::Aborted.can_become(RunState::Completed));
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl SessionFactory for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn open(&self, _: &str) -> crate::error::EngineResult<Box<dyn Session>> {
            Err(EngineError::BrowserUnavailable("no browser".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unopened_session_aborts_from_running() {
        let scenario = Scenario::from_yaml(
            "name: offline\nbase_url: https://app.test\nsteps:\n  - kind: navigate\n    url: /\n  - kind: press\n    key: Enter\n",
        )
        .unwrap();
        let runner = ScenarioRunner::new(EngineConfig::default(), Arc::new(Unreachable));

        let result = runner.run(&scenario).await;
        assert_eq!(result.state, RunState::Aborted);
        assert_eq!(result.status, ScenarioStatus::Aborted);
        assert_eq!(result.steps.len(), 2);
        assert!(result
            .steps
            .iter()
            .all(|s| s.status == crate::report::StepStatus::Skipped));
        assert!(result.message.unwrap().contains("no browser"));
    }
}

//! Step execution
//!
//! One step runs in four phases: resolve the target until it is present and
//! visible, wait on the pre-condition, act, wait on the post-condition. All
//! phases share the step's budget unless a condition declares its own.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dom::Node;
use crate::error::{EngineError, EngineResult};
use crate::locator::{Locator, Selection};
use crate::report::{StepResult, StepStatus};
use crate::scenario::{Action, Scenario, Step};
use crate::session::{Interaction, NavigateOptions, Session};
use crate::wait::{Budget, WaitCondition, Waiter};

/// What the runner does after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// Stop the scenario; it still completes normally.
    Halt,
    /// The session cannot be trusted any further.
    Abort,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    pub disposition: Disposition,
}

/// A failed step, and whether the action had already been performed
struct StepFailure {
    error: EngineError,
    acted: bool,
}

impl From<EngineError> for StepFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            acted: false,
        }
    }
}

/// How ready a target must be before acting on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Attached,
    Visible,
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    waiter: Waiter,
    default_step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(waiter: Waiter, default_step_timeout: Duration) -> Self {
        Self {
            waiter,
            default_step_timeout,
        }
    }

    /// Execute one step. Never returns an error: failures are folded into
    /// the step result and the disposition.
    pub async fn execute(
        &self,
        session: &mut dyn Session,
        scenario: &Scenario,
        step: &Step,
        index: usize,
        scenario_budget: Budget,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started = Instant::now();
        let timeout = scenario.step_timeout(step, self.default_step_timeout);
        let budget = scenario_budget.child(timeout);
        debug!("[{}] {} (budget {} ms)", index, step.describe(), timeout.as_millis());

        let outcome = self.perform(session, scenario, step, budget, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut result = StepResult {
            index,
            step: step.describe(),
            kind: step.kind().to_string(),
            status: StepStatus::Passed,
            elapsed_ms,
            message: None,
            error_kind: None,
            optional: step.optional,
        };

        let disposition = match outcome {
            Ok(()) => Disposition::Continue,
            Err(StepFailure { error, acted }) => {
                result.status = error.step_status();
                result.message = Some(error.to_string());
                result.error_kind = Some(error.kind().to_string());
                debug!("[{}] {}: {}", index, result.status, error);

                let side_effect_lost =
                    acted && matches!(error, EngineError::ConditionTimeout { .. });
                if error.is_fatal() || side_effect_lost {
                    Disposition::Abort
                } else if step.optional {
                    Disposition::Continue
                } else {
                    Disposition::Halt
                }
            }
        };

        StepOutcome {
            result,
            disposition,
        }
    }

    async fn perform(
        &self,
        session: &mut dyn Session,
        scenario: &Scenario,
        step: &Step,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let interaction = match &step.action {
            Action::WaitFor { condition } => {
                self.pre_condition(session, step, budget, cancel).await?;
                self.await_condition(session, condition, budget, cancel)
                    .await?;
                return Ok(());
            }
            Action::Navigate { url, wait_until } => {
                self.pre_condition(session, step, budget, cancel).await?;
                let url = scenario.resolve_url(url);
                let options = NavigateOptions {
                    wait_until: *wait_until,
                    timeout: budget.remaining(),
                };
                let ticker = self.waiter.ticker(budget, cancel);
                match ticker.bounded(session.navigate(&url, &options)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(budget
                            .exhausted(
                                cancel,
                                EngineError::ConditionTimeout {
                                    condition: format!("navigation to {url}"),
                                    timeout_ms: budget.timeout().as_millis() as u64,
                                },
                            )
                            .into())
                    }
                }
                None
            }
            Action::Fill { locator, text } => {
                let node = self
                    .acquire(session, locator, Readiness::Visible, budget, cancel)
                    .await?;
                self.pre_condition(session, step, budget, cancel).await?;
                if !node.is_editable() {
                    return Err(EngineError::action(
                        "fill",
                        format!("<{}> matched by {} does not accept text input", node.tag, locator),
                    )
                    .into());
                }
                Some((Some(node), Interaction::Fill(text.clone())))
            }
            Action::Click { locator } => {
                let node = self
                    .acquire(session, locator, Readiness::Visible, budget, cancel)
                    .await?;
                self.pre_condition(session, step, budget, cancel).await?;
                Some((Some(node), Interaction::Click))
            }
            Action::Press { locator, key } => {
                let node = match locator {
                    Some(locator) => Some(
                        self.acquire(session, locator, Readiness::Visible, budget, cancel)
                            .await?,
                    ),
                    None => None,
                };
                self.pre_condition(session, step, budget, cancel).await?;
                Some((node, Interaction::Press(key.clone())))
            }
            Action::Scroll { locator, fraction } => {
                let (node, interaction) = match locator {
                    Some(locator) => (
                        Some(
                            self.acquire(session, locator, Readiness::Attached, budget, cancel)
                                .await?,
                        ),
                        Interaction::ScrollIntoView,
                    ),
                    None => {
                        let fraction = fraction.unwrap_or(1.0);
                        if !(0.0..=1.0).contains(&fraction) {
                            return Err(EngineError::action(
                                "scroll",
                                format!("fraction {fraction} is outside 0.0..=1.0"),
                            )
                            .into());
                        }
                        (None, Interaction::ScrollPage { fraction })
                    }
                };
                self.pre_condition(session, step, budget, cancel).await?;
                Some((node, interaction))
            }
            Action::Custom { script, expect } => {
                self.pre_condition(session, step, budget, cancel).await?;
                let value = self
                    .act(session, None, &Interaction::Evaluate(script.clone()), budget, cancel)
                    .await?;
                if let Some(expected) = expect {
                    if &value != expected {
                        return Err(StepFailure {
                            error: EngineError::action(
                                "custom",
                                format!("expected {expected}, got {value}"),
                            ),
                            acted: true,
                        });
                    }
                }
                None
            }
        };

        if let Some((node, interaction)) = interaction {
            self.act(session, node.as_ref(), &interaction, budget, cancel)
                .await?;
        }

        if let Some(post) = &step.post_condition {
            self.await_condition(session, post, budget, cancel)
                .await
                .map_err(|error| StepFailure { error, acted: true })?;
        }
        Ok(())
    }

    async fn pre_condition(
        &self,
        session: &mut dyn Session,
        step: &Step,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        match &step.pre_condition {
            Some(pre) => self.await_condition(session, pre, budget, cancel).await,
            None => Ok(()),
        }
    }

    async fn await_condition(
        &self,
        session: &mut dyn Session,
        wait: &WaitCondition,
        step_budget: Budget,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let budget = match wait.timeout_ms {
            Some(ms) => step_budget.child(Duration::from_millis(ms)),
            None => step_budget,
        };
        self.waiter
            .wait_for(session, &wait.condition, budget, cancel)
            .await
    }

    async fn act(
        &self,
        session: &mut dyn Session,
        node: Option<&Node>,
        interaction: &Interaction,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> EngineResult<serde_json::Value> {
        let ticker = self.waiter.ticker(budget, cancel);
        match ticker
            .bounded(session.act(node.map(|n| n.id), interaction))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(budget.exhausted(
                cancel,
                EngineError::ConditionTimeout {
                    condition: format!("{} to complete", interaction.name()),
                    timeout_ms: budget.timeout().as_millis() as u64,
                },
            )),
        }
    }

    /// Poll until the locator picks exactly one target in the required state.
    async fn acquire(
        &self,
        session: &mut dyn Session,
        locator: &Locator,
        readiness: Readiness,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> EngineResult<Node> {
        let mut ticker = self.waiter.ticker(budget, cancel);
        let mut seen = false;
        loop {
            match ticker.bounded(session.snapshot()).await {
                Ok(Ok(snapshot)) => {
                    let candidates = locator.resolve(&snapshot)?;
                    match locator.pick(&candidates) {
                        Selection::Ambiguous(count) => {
                            return Err(EngineError::AmbiguousTarget {
                                locator: locator.to_string(),
                                count,
                            })
                        }
                        Selection::One(i) => {
                            seen = true;
                            if readiness == Readiness::Attached || snapshot.is_visible(i) {
                                return Ok(snapshot.node(i).clone());
                            }
                        }
                        Selection::None => {}
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
            if budget.remaining().is_zero() || ticker.tick().await.is_err() {
                break;
            }
        }

        let on_timeout = if seen {
            EngineError::ConditionTimeout {
                condition: format!("visible {locator}"),
                timeout_ms: budget.timeout().as_millis() as u64,
            }
        } else {
            EngineError::TargetNotFound {
                locator: locator.to_string(),
                waited_ms: budget.elapsed().as_millis() as u64,
            }
        };
        Err(budget.exhausted(cancel, on_timeout))
    }
}

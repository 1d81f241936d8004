//! Condition waiting
//!
//! Waits poll the session at a bounded interval until a condition holds or
//! the budget runs out. Every session call made while waiting is itself
//! bounded by the remaining budget, and the scenario deadline and external
//! cancellation abort a wait immediately.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::locator::{Locator, Selection};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "until", rename_all = "snake_case")]
pub enum Condition {
    ElementVisible { locator: Locator },
    ElementHidden { locator: Locator },
    UrlMatches { pattern: String },
    TextVisible { text: String },
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::ElementVisible { locator } => write!(f, "visible {locator}"),
            Condition::ElementHidden { locator } => write!(f, "hidden {locator}"),
            Condition::UrlMatches { pattern } => write!(f, "url {pattern}"),
            Condition::TextVisible { text } => write!(f, "text \"{text}\""),
        }
    }
}

/// A condition with an optional timeout of its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitCondition {
    #[serde(flatten)]
    pub condition: Condition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WaitCondition {
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            timeout_ms: None,
        }
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Glob over full URLs: `**` spans anything, `*` stops at `/`, the rest is literal.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    glob: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn new(glob: &str) -> EngineResult<Self> {
        let mut source = String::from("^");
        let mut chars = glob.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '*' {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    source.push_str(".*");
                } else {
                    source.push_str("[^/]*");
                }
            } else {
                source.push_str(&regex::escape(&c.to_string()));
            }
        }
        source.push('$');
        let regex = Regex::new(&source).map_err(|_| EngineError::InvalidPattern(glob.to_string()))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

/// Time allowance for one wait, nested inside the scenario's allowance
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: Instant,
    limit: Instant,
    timeout: Duration,
    scenario_end: Instant,
    scenario_budget: Duration,
}

impl Budget {
    /// Allowance for a whole scenario starting now.
    pub fn scenario(budget: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            limit: now + budget,
            timeout: budget,
            scenario_end: now + budget,
            scenario_budget: budget,
        }
    }

    /// A narrower allowance starting now, clipped to the scenario deadline.
    pub fn child(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            limit: (now + timeout).min(self.scenario_end),
            timeout,
            ..*self
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn scenario_expired(&self) -> bool {
        Instant::now() >= self.scenario_end
    }

    pub fn scenario_budget(&self) -> Duration {
        self.scenario_budget
    }

    /// Error describing why this allowance ran out.
    pub fn exhausted(&self, cancel: &CancellationToken, on_timeout: EngineError) -> EngineError {
        if cancel.is_cancelled() {
            EngineError::Cancelled
        } else if self.scenario_expired() {
            EngineError::ScenarioTimeout {
                budget_ms: self.scenario_budget.as_millis() as u64,
            }
        } else {
            on_timeout
        }
    }
}

/// Why a polling loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    TimedOut,
    Cancelled,
}

/// Drives one polling loop: sleep between probes, stop at the budget.
pub struct Ticker<'a> {
    poll: Duration,
    budget: Budget,
    cancel: &'a CancellationToken,
}

impl Ticker<'_> {
    /// Sleep until the next probe, or report that the loop must stop.
    pub async fn tick(&mut self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        let now = Instant::now();
        if now >= self.budget.limit {
            return Err(Stop::TimedOut);
        }
        let nap = self.poll.min(self.budget.limit - now);
        tokio::select! {
            _ = tokio::time::sleep(nap) => Ok(()),
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
        }
    }

    /// Run a session call without letting it outlive the budget.
    pub async fn bounded<T, F>(&self, fut: F) -> Result<EngineResult<T>, Stop>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::select! {
            result = tokio::time::timeout_at(self.budget.limit, fut) => {
                result.map_err(|_| Stop::TimedOut)
            }
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
        }
    }
}

/// Result of waiting on a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
    Cancelled,
}

/// Polls conditions against a session
#[derive(Debug, Clone)]
pub struct Waiter {
    poll_interval: Duration,
}

impl Waiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn ticker<'a>(&self, budget: Budget, cancel: &'a CancellationToken) -> Ticker<'a> {
        Ticker {
            poll: self.poll_interval,
            budget,
            cancel,
        }
    }

    /// Wait until `condition` holds. Never returns later than the budget
    /// plus one poll interval.
    pub async fn wait(
        &self,
        session: &mut dyn Session,
        condition: &Condition,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> EngineResult<WaitOutcome> {
        let pattern = match condition {
            Condition::UrlMatches { pattern } => Some(UrlPattern::new(pattern)?),
            _ => None,
        };
        let mut ticker = self.ticker(budget, cancel);
        loop {
            let probe = ticker.bounded(check(session, condition, pattern.as_ref())).await;
            let stop = match probe {
                Ok(Ok(true)) => return Ok(WaitOutcome::Satisfied),
                // a probe over a large page can itself run past the limit
                Ok(Ok(false)) if budget.remaining().is_zero() => Some(Stop::TimedOut),
                Ok(Ok(false)) => ticker.tick().await.err(),
                Ok(Err(e)) => return Err(e),
                Err(stop) => Some(stop),
            };
            match stop {
                None => trace!("condition not met yet: {}", condition),
                Some(Stop::TimedOut) if !budget.scenario_expired() => {
                    return Ok(WaitOutcome::TimedOut)
                }
                Some(_) => return Ok(WaitOutcome::Cancelled),
            }
        }
    }

    /// Like [`Waiter::wait`], but a miss becomes the matching error.
    pub async fn wait_for(
        &self,
        session: &mut dyn Session,
        condition: &Condition,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        match self.wait(session, condition, budget, cancel).await? {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => Err(budget.exhausted(
                cancel,
                EngineError::ConditionTimeout {
                    condition: condition.to_string(),
                    timeout_ms: budget.timeout().as_millis() as u64,
                },
            )),
        }
    }
}

async fn check(
    session: &mut dyn Session,
    condition: &Condition,
    pattern: Option<&UrlPattern>,
) -> EngineResult<bool> {
    match condition {
        Condition::UrlMatches { .. } => {
            let url = session.current_url().await?;
            Ok(pattern.is_some_and(|p| p.matches(&url)))
        }
        Condition::ElementVisible { locator } | Condition::ElementHidden { locator } => {
            let snapshot = session.snapshot().await?;
            let candidates = locator.resolve(&snapshot)?;
            let visible = match locator.pick(&candidates) {
                Selection::None => false,
                Selection::One(i) => snapshot.is_visible(i),
                Selection::Ambiguous(count) => {
                    return Err(EngineError::AmbiguousTarget {
                        locator: locator.to_string(),
                        count,
                    })
                }
            };
            Ok(visible == matches!(condition, Condition::ElementVisible { .. }))
        }
        Condition::TextVisible { text } => {
            let snapshot = session.snapshot().await?;
            Ok(Locator::text(text)
                .resolve(&snapshot)?
                .into_iter()
                .any(|i| snapshot.is_visible(i)))
        }
    }
}

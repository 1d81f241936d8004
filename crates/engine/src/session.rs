//! Session interface to the application under test
//!
//! A [`Session`] is one isolated browsing context. The engine only observes
//! the application through snapshots and drives it through [`Interaction`]s;
//! backends decide how that maps onto a real or simulated browser.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dom::{NodeId, PageSnapshot};
use crate::error::EngineResult;
use crate::locator::Locator;

/// Navigation completion event to wait for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Load => "load",
            LoadState::DomContentLoaded => "domcontentloaded",
            LoadState::NetworkIdle => "networkidle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NavigateOptions {
    pub wait_until: LoadState,
    pub timeout: Duration,
}

/// Something done to the page, optionally aimed at an element
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Click,
    Fill(String),
    Press(String),
    ScrollIntoView,
    /// Scroll the page to a fraction (0.0 top, 1.0 bottom) of its height
    ScrollPage { fraction: f64 },
    Evaluate(String),
}

impl Interaction {
    pub fn name(&self) -> &'static str {
        match self {
            Interaction::Click => "click",
            Interaction::Fill(_) => "fill",
            Interaction::Press(_) => "press",
            Interaction::ScrollIntoView => "scroll_into_view",
            Interaction::ScrollPage { .. } => "scroll_page",
            Interaction::Evaluate(_) => "evaluate",
        }
    }
}

#[async_trait]
pub trait Session: Send {
    async fn navigate(&mut self, url: &str, options: &NavigateOptions) -> EngineResult<()>;

    async fn current_url(&mut self) -> EngineResult<String>;

    async fn snapshot(&mut self) -> EngineResult<PageSnapshot>;

    /// Perform an interaction. Returns the script result for
    /// [`Interaction::Evaluate`] and `null` otherwise.
    async fn act(
        &mut self,
        target: Option<NodeId>,
        interaction: &Interaction,
    ) -> EngineResult<serde_json::Value>;

    /// Resolve a locator against a fresh snapshot.
    async fn resolve(&mut self, locator: &Locator) -> EngineResult<Vec<NodeId>> {
        let snapshot = self.snapshot().await?;
        Ok(locator
            .resolve(&snapshot)?
            .into_iter()
            .map(|i| snapshot.node(i).id)
            .collect())
    }

    async fn close(&mut self) -> EngineResult<()>;
}

/// Opens a fresh, isolated session per scenario
#[async_trait]
pub trait SessionFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, scenario: &str) -> EngineResult<Box<dyn Session>>;
}

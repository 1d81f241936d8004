//! flowprobe workflow engine
//!
//! This crate runs declarative UI workflows against a stateful application:
//! - Parses YAML/JSON scenarios (fragments, variables, tags)
//! - Resolves element locators against page snapshots
//! - Replaces fixed sleeps with bounded, condition-based waiting
//! - Runs each scenario on a fresh session, fail-fast, under a time budget
//! - Reports per-step and per-scenario outcomes as logs and JSON
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ScenarioRunner (per run)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  run_all(scenarios) -> RunReport                            │
//! │    └── run(scenario) -> ScenarioResult                      │
//! │          Idle -> Running -> {Completed, Aborted}            │
//! │          ├── SessionFactory::open() -> Box<dyn Session>     │
//! │          └── StepExecutor::execute(step) -> StepOutcome     │
//! │                ├── Locator::resolve(snapshot) -> [node]     │
//! │                ├── Waiter::wait_for(condition, budget)      │
//! │                └── Session::act(target, interaction)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sessions                                                   │
//! │    ├── SimFactory              in-process application model │
//! │    └── PlaywrightFactory       Node.js driver, JSON lines   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Reporters: LogReporter (tracing), JsonReporter (file)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod locator;
pub mod playwright;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod selector;
pub mod session;
pub mod sim;
pub mod wait;

pub use config::{Browser, EngineConfig, PlaywrightConfig};
pub use error::{EngineError, EngineResult};
pub use executor::{Disposition, StepExecutor, StepOutcome};
pub use locator::{Locator, Nth, Strategy};
pub use playwright::PlaywrightFactory;
pub use report::{
    JsonReporter, LogReporter, Reporter, RunReport, ScenarioResult, ScenarioStatus, StepResult,
    StepStatus,
};
pub use runner::{RunState, ScenarioRunner};
pub use scenario::{Action, Scenario, ScenarioLoader, Step};
pub use session::{Interaction, LoadState, NavigateOptions, Session, SessionFactory};
pub use sim::{SimApp, SimFactory};
pub use wait::{Budget, Condition, UrlPattern, WaitCondition, WaitOutcome, Waiter};

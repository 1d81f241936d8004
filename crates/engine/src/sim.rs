//! Simulated application backend
//!
//! A declarative, in-process model of a web application. Pages are keyed by
//! URL glob and hold element trees; clicks and key presses trigger effects
//! that navigate, show or hide elements, write session storage, or drop the
//! connection, each optionally after a delay. Delayed effects are applied
//! lazily whenever the session is observed, against tokio's clock, so tests
//! running on paused time see them deterministically.
//!
//! ```yaml
//! pages:
//!   - url: "**/login"
//!     title: Sign in
//!     elements:
//!       - { tag: input, key: user, attributes: { aria-label: Username } }
//!       - tag: button
//!         text: Sign in
//!         on_click:
//!           - { effect: navigate, url: /home, delay_ms: 300 }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::dom::{Node, NodeId, PageSnapshot, Rect};
use crate::error::{EngineError, EngineResult};
use crate::session::{Interaction, NavigateOptions, Session, SessionFactory};
use crate::wait::UrlPattern;

const BLANK: &str = "about:blank";
const DEFAULT_WIDTH: f64 = 120.0;
const DEFAULT_HEIGHT: f64 = 24.0;

/// Application definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimApp {
    #[serde(default)]
    pub pages: Vec<SimPage>,

    /// Results for `custom` steps, keyed by script text
    #[serde(default)]
    pub scripts: BTreeMap<String, Value>,

    /// Delay added to every session call
    #[serde(default)]
    pub latency_ms: u64,
}

impl SimApp {
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimPage {
    /// URL glob this page is served for
    pub url: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub elements: Vec<SimElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimElement {
    /// Handle used by show/hide effects and the journal
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_tag")]
    pub tag: String,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub hidden: bool,

    #[serde(default)]
    pub width: Option<f64>,

    #[serde(default)]
    pub height: Option<f64>,

    /// Only rendered while session storage holds this entry
    #[serde(default)]
    pub requires: Option<String>,

    #[serde(default)]
    pub children: Vec<SimElement>,

    #[serde(default)]
    pub on_click: Vec<Effect>,

    /// Effects per key name (`Enter`, `Escape`, ...)
    #[serde(default)]
    pub on_key: BTreeMap<String, Vec<Effect>>,
}

fn default_tag() -> String {
    "div".to_string()
}

/// Reaction to an interaction. `{value}` in a navigation URL or a stored
/// value is replaced by the current value of the element acted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    Navigate {
        url: String,
        #[serde(default)]
        delay_ms: u64,
    },
    Show {
        key: String,
        #[serde(default)]
        delay_ms: u64,
    },
    Hide {
        key: String,
        #[serde(default)]
        delay_ms: u64,
    },
    Store {
        name: String,
        #[serde(default)]
        value: String,
    },
    Disconnect,
}

impl Effect {
    fn delay(&self) -> Duration {
        match self {
            Effect::Navigate { delay_ms, .. }
            | Effect::Show { delay_ms, .. }
            | Effect::Hide { delay_ms, .. } => Duration::from_millis(*delay_ms),
            Effect::Store { .. } | Effect::Disconnect => Duration::ZERO,
        }
    }

    fn bind(&self, value: &str) -> Effect {
        match self {
            Effect::Navigate { url, delay_ms } => Effect::Navigate {
                url: url.replace("{value}", &urlencoding::encode(value)),
                delay_ms: *delay_ms,
            },
            Effect::Store { name, value: stored } => Effect::Store {
                name: name.clone(),
                value: stored.replace("{value}", value),
            },
            other => other.clone(),
        }
    }
}

/// One interaction observed by the simulated application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub scenario: String,
    pub action: String,
    pub target: Option<String>,
    pub url: String,
}

struct Site {
    app: SimApp,
    patterns: Vec<UrlPattern>,
}

impl Site {
    fn new(app: SimApp) -> EngineResult<Self> {
        let patterns = app
            .pages
            .iter()
            .map(|page| UrlPattern::new(&page.url))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { app, patterns })
    }

    fn page_for(&self, url: &str) -> Option<&SimPage> {
        self.patterns
            .iter()
            .position(|p| p.matches(url))
            .map(|i| &self.app.pages[i])
    }
}

/// Opens sessions against a shared, immutable application definition
#[derive(Clone)]
pub struct SimFactory {
    site: Arc<Site>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
}

impl SimFactory {
    pub fn new(app: SimApp) -> EngineResult<Self> {
        Ok(Self {
            site: Arc::new(Site::new(app)?),
            journal: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        Self::new(SimApp::from_yaml(yaml)?)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        Self::new(SimApp::load(path)?)
    }

    pub fn journal_for(&self, scenario: &str) -> Vec<JournalEntry> {
        self.journal
            .lock()
            .iter()
            .filter(|e| e.scenario == scenario)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionFactory for SimFactory {
    fn name(&self) -> &str {
        "sim"
    }

    async fn open(&self, scenario: &str) -> EngineResult<Box<dyn Session>> {
        debug!("Opening simulated session for {}", scenario);
        Ok(Box::new(SimSession::new(
            self.site.clone(),
            scenario,
            self.journal.clone(),
        )))
    }
}

struct FlatNode {
    element: SimElement,
    parent: Option<usize>,
    hidden: bool,
}

struct Pending {
    due: Instant,
    effect: Effect,
}

/// One browsing context over the simulated application
pub struct SimSession {
    site: Arc<Site>,
    scenario: String,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
    url: String,
    title: String,
    generation: u32,
    nodes: Vec<FlatNode>,
    values: HashMap<usize, String>,
    focused: Option<usize>,
    storage: BTreeMap<String, String>,
    pending: Vec<Pending>,
    scroll: f64,
    lost: Option<String>,
}

impl SimSession {
    fn new(site: Arc<Site>, scenario: &str, journal: Arc<Mutex<Vec<JournalEntry>>>) -> Self {
        Self {
            site,
            scenario: scenario.to_string(),
            journal,
            url: BLANK.to_string(),
            title: String::new(),
            generation: 0,
            nodes: Vec::new(),
            values: HashMap::new(),
            focused: None,
            storage: BTreeMap::new(),
            pending: Vec::new(),
            scroll: 0.0,
            lost: None,
        }
    }

    /// Common prologue of every session call.
    async fn enter(&mut self) -> EngineResult<()> {
        if self.site.app.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.site.app.latency_ms)).await;
        }
        self.settle();
        match &self.lost {
            Some(reason) => Err(EngineError::SessionLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Apply delayed effects that are due, oldest first.
    fn settle(&mut self) {
        let now = Instant::now();
        while self.lost.is_none() {
            let next = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.due <= now)
                .min_by_key(|(_, p)| p.due)
                .map(|(i, _)| i);
            match next {
                Some(i) => {
                    let pending = self.pending.remove(i);
                    self.apply(pending.effect);
                }
                None => break,
            }
        }
    }

    fn load(&mut self, url: &str) {
        self.generation += 1;
        self.url = url.to_string();
        self.nodes.clear();
        self.values.clear();
        self.focused = None;
        self.pending.clear();
        self.scroll = 0.0;

        let site = self.site.clone();
        match site.page_for(url) {
            Some(page) => {
                self.title = page.title.clone();
                flatten(&page.elements, None, &mut self.nodes);
            }
            None => {
                self.title = "Not Found".to_string();
                let heading = SimElement {
                    text: "Not Found".to_string(),
                    ..element("h1")
                };
                flatten(&[heading], None, &mut self.nodes);
            }
        }
        trace!("{}: loaded {} ({} nodes)", self.scenario, url, self.nodes.len());
    }

    fn schedule(&mut self, effects: &[Effect], value: &str) {
        let now = Instant::now();
        for effect in effects {
            let effect = effect.bind(value);
            let delay = effect.delay();
            if delay.is_zero() {
                self.apply(effect);
            } else {
                self.pending.push(Pending {
                    due: now + delay,
                    effect,
                });
            }
        }
    }

    fn apply(&mut self, effect: Effect) {
        trace!("{}: applying {:?}", self.scenario, effect);
        match effect {
            Effect::Navigate { url, .. } => {
                let url = self.absolute(&url);
                self.load(&url);
            }
            Effect::Show { key, .. } => self.set_hidden(&key, false),
            Effect::Hide { key, .. } => self.set_hidden(&key, true),
            Effect::Store { name, value } => {
                self.storage.insert(name, value);
            }
            Effect::Disconnect => {
                self.lost = Some("connection dropped by the application".to_string());
            }
        }
    }

    fn set_hidden(&mut self, key: &str, hidden: bool) {
        for node in self
            .nodes
            .iter_mut()
            .filter(|n| n.element.key.as_deref() == Some(key))
        {
            node.hidden = hidden;
        }
    }

    fn absolute(&self, url: &str) -> String {
        if url.contains("://") || url.starts_with("about:") {
            return url.to_string();
        }
        let origin = match self.url.find("://") {
            Some(scheme_end) => {
                let rest = &self.url[scheme_end + 3..];
                let host_end = rest.find('/').map_or(self.url.len(), |i| scheme_end + 3 + i);
                &self.url[..host_end]
            }
            None => "",
        };
        format!("{}/{}", origin, url.trim_start_matches('/'))
    }

    fn rendered(&self, index: usize) -> bool {
        let mut current = Some(index);
        while let Some(i) = current {
            let node = &self.nodes[i];
            if let Some(required) = &node.element.requires {
                if !self.storage.contains_key(required) {
                    return false;
                }
            }
            current = node.parent;
        }
        true
    }

    fn visible(&self, index: usize) -> bool {
        let mut current = Some(index);
        while let Some(i) = current {
            if self.nodes[i].hidden {
                return false;
            }
            current = self.nodes[i].parent;
        }
        self.to_node(index, None, 0.0).bounds.has_area()
    }

    fn node_id(&self, index: usize) -> NodeId {
        NodeId((u64::from(self.generation) << 32) | index as u64)
    }

    /// Map a node id back to a live element.
    fn target(&self, id: NodeId, action: &str) -> EngineResult<usize> {
        let generation = (id.0 >> 32) as u32;
        let index = (id.0 & 0xffff_ffff) as usize;
        if generation != self.generation || index >= self.nodes.len() || !self.rendered(index) {
            return Err(EngineError::action(
                action,
                format!("element {id} is no longer attached"),
            ));
        }
        Ok(index)
    }

    fn to_node(&self, index: usize, parent: Option<usize>, y: f64) -> Node {
        let flat = &self.nodes[index];
        let element = &flat.element;
        let mut attributes = element.attributes.clone();
        if let Some(value) = self.values.get(&index) {
            attributes.insert("value".to_string(), value.clone());
        }
        Node {
            id: self.node_id(index),
            parent,
            tag: element.tag.clone(),
            attributes,
            text: element.text.clone(),
            role: element.role.clone(),
            name: element.name.clone(),
            bounds: Rect {
                x: 0.0,
                y,
                width: element.width.unwrap_or(DEFAULT_WIDTH),
                height: element.height.unwrap_or(DEFAULT_HEIGHT),
            },
            hidden: flat.hidden,
        }
    }

    fn render(&self) -> PageSnapshot {
        let mut positions: HashMap<usize, usize> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut y = 0.0;
        for (index, flat) in self.nodes.iter().enumerate() {
            let parent = match flat.parent {
                Some(p) => match positions.get(&p) {
                    Some(&pos) => Some(pos),
                    None => continue,
                },
                None => None,
            };
            if let Some(required) = &flat.element.requires {
                if !self.storage.contains_key(required) {
                    continue;
                }
            }
            let node = self.to_node(index, parent, y);
            y += node.bounds.height;
            positions.insert(index, nodes.len());
            nodes.push(node);
        }
        PageSnapshot::new(self.url.clone(), self.title.clone(), nodes)
    }

    fn value_of(&self, index: usize) -> String {
        self.values
            .get(&index)
            .cloned()
            .or_else(|| self.nodes[index].element.attributes.get("value").cloned())
            .unwrap_or_default()
    }

    fn label(&self, index: usize) -> String {
        let element = &self.nodes[index].element;
        element
            .key
            .clone()
            .unwrap_or_else(|| format!("<{}>#{}", element.tag, index))
    }

    fn record(&self, action: &str, target: Option<usize>) {
        self.journal.lock().push(JournalEntry {
            scenario: self.scenario.clone(),
            action: action.to_string(),
            target: target.map(|i| self.label(i)),
            url: self.url.clone(),
        });
    }

    fn require_target(index: Option<usize>, action: &str) -> EngineResult<usize> {
        index.ok_or_else(|| EngineError::action(action, "no target element"))
    }

    fn evaluate(&self, script: &str) -> EngineResult<Value> {
        match script.trim() {
            "document.title" => Ok(Value::String(self.title.clone())),
            "location.href" | "window.location.href" => Ok(Value::String(self.url.clone())),
            "window.scrollY" => Ok(Value::from(self.scroll)),
            other => {
                if let Some(name) = other.strip_prefix("storage:") {
                    return Ok(self
                        .storage
                        .get(name.trim())
                        .cloned()
                        .map_or(Value::Null, Value::String));
                }
                self.site.app.scripts.get(other).cloned().ok_or_else(|| {
                    EngineError::action("evaluate", "script is not known to the simulated application")
                })
            }
        }
    }
}

fn element(tag: &str) -> SimElement {
    SimElement {
        key: None,
        tag: tag.to_string(),
        text: String::new(),
        attributes: BTreeMap::new(),
        role: None,
        name: None,
        hidden: false,
        width: None,
        height: None,
        requires: None,
        children: Vec::new(),
        on_click: Vec::new(),
        on_key: BTreeMap::new(),
    }
}

fn flatten(elements: &[SimElement], parent: Option<usize>, out: &mut Vec<FlatNode>) {
    for element in elements {
        let index = out.len();
        out.push(FlatNode {
            element: SimElement {
                children: Vec::new(),
                ..element.clone()
            },
            parent,
            hidden: element.hidden,
        });
        flatten(&element.children, Some(index), out);
    }
}

#[async_trait]
impl Session for SimSession {
    async fn navigate(&mut self, url: &str, options: &NavigateOptions) -> EngineResult<()> {
        self.enter().await?;
        debug!("{}: navigate {} (until {})", self.scenario, url, options.wait_until.as_str());
        let url = self.absolute(url);
        self.load(&url);
        self.record("navigate", None);
        Ok(())
    }

    async fn current_url(&mut self) -> EngineResult<String> {
        self.enter().await?;
        Ok(self.url.clone())
    }

    async fn snapshot(&mut self) -> EngineResult<PageSnapshot> {
        self.enter().await?;
        Ok(self.render())
    }

    async fn act(
        &mut self,
        target: Option<NodeId>,
        interaction: &Interaction,
    ) -> EngineResult<Value> {
        self.enter().await?;
        let action = interaction.name();
        let index = target.map(|id| self.target(id, action)).transpose()?;
        self.record(action, index);

        match interaction {
            Interaction::Click => {
                let i = Self::require_target(index, action)?;
                if !self.visible(i) {
                    return Err(EngineError::action(action, "element is not visible"));
                }
                self.focused = Some(i);
                let effects = self.nodes[i].element.on_click.clone();
                let value = self.value_of(i);
                self.schedule(&effects, &value);
            }
            Interaction::Fill(text) => {
                let i = Self::require_target(index, action)?;
                if !self.to_node(i, None, 0.0).is_editable() {
                    return Err(EngineError::action(action, "element does not accept text input"));
                }
                self.values.insert(i, text.clone());
                self.focused = Some(i);
            }
            Interaction::Press(key) => {
                if index.is_some() {
                    self.focused = index;
                }
                if let Some(i) = self.focused {
                    let effects = self.nodes[i]
                        .element
                        .on_key
                        .get(key)
                        .cloned()
                        .unwrap_or_default();
                    let value = self.value_of(i);
                    self.schedule(&effects, &value);
                }
            }
            Interaction::ScrollIntoView => {
                Self::require_target(index, action)?;
            }
            Interaction::ScrollPage { fraction } => {
                self.scroll = fraction.clamp(0.0, 1.0);
            }
            Interaction::Evaluate(script) => return self.evaluate(script),
        }
        Ok(Value::Null)
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.lost.is_none() {
            self.record("close", None);
        }
        self.lost = Some("session closed".to_string());
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::Locator;
    use crate::session::LoadState;

    const APP: &str = r#"
pages:
  - url: "https://shop.test/search"
    title: Search
    elements:
      - tag: input
        key: query
        attributes: { type: search, aria-label: Search }
        on_key:
          Enter:
            - { effect: navigate, url: "/results?q={value}", delay_ms: 200 }
      - tag: button
        key: more
        text: More
        on_click:
          - { effect: show, key: panel, delay_ms: 150 }
          - { effect: store, name: opened, value: "yes" }
      - key: panel
        hidden: true
        text: Filters
      - key: member
        requires: opened
        children:
          - { tag: a, text: Account }
      - tag: button
        text: Quit
        on_click:
          - { effect: disconnect }
  - url: "https://shop.test/results?q=*"
    title: Results
"#;

    fn options() -> NavigateOptions {
        NavigateOptions {
            wait_until: LoadState::Load,
            timeout: Duration::from_secs(5),
        }
    }

    async fn open(factory: &SimFactory) -> Box<dyn Session> {
        let mut session = factory.open("t").await.unwrap();
        session
            .navigate("https://shop.test/search", &options())
            .await
            .unwrap();
        session
    }

    async fn one(session: &mut Box<dyn Session>, locator: Locator) -> NodeId {
        let ids = session.resolve(&locator).await.unwrap();
        assert_eq!(ids.len(), 1, "{locator}");
        ids[0]
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_show_and_requires() {
        let factory = SimFactory::from_yaml(APP).unwrap();
        let mut session = open(&factory).await;

        assert!(session.resolve(&Locator::text("Account")).await.unwrap().is_empty());
        let more = one(&mut session, Locator::role("button", "More")).await;
        session.act(Some(more), &Interaction::Click).await.unwrap();

        // stored immediately, shown after the delay
        one(&mut session, Locator::text("Account")).await;
        let snapshot = session.snapshot().await.unwrap();
        let panel = Locator::text("Filters").resolve(&snapshot).unwrap()[0];
        assert!(!snapshot.is_visible(panel));

        tokio::time::advance(Duration::from_millis(150)).await;
        let snapshot = session.snapshot().await.unwrap();
        let panel = Locator::text("Filters").resolve(&snapshot).unwrap()[0];
        assert!(snapshot.is_visible(panel));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_effect_encodes_value_and_invalidates_targets() {
        let factory = SimFactory::from_yaml(APP).unwrap();
        let mut session = open(&factory).await;

        let query = one(&mut session, Locator::role("searchbox", "Search")).await;
        session
            .act(Some(query), &Interaction::Fill("brand building".into()))
            .await
            .unwrap();
        session
            .act(Some(query), &Interaction::Press("Enter".into()))
            .await
            .unwrap();
        assert_eq!(session.current_url().await.unwrap(), "https://shop.test/search");

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(
            session.current_url().await.unwrap(),
            "https://shop.test/results?q=brand%20building"
        );

        let err = session.act(Some(query), &Interaction::Click).await.unwrap_err();
        assert!(matches!(err, EngineError::ActionError { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_loses_session() {
        let factory = SimFactory::from_yaml(APP).unwrap();
        let mut session = open(&factory).await;
        let quit = one(&mut session, Locator::role("button", "Quit")).await;
        session.act(Some(quit), &Interaction::Click).await.unwrap();
        assert!(matches!(
            session.snapshot().await,
            Err(EngineError::SessionLost(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_isolated() {
        let factory = SimFactory::from_yaml(APP).unwrap();
        let mut first = open(&factory).await;
        let more = one(&mut first, Locator::role("button", "More")).await;
        first.act(Some(more), &Interaction::Click).await.unwrap();
        let stored = first
            .act(None, &Interaction::Evaluate("storage:opened".into()))
            .await
            .unwrap();
        assert_eq!(stored, Value::String("yes".into()));

        let mut second = open(&factory).await;
        let stored = second
            .act(None, &Interaction::Evaluate("storage:opened".into()))
            .await
            .unwrap();
        assert_eq!(stored, Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_page_and_journal() {
        let factory = SimFactory::from_yaml(APP).unwrap();
        let mut session = factory.open("lost").await.unwrap();
        session
            .navigate("https://shop.test/nowhere", &options())
            .await
            .unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.title, "Not Found");
        session.close().await.unwrap();

        let actions: Vec<String> = factory
            .journal_for("lost")
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["navigate", "close"]);
    }
}

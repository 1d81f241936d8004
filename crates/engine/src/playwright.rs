//! Playwright browser backend
//!
//! Every session spawns its own Node.js driver, which launches a fresh
//! browser (fresh cookies and storage) and answers JSON-line requests on
//! stdin/stdout:
//!
//! ```text
//! -> {"id":3,"op":"act","target":17,"action":"fill","value":"demo"}
//! <- {"id":3,"ok":true,"result":null}
//! <- {"id":4,"ok":false,"kind":"action","error":"element is not editable"}
//! ```
//!
//! The driver tags elements with a `data-fp-id` attribute when it takes a
//! snapshot, so node ids stay stable for the lifetime of the element. The
//! counter lives in the driver rather than the page, so ids are never reused
//! within a session and an id from a page that has since navigated away fails
//! as a detached target instead of hitting an element on the new page.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tracing::{debug, trace, warn};

use crate::config::PlaywrightConfig;
use crate::dom::{NodeId, PageSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::session::{Interaction, NavigateOptions, Session, SessionFactory};

const DRIVER_FILE: &str = "flowprobe-driver.js";

/// Grace period for the driver to shut the browser down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const DRIVER_JS: &str = r#"
const playwright = require('playwright');
const readline = require('readline');

let browser = null;
let page = null;
let nextId = 1;

function reply(msg) {
  process.stdout.write(JSON.stringify(msg) + '\n');
}

function target(id) {
  return page.locator(`[data-fp-id="${id}"]`);
}

async function snapshot() {
  const result = await page.evaluate((start) => {
    let next = Math.max(window.__fpNext || 0, start);
    const nodes = [];
    const visit = (el, parent) => {
      if (!el.hasAttribute('data-fp-id')) el.setAttribute('data-fp-id', String(next++));
      const index = nodes.length;
      const style = window.getComputedStyle(el);
      const rect = el.getBoundingClientRect();
      const attributes = {};
      for (const a of el.attributes) attributes[a.name] = a.value;
      if ('value' in el && typeof el.value === 'string') attributes['value'] = el.value;
      let text = '';
      for (const child of el.childNodes) {
        if (child.nodeType === Node.TEXT_NODE) text += child.textContent;
      }
      nodes.push({
        id: Number(el.getAttribute('data-fp-id')),
        parent,
        tag: el.tagName.toLowerCase(),
        attributes,
        text,
        bounds: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
        hidden: el.hidden || style.display === 'none' || style.visibility === 'hidden',
      });
      for (const child of el.children) visit(child, index);
    };
    if (document.body) visit(document.body, null);
    window.__fpNext = next;
    return { url: location.href, title: document.title, nodes, next };
  }, nextId);
  // window state dies with the document; the counter must not
  nextId = Math.max(nextId, result.next);
  delete result.next;
  return result;
}

async function act(msg) {
  const el = msg.target == null ? null : target(msg.target);
  if (el && (await el.count()) === 0) {
    throw Object.assign(new Error('element is no longer attached'), { kind: 'action' });
  }
  try {
    switch (msg.action) {
      case 'click': await el.click({ timeout: msg.timeout_ms }); return null;
      case 'fill': await el.fill(msg.value, { timeout: msg.timeout_ms }); return null;
      case 'press':
        if (el) await el.press(msg.value, { timeout: msg.timeout_ms });
        else await page.keyboard.press(msg.value);
        return null;
      case 'scroll_into_view': await el.scrollIntoViewIfNeeded({ timeout: msg.timeout_ms }); return null;
      case 'scroll_page':
        await page.evaluate((f) => window.scrollTo(0, document.body.scrollHeight * f), msg.fraction);
        return null;
      case 'evaluate': return await page.evaluate(msg.value);
    }
  } catch (e) {
    throw Object.assign(e, { kind: 'action' });
  }
  throw new Error(`unknown action ${msg.action}`);
}

async function handle(msg) {
  switch (msg.op) {
    case 'launch': {
      browser = await playwright[msg.browser].launch({ headless: msg.headless, slowMo: msg.slow_mo });
      const context = await browser.newContext({ viewport: msg.viewport });
      page = await context.newPage();
      return null;
    }
    case 'goto':
      await page.goto(msg.url, { waitUntil: msg.wait_until, timeout: msg.timeout_ms });
      return null;
    case 'url': return page.url();
    case 'snapshot': return await snapshot();
    case 'act': return await act(msg);
    case 'close':
      if (browser) await browser.close();
      return null;
  }
  throw new Error(`unknown op ${msg.op}`);
}

let queue = Promise.resolve();
readline.createInterface({ input: process.stdin }).on('line', (line) => {
  queue = queue.then(async () => {
    let msg;
    try { msg = JSON.parse(line); } catch (e) { return; }
    try {
      reply({ id: msg.id, ok: true, result: (await handle(msg)) ?? null });
    } catch (e) {
      reply({ id: msg.id, ok: false, kind: e.kind || 'transport', error: String(e.message || e) });
    }
    if (msg.op === 'close') process.exit(0);
  });
});
"#;

/// Check if Playwright is installed
pub fn check_playwright_installed() -> EngineResult<()> {
    let status = Command::new("npx")
        .args(["playwright", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(EngineError::BrowserUnavailable(
            "`npx playwright --version` failed; install playwright with npm".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct Viewport {
    width: u32,
    height: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Launch {
        browser: &'a str,
        headless: bool,
        viewport: Viewport,
        slow_mo: u64,
    },
    Goto {
        url: &'a str,
        wait_until: &'a str,
        timeout_ms: u64,
    },
    Url,
    Snapshot,
    Act {
        target: Option<u64>,
        action: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fraction: Option<f64>,
        timeout_ms: u64,
    },
    Close,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: Request<'a>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Response {
    fn into_result(self, action: &str) -> EngineResult<Value> {
        if self.ok {
            return Ok(self.result);
        }
        let message = self.error.unwrap_or_else(|| "driver reported an error".to_string());
        match self.kind.as_deref() {
            Some("action") => Err(EngineError::action(action, message)),
            _ => Err(EngineError::Transport(message)),
        }
    }
}

/// Opens one driver process, and therefore one browser, per scenario
pub struct PlaywrightFactory {
    config: PlaywrightConfig,
    driver_dir: Arc<TempDir>,
    /// Per-interaction timeout handed to the driver
    action_timeout: Duration,
}

impl PlaywrightFactory {
    pub fn new(config: PlaywrightConfig, action_timeout: Duration) -> EngineResult<Self> {
        check_playwright_installed()?;

        let driver_dir = tempfile::tempdir()?;
        std::fs::write(driver_dir.path().join(DRIVER_FILE), DRIVER_JS)?;
        debug!("Playwright driver staged in {}", driver_dir.path().display());

        Ok(Self {
            config,
            driver_dir: Arc::new(driver_dir),
            action_timeout,
        })
    }

    fn driver_path(&self) -> PathBuf {
        self.driver_dir.path().join(DRIVER_FILE)
    }
}

#[async_trait]
impl SessionFactory for PlaywrightFactory {
    fn name(&self) -> &str {
        "playwright"
    }

    async fn open(&self, scenario: &str) -> EngineResult<Box<dyn Session>> {
        let session = PlaywrightSession::spawn(
            &self.config,
            &self.driver_path(),
            scenario,
            self.action_timeout,
        )
        .await?;
        Ok(Box::new(session))
    }
}

/// A browser driven through its driver process
pub struct PlaywrightSession {
    scenario: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    action_timeout: Duration,
    closed: bool,
}

impl PlaywrightSession {
    async fn spawn(
        config: &PlaywrightConfig,
        driver: &Path,
        scenario: &str,
        action_timeout: Duration,
    ) -> EngineResult<Self> {
        // the driver lives in a tempdir, so point module lookup at the project
        let cwd = std::env::current_dir()?;
        let mut node_path = cwd.join("node_modules").into_os_string();
        if let Some(existing) = std::env::var_os("NODE_PATH") {
            node_path.push(if cfg!(windows) { ";" } else { ":" });
            node_path.push(existing);
        }

        let mut child = TokioCommand::new(&config.node_binary)
            .arg(driver)
            .current_dir(&cwd)
            .env("NODE_PATH", node_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::BrowserUnavailable(format!(
                    "failed to start {}: {}",
                    config.node_binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Transport("driver stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Transport("driver stdout unavailable".to_string()))?;

        let mut session = Self {
            scenario: scenario.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            action_timeout,
            closed: false,
        };

        session
            .call(
                "launch",
                Request::Launch {
                    browser: config.browser.as_str(),
                    headless: config.headless,
                    viewport: Viewport {
                        width: config.viewport_width,
                        height: config.viewport_height,
                    },
                    slow_mo: config.slow_mo_ms,
                },
            )
            .await
            .map_err(|e| EngineError::BrowserUnavailable(e.to_string()))?;

        debug!(
            "{}: {} browser launched (headless: {})",
            scenario,
            config.browser.as_str(),
            config.headless
        );
        Ok(session)
    }

    async fn call(&mut self, action: &str, request: Request<'_>) -> EngineResult<Value> {
        if self.closed {
            return Err(EngineError::SessionLost("session closed".to_string()));
        }
        self.next_id += 1;
        let id = self.next_id;

        let mut line = serde_json::to_string(&Envelope { id, request })?;
        line.push('\n');
        trace!("{} -> {}", self.scenario, line.trim_end());

        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            return Err(EngineError::SessionLost(format!("driver pipe closed: {e}")));
        }
        if let Err(e) = self.stdin.flush().await {
            return Err(EngineError::SessionLost(format!("driver pipe closed: {e}")));
        }

        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(EngineError::SessionLost("driver exited".to_string())),
                Err(e) => return Err(EngineError::SessionLost(format!("driver read failed: {e}"))),
            };
            let response: Response = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(_) => {
                    trace!("{} driver output: {}", self.scenario, line);
                    continue;
                }
            };
            // replies to requests abandoned on timeout arrive late; drop them
            if response.id != id {
                trace!("{}: discarding stale reply {}", self.scenario, response.id);
                continue;
            }
            return response.into_result(action);
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.action_timeout.as_millis() as u64
    }
}

#[async_trait]
impl Session for PlaywrightSession {
    async fn navigate(&mut self, url: &str, options: &NavigateOptions) -> EngineResult<()> {
        self.call(
            "navigate",
            Request::Goto {
                url,
                wait_until: options.wait_until.as_str(),
                timeout_ms: options.timeout.as_millis() as u64,
            },
        )
        .await?;
        Ok(())
    }

    async fn current_url(&mut self) -> EngineResult<String> {
        match self.call("url", Request::Url).await? {
            Value::String(url) => Ok(url),
            other => Err(EngineError::Transport(format!("unexpected url reply: {other}"))),
        }
    }

    async fn snapshot(&mut self) -> EngineResult<PageSnapshot> {
        let value = self.call("snapshot", Request::Snapshot).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn act(&mut self, target: Option<NodeId>, interaction: &Interaction) -> EngineResult<Value> {
        let (value, fraction) = match interaction {
            Interaction::Fill(text) => (Some(text.as_str()), None),
            Interaction::Press(key) => (Some(key.as_str()), None),
            Interaction::Evaluate(script) => (Some(script.as_str()), None),
            Interaction::ScrollPage { fraction } => (None, Some(*fraction)),
            Interaction::Click | Interaction::ScrollIntoView => (None, None),
        };
        let timeout_ms = self.timeout_ms();
        let action = interaction.name();
        self.call(
            action,
            Request::Act {
                target: target.map(|id| id.0),
                action,
                value,
                fraction,
                timeout_ms,
            },
        )
        .await
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        let reply = tokio::time::timeout(CLOSE_TIMEOUT, self.call("close", Request::Close)).await;
        self.closed = true;
        if !matches!(reply, Ok(Ok(_))) {
            warn!("{}: driver did not close cleanly, killing it", self.scenario);
            self.child.kill().await?;
        }
        self.child.wait().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let line = serde_json::to_value(Envelope {
            id: 7,
            request: Request::Act {
                target: Some(17),
                action: "fill",
                value: Some("demo"),
                fraction: None,
                timeout_ms: 5000,
            },
        })
        .unwrap();
        assert_eq!(
            line,
            serde_json::json!({
                "id": 7, "op": "act", "target": 17, "action": "fill",
                "value": "demo", "timeout_ms": 5000
            })
        );

        let url = serde_json::to_value(Envelope {
            id: 8,
            request: Request::Url,
        })
        .unwrap();
        assert_eq!(url, serde_json::json!({ "id": 8, "op": "url" }));
    }

    #[test]
    fn test_error_replies_map_to_engine_errors() {
        let reply: Response = serde_json::from_str(
            r#"{"id":1,"ok":false,"kind":"action","error":"element is not an <input>"}"#,
        )
        .unwrap();
        assert!(matches!(
            reply.into_result("fill"),
            Err(EngineError::ActionError { action, .. }) if action == "fill"
        ));

        let reply: Response =
            serde_json::from_str(r#"{"id":2,"ok":false,"error":"net::ERR_NAME_NOT_RESOLVED"}"#)
                .unwrap();
        assert!(matches!(reply.into_result("navigate"), Err(EngineError::Transport(_))));
    }

    #[test]
    fn test_snapshot_reply_parses() {
        let reply: Response = serde_json::from_str(
            r#"{"id":3,"ok":true,"result":{"url":"https://x.test/","title":"X","nodes":[
                {"id":1,"parent":null,"tag":"body","attributes":{"data-fp-id":"1"},"text":"",
                 "bounds":{"x":0,"y":0,"width":800,"height":600},"hidden":false},
                {"id":2,"parent":0,"tag":"button","attributes":{},"text":"Sign in",
                 "bounds":{"x":0,"y":0,"width":80,"height":30},"hidden":false}]}}"#,
        )
        .unwrap();
        let snapshot: PageSnapshot = serde_json::from_value(reply.into_result("snapshot").unwrap()).unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.node(1).role(), Some("button"));
        assert!(snapshot.is_visible(1));
    }

    #[test]
    fn test_driver_id_counter_survives_page_loads() {
        assert!(DRIVER_JS.contains("Math.max(window.__fpNext || 0, start)"));
        assert!(DRIVER_JS.contains("nextId = Math.max(nextId, result.next)"));
    }

    #[test]
    fn test_driver_handles_every_op() {
        for op in ["'launch'", "'goto'", "'url'", "'snapshot'", "'act'", "'close'"] {
            assert!(DRIVER_JS.contains(&format!("case {op}")), "{op}");
        }
    }
}

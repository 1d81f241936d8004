//! Declarative element locators
//!
//! A [`Locator`] pairs a matching [`Strategy`] with an optional disambiguation
//! index ([`Nth`]) and an optional `has_text` filter. Resolution against a
//! [`PageSnapshot`] always yields candidates in document order, so the same
//! snapshot resolves the same way on every run.
//!
//! Locators can be written in full form or as a shorthand string:
//!
//! ```text
//! role=textbox[name="Username"]
//! text=Explore Akasa >> nth=first
//! css=p:has-text("Improve Brand Building")
//! attr=title=Descriptive
//! .modeTitle, [class*="mode"]        (anything else is a CSS pattern)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dom::{normalize_whitespace, PageSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::selector::SelectorList;

/// How to find candidate elements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Strategy {
    /// ARIA role plus accessible name
    Role {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        exact: bool,
    },

    /// Innermost elements whose text contains (or equals) the value
    Text {
        text: String,
        #[serde(default)]
        exact: bool,
    },

    /// Structural CSS-like pattern
    Css { selector: String },

    /// Attribute presence or equality
    Attribute {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

/// Declared disambiguation when several candidates match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NthRepr", into = "NthRepr")]
pub enum Nth {
    First,
    Last,
    Index(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum NthRepr {
    Index(usize),
    Keyword(String),
}

impl TryFrom<NthRepr> for Nth {
    type Error = String;

    fn try_from(repr: NthRepr) -> Result<Self, Self::Error> {
        match repr {
            NthRepr::Index(0) => Ok(Nth::First),
            NthRepr::Index(i) => Ok(Nth::Index(i)),
            NthRepr::Keyword(k) => Nth::parse(&k).ok_or_else(|| format!("invalid nth '{k}'")),
        }
    }
}

impl From<Nth> for NthRepr {
    fn from(nth: Nth) -> Self {
        match nth {
            Nth::First => NthRepr::Keyword("first".to_string()),
            Nth::Last => NthRepr::Keyword("last".to_string()),
            Nth::Index(i) => NthRepr::Index(i),
        }
    }
}

impl Nth {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "first" | "0" => Some(Nth::First),
            "last" | "-1" => Some(Nth::Last),
            other => other.parse().ok().map(Nth::Index),
        }
    }
}

impl fmt::Display for Nth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nth::First => f.write_str("first"),
            Nth::Last => f.write_str("last"),
            Nth::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Outcome of applying the disambiguation policy to a candidate list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    None,
    One(usize),
    Ambiguous(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LocatorRepr", into = "LocatorRepr")]
pub struct Locator {
    pub strategy: Strategy,
    pub nth: Option<Nth>,
    pub has_text: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LocatorRepr {
    Shorthand(String),
    Full(FullLocator),
}

#[derive(Serialize, Deserialize)]
struct FullLocator {
    #[serde(flatten)]
    strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nth: Option<Nth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_text: Option<String>,
}

impl TryFrom<LocatorRepr> for Locator {
    type Error = EngineError;

    fn try_from(repr: LocatorRepr) -> Result<Self, Self::Error> {
        let locator = match repr {
            LocatorRepr::Shorthand(s) => Locator::parse(&s)?,
            LocatorRepr::Full(full) => Locator {
                strategy: full.strategy,
                nth: full.nth,
                has_text: full.has_text,
            },
        };
        locator.compile()?;
        Ok(locator)
    }
}

impl From<Locator> for LocatorRepr {
    fn from(locator: Locator) -> Self {
        LocatorRepr::Full(FullLocator {
            strategy: locator.strategy,
            nth: locator.nth,
            has_text: locator.has_text,
        })
    }
}

impl Locator {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            nth: None,
            has_text: None,
        }
    }

    pub fn role(role: &str, name: &str) -> Self {
        Self::new(Strategy::Role {
            role: role.to_string(),
            name: Some(name.to_string()),
            exact: false,
        })
    }

    pub fn text(text: &str) -> Self {
        Self::new(Strategy::Text {
            text: text.to_string(),
            exact: false,
        })
    }

    pub fn css(selector: &str) -> Self {
        Self::new(Strategy::Css {
            selector: selector.to_string(),
        })
    }

    pub fn attribute(name: &str, value: &str) -> Self {
        Self::new(Strategy::Attribute {
            name: name.to_string(),
            value: Some(value.to_string()),
        })
    }

    pub fn first(mut self) -> Self {
        self.nth = Some(Nth::First);
        self
    }

    pub fn nth(mut self, nth: Nth) -> Self {
        self.nth = Some(nth);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.has_text = Some(text.to_string());
        self
    }

    /// Parse the shorthand string form.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let invalid = |reason: &str| EngineError::InvalidLocator {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let mut body = input.trim();
        let mut nth = None;
        if let Some((head, tail)) = body.rsplit_once(">>") {
            if let Some(value) = tail.trim().strip_prefix("nth=") {
                nth = Some(Nth::parse(value).ok_or_else(|| invalid("invalid nth"))?);
                body = head.trim();
            }
        }
        if body.is_empty() {
            return Err(invalid("empty locator"));
        }

        let strategy = if let Some(rest) = body.strip_prefix("role=") {
            parse_role(rest).ok_or_else(|| invalid("expected role=<role>[name=\"...\"]"))?
        } else if let Some(rest) = body.strip_prefix("text=") {
            match unquote(rest) {
                Some(text) => Strategy::Text { text, exact: true },
                None => Strategy::Text {
                    text: rest.to_string(),
                    exact: false,
                },
            }
        } else if let Some(rest) = body.strip_prefix("css=") {
            Strategy::Css {
                selector: rest.to_string(),
            }
        } else if let Some(rest) = body.strip_prefix("attr=") {
            match rest.split_once('=') {
                Some((name, value)) => Strategy::Attribute {
                    name: name.trim().to_string(),
                    value: Some(unquote(value).unwrap_or_else(|| value.to_string())),
                },
                None => Strategy::Attribute {
                    name: rest.trim().to_string(),
                    value: None,
                },
            }
        } else {
            Strategy::Css {
                selector: body.to_string(),
            }
        };

        let locator = Locator {
            strategy,
            nth,
            has_text: None,
        };
        locator.compile()?;
        Ok(locator)
    }

    /// Reject selectors that cannot be compiled, without resolving anything.
    pub fn check(&self) -> EngineResult<()> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> EngineResult<Box<dyn Matcher>> {
        Ok(match &self.strategy {
            Strategy::Role { role, name, exact } => Box::new(RoleMatcher {
                role: role.to_ascii_lowercase(),
                name: name.as_deref().map(normalize_whitespace),
                exact: *exact,
            }),
            Strategy::Text { text, exact } => {
                let needle = normalize_whitespace(text);
                Box::new(TextMatcher {
                    folded: needle.to_lowercase(),
                    needle,
                    exact: *exact,
                })
            }
            Strategy::Css { selector } => Box::new(SelectorList::parse(selector)?),
            Strategy::Attribute { name, value } => Box::new(AttributeMatcher {
                name: name.clone(),
                value: value.clone(),
            }),
        })
    }

    /// Candidate node indices in document order, possibly empty.
    pub fn resolve(&self, snapshot: &PageSnapshot) -> EngineResult<Vec<usize>> {
        let mut candidates = self.compile()?.candidates(snapshot);
        if let Some(filter) = &self.has_text {
            let needle = normalize_whitespace(filter).to_lowercase();
            candidates.retain(|&i| snapshot.text_content(i).to_lowercase().contains(&needle));
        }
        Ok(candidates)
    }

    /// Apply the disambiguation policy. Without a declared `nth`, more than
    /// one candidate is ambiguous.
    pub fn pick(&self, candidates: &[usize]) -> Selection {
        let chosen = match self.nth {
            None => match candidates {
                [] => None,
                [only] => Some(*only),
                many => return Selection::Ambiguous(many.len()),
            },
            Some(Nth::First) => candidates.first().copied(),
            Some(Nth::Last) => candidates.last().copied(),
            Some(Nth::Index(i)) => candidates.get(i).copied(),
        };
        chosen.map_or(Selection::None, Selection::One)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.strategy {
            Strategy::Role { role, name, exact } => {
                write!(f, "role={role}")?;
                if let Some(name) = name {
                    write!(f, "[name=\"{name}\"{}]", if *exact { "s" } else { "" })?;
                }
            }
            Strategy::Text { text, exact: true } => write!(f, "text=\"{text}\"")?,
            Strategy::Text { text, exact: false } => write!(f, "text={text}")?,
            Strategy::Css { selector } => write!(f, "css={selector}")?,
            Strategy::Attribute { name, value: Some(v) } => write!(f, "attr={name}={v}")?,
            Strategy::Attribute { name, value: None } => write!(f, "attr={name}")?,
        }
        if let Some(text) = &self.has_text {
            write!(f, " >> has-text=\"{text}\"")?;
        }
        if let Some(nth) = &self.nth {
            write!(f, " >> nth={nth}")?;
        }
        Ok(())
    }
}

/// Shared capability of every locator strategy.
trait Matcher {
    fn candidates(&self, snapshot: &PageSnapshot) -> Vec<usize>;
}

struct RoleMatcher {
    role: String,
    name: Option<String>,
    exact: bool,
}

impl Matcher for RoleMatcher {
    fn candidates(&self, snapshot: &PageSnapshot) -> Vec<usize> {
        (0..snapshot.nodes.len())
            .filter(|&i| {
                snapshot
                    .node(i)
                    .role()
                    .is_some_and(|r| r.eq_ignore_ascii_case(&self.role))
            })
            .filter(|&i| !snapshot.is_hidden(i))
            .filter(|&i| match &self.name {
                None => true,
                Some(expected) => {
                    let actual = snapshot.accessible_name(i);
                    if self.exact {
                        actual == *expected
                    } else {
                        actual.to_lowercase().contains(&expected.to_lowercase())
                    }
                }
            })
            .collect()
    }
}

struct TextMatcher {
    needle: String,
    folded: String,
    exact: bool,
}

impl TextMatcher {
    fn accepts(&self, text: &str) -> bool {
        if self.exact {
            text == self.needle
        } else {
            text.to_lowercase().contains(&self.folded)
        }
    }
}

impl Matcher for TextMatcher {
    fn candidates(&self, snapshot: &PageSnapshot) -> Vec<usize> {
        (0..snapshot.nodes.len())
            .filter(|&i| !matches!(snapshot.node(i).tag.as_str(), "script" | "style" | "head"))
            .filter(|&i| self.accepts(snapshot.text_content(i)))
            // innermost only: skip elements whose child element also matches
            .filter(|&i| {
                !snapshot
                    .children(i)
                    .any(|c| self.accepts(snapshot.text_content(c)))
            })
            .collect()
    }
}

impl Matcher for SelectorList {
    fn candidates(&self, snapshot: &PageSnapshot) -> Vec<usize> {
        self.select(snapshot)
    }
}

struct AttributeMatcher {
    name: String,
    value: Option<String>,
}

impl Matcher for AttributeMatcher {
    fn candidates(&self, snapshot: &PageSnapshot) -> Vec<usize> {
        (0..snapshot.nodes.len())
            .filter(|&i| match (snapshot.node(i).attr(&self.name), &self.value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect()
    }
}

fn parse_role(rest: &str) -> Option<Strategy> {
    let (role, options) = match rest.split_once('[') {
        Some((role, options)) => (role.trim(), Some(options.strip_suffix(']')?)),
        None => (rest.trim(), None),
    };
    if role.is_empty() || !role.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    let mut name = None;
    let mut exact = false;
    if let Some(options) = options {
        let value = options.trim().strip_prefix("name=")?;
        let (value, flag_exact) = match value.strip_suffix('s') {
            Some(v) if v.ends_with('"') || v.ends_with('\'') => (v, true),
            _ => (value, false),
        };
        name = Some(unquote(value).unwrap_or_else(|| value.to_string()));
        exact = flag_exact;
    }
    Some(Strategy::Role {
        role: role.to_string(),
        name,
        exact,
    })
}

fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    quoted.then(|| s[1..s.len() - 1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fixtures::SnapshotBuilder;

    fn workspace_page() -> PageSnapshot {
        let mut b = SnapshotBuilder::new("https://app.test/waves?m=1");
        let body = b.push(None, "body", &[], "");
        for section in ["Grow Reach", "Retain Users", "Expand Markets"] {
            let card = b.push(Some(body), "div", &[("class", "card")], "");
            b.push(Some(card), "h3", &[], section);
            b.push(Some(card), "button", &[], "Explore Akasa");
        }
        let hidden = b.push(Some(body), "button", &[], "Sign in");
        b.hide(hidden);
        b.push(Some(body), "input", &[("aria-label", "Search Artifacts")], "");
        b.build()
    }

    #[test]
    fn test_parse_shorthand_forms() {
        let role = Locator::parse(r#"role=button[name="Sign in"]"#).unwrap();
        assert_eq!(role, Locator::role("button", "Sign in"));

        let text = Locator::parse("text=Explore Akasa >> nth=first").unwrap();
        assert_eq!(text, Locator::text("Explore Akasa").first());

        let exact = Locator::parse(r#"text="Editing""#).unwrap();
        assert_eq!(
            exact.strategy,
            Strategy::Text {
                text: "Editing".into(),
                exact: true
            }
        );

        let attr = Locator::parse("attr=title=Descriptive").unwrap();
        assert_eq!(attr, Locator::attribute("title", "Descriptive"));

        let css = Locator::parse(r#"p:has-text("Improve Brand Building")"#).unwrap();
        assert!(matches!(css.strategy, Strategy::Css { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_css() {
        assert!(Locator::parse("css=div[").is_err());
        assert!(Locator::parse("role=[name=x]").is_err());
    }

    #[test]
    fn test_deserialize_both_forms() {
        let yaml = r#"
- "role=textbox[name=Username]"
- by: text
  text: Explore Akasa
  nth: first
- by: css
  selector: ".modeTitle, [class*=\"mode\"]"
  has_text: View Only
- by: attribute
  name: title
  value: Descriptive
  nth: 2
"#;
        let locators: Vec<Locator> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(locators[0], Locator::role("textbox", "Username"));
        assert_eq!(locators[1].nth, Some(Nth::First));
        assert_eq!(locators[2].has_text.as_deref(), Some("View Only"));
        assert_eq!(locators[3].nth, Some(Nth::Index(2)));
    }

    #[test]
    fn test_text_resolves_innermost_in_document_order() {
        let page = workspace_page();
        let locator = Locator::text("Explore Akasa");
        let first = locator.resolve(&page).unwrap();
        assert_eq!(first, vec![3, 6, 9]);
        // unchanged snapshot, unchanged order
        assert_eq!(locator.resolve(&page).unwrap(), first);
    }

    #[test]
    fn test_ambiguity_requires_declared_index() {
        let page = workspace_page();
        let candidates = Locator::text("Explore Akasa").resolve(&page).unwrap();

        assert_eq!(
            Locator::text("Explore Akasa").pick(&candidates),
            Selection::Ambiguous(3)
        );
        assert_eq!(
            Locator::text("Explore Akasa").first().pick(&candidates),
            Selection::One(3)
        );
        assert_eq!(
            Locator::text("Explore Akasa").nth(Nth::Last).pick(&candidates),
            Selection::One(9)
        );
        assert_eq!(
            Locator::text("Explore Akasa").nth(Nth::Index(7)).pick(&candidates),
            Selection::None
        );
    }

    #[test]
    fn test_role_skips_hidden_and_matches_name() {
        let page = workspace_page();
        assert!(Locator::role("button", "Sign in")
            .resolve(&page)
            .unwrap()
            .is_empty());
        assert_eq!(
            Locator::role("textbox", "search artifacts")
                .resolve(&page)
                .unwrap(),
            vec![11]
        );
    }

    #[test]
    fn test_has_text_filter() {
        let page = workspace_page();
        let cards = Locator::css(".card").with_text("Retain");
        assert_eq!(cards.resolve(&page).unwrap(), vec![4]);
    }

    #[test]
    fn test_large_page_resolves_every_strategy() {
        let page = SnapshotBuilder::catalogue(4000);

        let exact = Locator::parse(r#"text="Artifact 3999""#).unwrap();
        assert_eq!(exact.resolve(&page).unwrap(), vec![page.nodes.len() - 7]);

        let open = Locator::role("button", "Open").resolve(&page).unwrap();
        assert_eq!(open.len(), 4000);
        assert_eq!(open[0], 8);

        let team = Locator::css(".card").with_text("owner team 6");
        assert_eq!(team.resolve(&page).unwrap().len(), 571);
    }

    #[test]
    fn test_display_is_readable() {
        let locator = Locator::text("Explore Akasa").first();
        assert_eq!(locator.to_string(), "text=Explore Akasa >> nth=first");
    }
}

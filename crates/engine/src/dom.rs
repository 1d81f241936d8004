//! Page snapshot model
//!
//! A [`PageSnapshot`] is a flattened, document-ordered view of the page that
//! session backends produce and the locator resolver consumes. Nodes refer to
//! their parent by index, so ancestor walks are cheap and ordering is stable.
//!
//! Child lists, text content and label lookups are derived in one linear pass
//! the first time a snapshot is queried, so resolving a locator stays linear in
//! the size of the page. The node list must not change after that.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

/// Opaque handle to an element, valid for the session that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// A single element in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    /// Index of the parent node in [`PageSnapshot::nodes`]
    #[serde(default)]
    pub parent: Option<usize>,

    /// Lower-case tag name
    pub tag: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Text directly owned by this element (not its descendants)
    #[serde(default)]
    pub text: String,

    /// Backend-computed ARIA role, when the backend knows better than the tag
    #[serde(default)]
    pub role: Option<String>,

    /// Backend-computed accessible name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub bounds: Rect,

    /// Hidden by styling (`display: none`, `visibility: hidden`, `hidden`)
    #[serde(default)]
    pub hidden: bool,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }

    fn input_type(&self) -> String {
        self.attr("type").unwrap_or("text").to_ascii_lowercase()
    }

    /// Role implied by the element itself, ignoring `role` overrides.
    fn implicit_role(&self) -> Option<&'static str> {
        let role = match self.tag.as_str() {
            "button" => "button",
            "a" if self.attributes.contains_key("href") => "link",
            "textarea" => "textbox",
            "select" => "combobox",
            "input" => match self.input_type().as_str() {
                "button" | "submit" | "reset" | "image" => "button",
                "checkbox" => "checkbox",
                "radio" => "radio",
                "search" => "searchbox",
                "range" => "slider",
                "number" => "spinbutton",
                "hidden" | "file" | "color" => return None,
                _ => "textbox",
            },
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
            "img" => "img",
            "ul" | "ol" => "list",
            "li" => "listitem",
            "nav" => "navigation",
            "main" => "main",
            "dialog" => "dialog",
            "table" => "table",
            "p" => "paragraph",
            "option" => "option",
            _ => return None,
        };
        Some(role)
    }

    /// Effective ARIA role: backend value, then `role` attribute, then the tag.
    pub fn role(&self) -> Option<&str> {
        if let Some(role) = self.role.as_deref() {
            return Some(role);
        }
        if let Some(role) = self.attr("role") {
            return role.split_whitespace().next();
        }
        self.implicit_role()
    }

    /// Whether the element accepts typed text.
    pub fn is_editable(&self) -> bool {
        if self.attributes.contains_key("disabled") || self.attributes.contains_key("readonly") {
            return false;
        }
        match self.tag.as_str() {
            "textarea" => true,
            "input" => !matches!(
                self.input_type().as_str(),
                "button"
                    | "submit"
                    | "reset"
                    | "image"
                    | "checkbox"
                    | "radio"
                    | "hidden"
                    | "file"
                    | "range"
                    | "color"
            ),
            _ => matches!(self.attr("contenteditable"), Some(v) if v != "false"),
        }
    }
}

/// Document-ordered snapshot of a page
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,

    #[serde(default)]
    pub title: String,

    /// Nodes in document (pre-)order; parents always precede children
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(skip)]
    outline: OnceLock<Outline>,
}

/// Derived structure of a snapshot, indexed like [`PageSnapshot::nodes`]
#[derive(Debug, Clone, Default)]
struct Outline {
    children: Vec<Vec<usize>>,
    text: Vec<String>,
    html_ids: HashMap<String, usize>,
    labels: HashMap<String, usize>,
}

impl Outline {
    fn build(nodes: &[Node]) -> Self {
        let mut children = vec![Vec::new(); nodes.len()];
        let mut html_ids = HashMap::new();
        let mut labels = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent.filter(|&p| p < index) {
                children[parent].push(index);
            }
            if let Some(id) = node.attr("id") {
                html_ids.entry(id.to_string()).or_insert(index);
            }
            if node.tag == "label" {
                if let Some(target) = node.attr("for") {
                    labels.entry(target.to_string()).or_insert(index);
                }
            }
        }

        // children always follow their parent, so a reverse sweep sees every
        // child's text before the parent needs it
        let mut text = vec![String::new(); nodes.len()];
        for index in (0..nodes.len()).rev() {
            let node = &nodes[index];
            if matches!(node.tag.as_str(), "script" | "style" | "head") {
                continue;
            }
            let own = normalize_whitespace(&node.text);
            let mut parts: Vec<&str> = Vec::new();
            if !own.is_empty() {
                parts.push(&own);
            }
            if node.tag != "input" && node.tag != "textarea" {
                parts.extend(
                    children[index]
                        .iter()
                        .map(|&c| text[c].as_str())
                        .filter(|t| !t.is_empty()),
                );
            }
            let joined = parts.join(" ");
            text[index] = joined;
        }

        Self {
            children,
            text,
            html_ids,
            labels,
        }
    }
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>, title: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            nodes,
            outline: OnceLock::new(),
        }
    }

    fn outline(&self) -> &Outline {
        self.outline.get_or_init(|| Outline::build(&self.nodes))
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Ancestors of `index`, nearest first.
    pub fn ancestors(&self, index: usize) -> Ancestors<'_> {
        Ancestors {
            snapshot: self,
            next: self.nodes[index].parent,
        }
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.outline().children[index].iter().copied()
    }

    /// Concatenated text of the element and its descendants, whitespace-normalised.
    pub fn text_content(&self, index: usize) -> &str {
        &self.outline().text[index]
    }

    /// Hidden by the node itself or any ancestor.
    pub fn is_hidden(&self, index: usize) -> bool {
        self.nodes[index].hidden || self.ancestors(index).any(|a| self.nodes[a].hidden)
    }

    /// Attached, not hidden, and rendered with non-zero size.
    pub fn is_visible(&self, index: usize) -> bool {
        !self.is_hidden(index) && self.nodes[index].bounds.has_area()
    }

    /// Accessible name following a reduced version of the accname algorithm.
    pub fn accessible_name(&self, index: usize) -> String {
        let node = &self.nodes[index];
        if let Some(name) = node.name.as_deref() {
            return normalize_whitespace(name);
        }
        if let Some(label) = node.attr("aria-label").filter(|l| !l.trim().is_empty()) {
            return normalize_whitespace(label);
        }
        if let Some(ids) = node.attr("aria-labelledby") {
            let joined: Vec<String> = ids
                .split_whitespace()
                .filter_map(|id| self.find_by_html_id(id))
                .map(|i| self.text_content(i).to_string())
                .collect();
            if !joined.is_empty() {
                return joined.join(" ");
            }
        }
        let is_field = matches!(node.tag.as_str(), "input" | "textarea" | "select");
        if is_field {
            if let Some(label) = self.label_for(index) {
                return label;
            }
            if let Some(placeholder) = node.attr("placeholder") {
                return normalize_whitespace(placeholder);
            }
            if let Some(value) = node.attr("value").filter(|_| node.role() == Some("button")) {
                return normalize_whitespace(value);
            }
        } else {
            let text = self.text_content(index);
            if !text.is_empty() {
                return text.to_string();
            }
        }
        node.attr("title").map(normalize_whitespace).unwrap_or_default()
    }

    fn find_by_html_id(&self, id: &str) -> Option<usize> {
        self.outline().html_ids.get(id).copied()
    }

    fn label_for(&self, index: usize) -> Option<String> {
        let explicit = self.nodes[index]
            .attr("id")
            .and_then(|id| self.outline().labels.get(id).copied());
        explicit
            .or_else(|| self.ancestors(index).find(|&a| self.nodes[a].tag == "label"))
            .map(|label| self.text_content(label).to_string())
    }
}

pub struct Ancestors<'a> {
    snapshot: &'a PageSnapshot,
    next: Option<usize>,
}

impl Iterator for Ancestors<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.snapshot.nodes[current].parent;
        Some(current)
    }
}

pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Small builder for hand-written snapshots in unit tests.
    pub struct SnapshotBuilder {
        snapshot: PageSnapshot,
    }

    impl SnapshotBuilder {
        pub fn new(url: &str) -> Self {
            Self {
                snapshot: PageSnapshot::new(url, "", Vec::new()),
            }
        }

        pub fn push(
            &mut self,
            parent: Option<usize>,
            tag: &str,
            attrs: &[(&str, &str)],
            text: &str,
        ) -> usize {
            let index = self.snapshot.nodes.len();
            self.snapshot.nodes.push(Node {
                id: NodeId(index as u64 + 1),
                parent,
                tag: tag.to_string(),
                attributes: attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                text: text.to_string(),
                role: None,
                name: None,
                bounds: Rect {
                    x: 0.0,
                    y: index as f64 * 24.0,
                    width: 120.0,
                    height: 24.0,
                },
                hidden: false,
            });
            index
        }

        pub fn hide(&mut self, index: usize) -> &mut Self {
            self.snapshot.nodes[index].hidden = true;
            self
        }

        pub fn collapse(&mut self, index: usize) -> &mut Self {
            self.snapshot.nodes[index].bounds.width = 0.0;
            self
        }

        /// A listing page with `cards` cards of eight elements each.
        pub fn catalogue(cards: usize) -> PageSnapshot {
            let mut b = SnapshotBuilder::new("https://app.test/catalogue");
            let body = b.push(None, "body", &[], "");
            let main = b.push(Some(body), "main", &[], "");
            for i in 0..cards {
                let card = b.push(Some(main), "div", &[("class", "card")], "");
                b.push(Some(card), "h3", &[], &format!("Artifact {i}"));
                b.push(Some(card), "p", &[], &format!("Owner team {}", i % 7));
                let tags = b.push(Some(card), "ul", &[], "");
                b.push(Some(tags), "li", &[], "Brand");
                b.push(Some(tags), "li", &[], "Growth");
                b.push(Some(card), "button", &[], "Open");
                b.push(Some(card), "span", &[("hidden", "")], "");
            }
            b.build()
        }

        pub fn build(&self) -> PageSnapshot {
            PageSnapshot::new(
                self.snapshot.url.clone(),
                self.snapshot.title.clone(),
                self.snapshot.nodes.clone(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::SnapshotBuilder;

    #[test]
    fn test_text_content_includes_descendants() {
        let mut b = SnapshotBuilder::new("https://app.test/");
        let body = b.push(None, "body", &[], "");
        let p = b.push(Some(body), "p", &[], "Improve");
        b.push(Some(p), "span", &[], "  Brand\n Building ");
        let snap = b.build();

        assert_eq!(snap.text_content(p), "Improve Brand Building");
        assert_eq!(snap.text_content(body), "Improve Brand Building");
    }

    #[test]
    fn test_outline_of_large_page() {
        let snap = SnapshotBuilder::catalogue(5000);
        assert_eq!(snap.nodes.len(), 2 + 5000 * 8);

        let last_card = snap.nodes.len() - 8;
        assert_eq!(snap.text_content(last_card), "Artifact 4999 Owner team 1 Brand Growth Open");
        assert_eq!(snap.children(last_card).count(), 5);
        assert_eq!(snap.children(1).count(), 5000);
        assert!(snap.text_content(0).ends_with("Artifact 4999 Owner team 1 Brand Growth Open"));
    }

    #[test]
    fn test_text_skips_scripts_and_field_descendants() {
        let mut b = SnapshotBuilder::new("https://app.test/");
        let body = b.push(None, "body", &[], "Intro");
        b.push(Some(body), "script", &[], "var x = 1;");
        let area = b.push(Some(body), "textarea", &[], "draft");
        b.push(Some(area), "span", &[], "ignored");
        b.push(Some(body), "p", &[], "Outro");
        let snap = b.build();

        assert_eq!(snap.text_content(body), "Intro draft Outro");
        assert_eq!(snap.text_content(area), "draft");
    }

    #[test]
    fn test_visibility_inherits_hidden_ancestor() {
        let mut b = SnapshotBuilder::new("https://app.test/");
        let body = b.push(None, "body", &[], "");
        let modal = b.push(Some(body), "div", &[], "");
        let button = b.push(Some(modal), "button", &[], "Confirm");
        let empty = b.push(Some(body), "div", &[], "");
        b.hide(modal).collapse(empty);
        let snap = b.build();

        assert!(!snap.is_visible(button));
        assert!(!snap.is_visible(empty));
        assert!(snap.is_visible(body));
    }

    #[test]
    fn test_roles_and_names() {
        let mut b = SnapshotBuilder::new("https://app.test/");
        let body = b.push(None, "body", &[], "");
        let label = b.push(Some(body), "label", &[("for", "user")], "Username");
        let user = b.push(Some(body), "input", &[("id", "user")], "");
        let pass = b.push(
            Some(body),
            "input",
            &[("type", "password"), ("placeholder", "Password")],
            "",
        );
        let submit = b.push(Some(body), "button", &[("type", "submit")], "Sign in");
        let snap = b.build();

        assert_eq!(snap.node(label).role(), None);
        assert_eq!(snap.node(user).role(), Some("textbox"));
        assert_eq!(snap.accessible_name(user), "Username");
        assert_eq!(snap.node(pass).role(), Some("textbox"));
        assert_eq!(snap.accessible_name(pass), "Password");
        assert_eq!(snap.node(submit).role(), Some("button"));
        assert_eq!(snap.accessible_name(submit), "Sign in");
    }

    #[test]
    fn test_editable_elements() {
        let mut b = SnapshotBuilder::new("https://app.test/");
        let body = b.push(None, "body", &[], "");
        let input = b.push(Some(body), "input", &[], "");
        let checkbox = b.push(Some(body), "input", &[("type", "checkbox")], "");
        let disabled = b.push(Some(body), "textarea", &[("disabled", "")], "");
        let editor = b.push(Some(body), "div", &[("contenteditable", "true")], "");
        let button = b.push(Some(body), "button", &[], "Go");
        let snap = b.build();

        assert!(snap.node(input).is_editable());
        assert!(!snap.node(checkbox).is_editable());
        assert!(!snap.node(disabled).is_editable());
        assert!(snap.node(editor).is_editable());
        assert!(!snap.node(button).is_editable());
    }
}

//! CSS-like structural patterns
//!
//! Supports the subset of selector syntax that workflow scripts lean on:
//! type/universal selectors, `#id`, `.class`, attribute tests
//! (`[a]`, `=`, `~=`, `*=`, `^=`, `$=`), `:has-text("...")`, `:visible`,
//! descendant and child combinators, and comma-separated alternatives.

use crate::dom::{normalize_whitespace, PageSnapshot};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SelectorList {
    source: String,
    alternatives: Vec<Complex>,
}

#[derive(Debug, Clone, PartialEq)]
struct Complex {
    /// `(combinator to the previous part, compound)`; the first combinator is unused
    parts: Vec<(Combinator, Compound)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Compound {
    tag: Option<String>,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    Id(String),
    Class(String),
    Attr {
        name: String,
        op: AttrOp,
        value: String,
    },
    HasText(String),
    Visible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AttrOp {
    Exists,
    Equals,
    Includes,
    Contains,
    Prefix,
    Suffix,
}

impl SelectorList {
    pub fn parse(input: &str) -> EngineResult<Self> {
        let mut parser = Parser {
            source: input,
            chars: input.chars().collect(),
            pos: 0,
        };
        let alternatives = parser.parse_list()?;
        Ok(Self {
            source: input.trim().to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, snapshot: &PageSnapshot, index: usize) -> bool {
        self.alternatives.iter().any(|c| c.matches(snapshot, index))
    }

    /// Matching node indices in document order.
    pub fn select(&self, snapshot: &PageSnapshot) -> Vec<usize> {
        (0..snapshot.nodes.len())
            .filter(|&i| self.matches(snapshot, i))
            .collect()
    }
}

impl Complex {
    fn matches(&self, snapshot: &PageSnapshot, index: usize) -> bool {
        self.matches_at(snapshot, index, self.parts.len() - 1)
    }

    fn matches_at(&self, snapshot: &PageSnapshot, index: usize, part: usize) -> bool {
        let (combinator, compound) = &self.parts[part];
        if !compound.matches(snapshot, index) {
            return false;
        }
        if part == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => snapshot
                .node(index)
                .parent
                .is_some_and(|p| self.matches_at(snapshot, p, part - 1)),
            Combinator::Descendant => snapshot
                .ancestors(index)
                .any(|a| self.matches_at(snapshot, a, part - 1)),
        }
    }
}

impl Compound {
    fn matches(&self, snapshot: &PageSnapshot, index: usize) -> bool {
        let node = snapshot.node(index);
        if let Some(tag) = &self.tag {
            if !tag.eq_ignore_ascii_case(&node.tag) {
                return false;
            }
        }
        self.filters.iter().all(|filter| match filter {
            Filter::Id(id) => node.attr("id") == Some(id.as_str()),
            Filter::Class(class) => node.classes().any(|c| c == class),
            Filter::Attr { name, op, value } => {
                let Some(actual) = node.attr(name) else {
                    return false;
                };
                match op {
                    AttrOp::Exists => true,
                    AttrOp::Equals => actual == value,
                    AttrOp::Includes => actual.split_whitespace().any(|w| w == value),
                    AttrOp::Contains => !value.is_empty() && actual.contains(value.as_str()),
                    AttrOp::Prefix => !value.is_empty() && actual.starts_with(value.as_str()),
                    AttrOp::Suffix => !value.is_empty() && actual.ends_with(value.as_str()),
                }
            }
            Filter::HasText(needle) => snapshot
                .text_content(index)
                .to_lowercase()
                .contains(needle.as_str()),
            Filter::Visible => snapshot.is_visible(index),
        })
    }

    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.filters.is_empty()
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidLocator {
            input: self.source.to_string(),
            reason: format!("{} at offset {}", reason.into(), self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn expect(&mut self, c: char) -> EngineResult<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}'")))
        }
    }

    fn parse_list(&mut self) -> EngineResult<Vec<Complex>> {
        let mut list = Vec::new();
        loop {
            self.skip_ws();
            list.push(self.parse_complex()?);
            self.skip_ws();
            if self.eof() {
                return Ok(list);
            }
            self.expect(',')?;
        }
    }

    fn parse_complex(&mut self) -> EngineResult<Complex> {
        let mut parts = vec![(Combinator::Descendant, self.parse_compound()?)];
        loop {
            let had_ws = self.skip_ws();
            let combinator = match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    Combinator::Child
                }
                Some(_) if had_ws => Combinator::Descendant,
                Some(c) => return Err(self.error(format!("unexpected '{c}'"))),
            };
            parts.push((combinator, self.parse_compound()?));
        }
        Ok(Complex { parts })
    }

    fn parse_compound(&mut self) -> EngineResult<Compound> {
        let mut compound = Compound::default();
        match self.peek() {
            Some('*') => {
                self.pos += 1;
            }
            Some(c) if is_ident_char(c) => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.filters.push(Filter::Id(self.ident()?));
                }
                Some('.') => {
                    self.pos += 1;
                    compound.filters.push(Filter::Class(self.ident()?));
                }
                Some('[') => compound.filters.push(self.attribute()?),
                Some(':') => compound.filters.push(self.pseudo()?),
                _ => break,
            }
        }
        if compound.is_empty() && self.chars.get(self.pos.wrapping_sub(1)) != Some(&'*') {
            return Err(self.error("expected a selector"));
        }
        Ok(compound)
    }

    fn ident(&mut self) -> EngineResult<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected an identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn string(&mut self) -> EngineResult<String> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    self.pos += 1;
                    if let Some(c) = self.peek() {
                        out.push(c);
                        self.pos += 1;
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn attribute(&mut self) -> EngineResult<Filter> {
        self.expect('[')?;
        self.skip_ws();
        let name = self.ident()?;
        self.skip_ws();
        let op = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some(']'), _) => AttrOp::Exists,
            (Some('='), _) => AttrOp::Equals,
            (Some('~'), Some('=')) => AttrOp::Includes,
            (Some('*'), Some('=')) => AttrOp::Contains,
            (Some('^'), Some('=')) => AttrOp::Prefix,
            (Some('$'), Some('=')) => AttrOp::Suffix,
            _ => return Err(self.error("expected an attribute operator")),
        };
        let mut value = String::new();
        if op != AttrOp::Exists {
            self.pos += if op == AttrOp::Equals { 1 } else { 2 };
            self.skip_ws();
            value = match self.peek() {
                Some('"' | '\'') => self.string()?,
                _ => self.ident()?,
            };
            self.skip_ws();
        }
        self.expect(']')?;
        Ok(Filter::Attr { name, op, value })
    }

    fn pseudo(&mut self) -> EngineResult<Filter> {
        self.expect(':')?;
        let name = self.ident()?;
        match name.as_str() {
            "visible" => Ok(Filter::Visible),
            "has-text" | "text" => {
                self.expect('(')?;
                self.skip_ws();
                let text = self.string()?;
                self.skip_ws();
                self.expect(')')?;
                Ok(Filter::HasText(normalize_whitespace(&text).to_lowercase()))
            }
            other => Err(self.error(format!("unsupported pseudo-class ':{other}'"))),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

//! Ranked locator generation for indexed nodes.
//!
//! Generation is a pure function of a node's attributes and accessibility
//! info; it never talks to the browser, and identical inputs produce
//! identical selector sets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One way to find an element again after its display index went stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Selector {
    /// Stable test-identifier attribute, the strongest signal when present.
    TestId { selector: String },
    Css { selector: String },
    /// Accessible role plus name.
    Aria { role: String, name: String },
    /// Visible text match.
    Text { text: String },
    XPath { xpath: String },
}

impl Selector {
    /// Short label used when reporting which strategy resolved a target.
    pub fn strategy(&self) -> &'static str {
        match self {
            Selector::TestId { .. } => "test-id",
            Selector::Css { .. } => "css",
            Selector::Aria { .. } => "aria",
            Selector::Text { .. } => "text",
            Selector::XPath { .. } => "xpath",
        }
    }
}

/// Ranked locator strategies for one indexed node. The dispatcher tries
/// them in order and falls back to the next on failure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectorSet {
    pub ranked: Vec<Selector>,
}

impl SelectorSet {
    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn primary(&self) -> Option<&Selector> {
        self.ranked.first()
    }
}

/// Compute the ranked strategies for one node: test identifier, then CSS,
/// then accessibility/text locators, then XPath. A plain tag-name CSS
/// selector is always emitted, so an indexed node never ends up with an
/// empty set.
pub fn build_selector_set(
    tag: &str,
    attrs: &HashMap<String, String>,
    role: Option<&str>,
    ax_name: Option<&str>,
    text: &str,
) -> SelectorSet {
    let mut ranked = Vec::new();

    if let Some(testid) = non_empty(attrs.get("data-testid")) {
        ranked.push(Selector::TestId {
            selector: format!("[data-testid=\"{}\"]", attr_quote(testid)),
        });
    }

    ranked.push(Selector::Css {
        selector: build_css_selector(tag, attrs),
    });

    let name = ax_name
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| non_empty(attrs.get("aria-label")).map(str::to_string));

    if let Some(role) = role.filter(|r| !r.is_empty()) {
        if let Some(name) = name.clone() {
            ranked.push(Selector::Aria {
                role: role.to_string(),
                name,
            });
        }
    }

    let probe = if text.is_empty() {
        name
    } else {
        Some(text.to_string())
    };
    if let Some(text) = probe {
        ranked.push(Selector::Text { text });
    }

    if let Some(xpath) = build_xpath(tag, attrs) {
        ranked.push(Selector::XPath { xpath });
    }

    SelectorSet { ranked }
}

/// CSS selector preference: `#id` when usable, otherwise tag narrowed by
/// name or first class, plus a type predicate.
fn build_css_selector(tag: &str, attrs: &HashMap<String, String>) -> String {
    if let Some(id) = attrs.get("id") {
        if !id.is_empty() && !id.contains(' ') {
            return format!("#{id}");
        }
    }

    let mut parts = vec![tag.to_string()];

    if let Some(name) = non_empty(attrs.get("name")) {
        parts.push(format!("[name=\"{}\"]", attr_quote(name)));
    } else if let Some(class) = attrs.get("class") {
        if let Some(first_class) = class.split_whitespace().next() {
            parts.push(format!(".{first_class}"));
        }
    }

    if let Some(type_attr) = non_empty(attrs.get("type")) {
        parts.push(format!("[type=\"{}\"]", attr_quote(type_attr)));
    }

    parts.join("")
}

/// XPath keyed on identifying attributes only; positional paths rot too
/// fast to be worth emitting.
fn build_xpath(tag: &str, attrs: &HashMap<String, String>) -> Option<String> {
    let mut predicates = Vec::new();
    for key in ["id", "name", "data-testid"] {
        if let Some(value) = non_empty(attrs.get(key)) {
            predicates.push(format!("@{key}='{value}'"));
        }
    }
    if predicates.is_empty() {
        return None;
    }
    Some(format!("//{tag}[{}]", predicates.join(" and ")))
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

fn attr_quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

//! Index assignment and rendering of the unified tree.

use crate::model::{
    BrowserStateSnapshot, ElementNode, IndexedNode, ScrollPosition, ViewportSize,
};
use crate::selectors::build_selector_set;

/// Attributes worth showing to the decision engine.
const RENDERED_ATTRIBUTES: &[&str] = &[
    "id",
    "class",
    "type",
    "name",
    "value",
    "placeholder",
    "href",
    "title",
    "aria-label",
];

pub(crate) struct SerializeSettings {
    pub max_elements: u32,
    pub max_text_length: u32,
}

/// Walk the tree depth-first, hand out indices to interactive visible
/// nodes in traversal order, and build the flattened view the decision
/// engine and dispatcher consume.
pub(crate) fn assemble(
    mut tree: Vec<ElementNode>,
    url: String,
    previous_url: Option<String>,
    scroll: ScrollPosition,
    viewport: ViewportSize,
    settings: &SerializeSettings,
) -> BrowserStateSnapshot {
    let mut indexed = Vec::new();
    let mut next = 0u32;
    for root in &mut tree {
        assign_indices(root, settings, &mut next, &mut indexed);
    }

    BrowserStateSnapshot {
        url,
        previous_url,
        scroll,
        viewport,
        tree,
        indexed,
        captured_at: chrono::Utc::now(),
    }
}

fn assign_indices(
    node: &mut ElementNode,
    settings: &SerializeSettings,
    next: &mut u32,
    indexed: &mut Vec<IndexedNode>,
) {
    if node.interactive && node.visible && *next < settings.max_elements {
        if let Some(bbox) = node.bbox {
            let index = *next;
            *next += 1;
            node.index = Some(index);
            indexed.push(IndexedNode {
                index,
                id: node.id,
                tag: node.tag.clone(),
                line: build_line(node, settings.max_text_length),
                selectors: build_selector_set(
                    &node.tag,
                    &node.attributes,
                    node.role.as_deref(),
                    node.ax_name.as_deref(),
                    &node.text,
                ),
                bbox,
                depth: node.depth,
            });
        }
    }
    for child in &mut node.children {
        assign_indices(child, settings, next, indexed);
    }
}

/// `<tag attr="..">text</tag>` with the identifying attributes, the
/// accessibility role when the markup carries none, and the accessible
/// name as text fallback.
fn build_line(node: &ElementNode, max_text_length: u32) -> String {
    let mut parts = vec![format!("<{}", node.tag)];

    for attr in RENDERED_ATTRIBUTES {
        if let Some(value) = node.attributes.get(*attr) {
            let truncated = truncate_text(value, max_text_length);
            if !truncated.is_empty() {
                parts.push(format!(" {}=\"{}\"", attr, escape_html(&truncated)));
            }
        }
    }
    if let Some(role) = &node.role {
        if !node.attributes.contains_key("role") {
            parts.push(format!(" role=\"{role}\""));
        }
    }
    parts.push(">".to_string());

    let content = if !node.text.is_empty() {
        node.text.clone()
    } else if let Some(name) = &node.ax_name {
        truncate_text(name, max_text_length)
    } else {
        String::new()
    };
    if !content.is_empty() {
        parts.push(escape_html(&content));
    }

    parts.push(format!("</{}>", node.tag));
    parts.join("")
}

/// Character-based truncation, safe for multi-byte text.
pub(crate) fn truncate_text(text: &str, max_chars: u32) -> String {
    let trimmed = text.trim();
    let max_chars = max_chars as usize;
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let truncated: String = trimmed.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

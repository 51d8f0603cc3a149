use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use helmsman_core_types::BackendNodeId;

use crate::selectors::SelectorSet;

/// Axis-aligned box in CSS pixels, viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    /// Center point, where pointer actions land.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Document scroll offset in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

/// One node in the unified tree. Parents own their children, so the tree
/// is acyclic by construction.
#[derive(Debug, Clone, Serialize)]
pub struct ElementNode {
    /// Stable protocol identifier, the join key across the structural and
    /// accessibility sources within one pass.
    pub id: BackendNodeId,
    /// Display index handed to the decision engine. Assigned only to
    /// interactive, visible nodes; never reused within a pass and not
    /// stable across passes.
    pub index: Option<u32>,
    /// Lowercased tag name.
    pub tag: String,
    /// Role from the accessibility source. `None` when the node is absent
    /// from the accessibility tree.
    pub role: Option<String>,
    /// Accessible name from the accessibility source.
    pub ax_name: Option<String>,
    /// Visible text gathered from direct text children, truncated.
    pub text: String,
    pub attributes: HashMap<String, String>,
    /// Geometry in viewport coordinates. `None` when the node has no
    /// layout entry.
    pub bbox: Option<BBox>,
    pub visible: bool,
    pub interactive: bool,
    pub children: Vec<ElementNode>,
    /// Depth in the raw document tree, kept for indented rendering.
    pub depth: u32,
}

/// Flattened view of one indexed node, in traversal order.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedNode {
    pub index: u32,
    pub id: BackendNodeId,
    pub tag: String,
    /// Rendered `<tag ..>text</tag>` line shown to the decision engine.
    pub line: String,
    /// Ranked locator strategies for the dispatcher.
    pub selectors: SelectorSet,
    pub bbox: BBox,
    pub depth: u32,
}

/// Immutable result of one extraction pass. Created once per step,
/// consumed by the decision engine and the dispatcher for that step, then
/// superseded.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserStateSnapshot {
    pub url: String,
    /// URL of the previous successful pass, if any.
    pub previous_url: Option<String>,
    pub scroll: ScrollPosition,
    pub viewport: ViewportSize,
    /// Retained element tree, document roots first. Unindexed nodes stay
    /// in here for structural context.
    pub tree: Vec<ElementNode>,
    /// Interactive, visible nodes ordered by index.
    pub indexed: Vec<IndexedNode>,
    pub captured_at: DateTime<Utc>,
}

impl BrowserStateSnapshot {
    /// Look up an indexed node. `None` marks a stale or invented index.
    pub fn node(&self, index: u32) -> Option<&IndexedNode> {
        self.indexed.iter().find(|n| n.index == index)
    }

    pub fn max_index(&self) -> Option<u32> {
        self.indexed.last().map(|n| n.index)
    }

    pub fn element_count(&self) -> usize {
        self.indexed.len()
    }

    /// Human-readable form handed to the decision engine: URL and
    /// viewport header plus one `[index]` line per interactive element.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Current URL: {}\n", self.url));
        if let Some(prev) = &self.previous_url {
            out.push_str(&format!("Previous URL: {prev}\n"));
        }
        out.push_str(&format!(
            "Viewport: {:.0}x{:.0}, scrolled to ({:.0}, {:.0})\n",
            self.viewport.width, self.viewport.height, self.scroll.x, self.scroll.y
        ));

        if self.indexed.is_empty() {
            out.push_str("No interactive elements visible.\n");
            return out;
        }

        out.push_str("Interactive elements:\n");
        let min_depth = self.indexed.iter().map(|n| n.depth).min().unwrap_or(0);
        for node in &self.indexed {
            let indent = "  ".repeat(node.depth.saturating_sub(min_depth) as usize);
            out.push_str(&format!("{indent}[{}]{}\n", node.index, node.line));
        }
        out
    }
}

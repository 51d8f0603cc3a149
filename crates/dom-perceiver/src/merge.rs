//! Join of the three protocol payloads: structural snapshot nodes keyed by
//! backend id, accessibility roles/names, and layout geometry, folded into
//! one retained element tree.

use std::collections::HashMap;

use serde_json::Value;

use helmsman_core_types::BackendNodeId;

use crate::error::PerceiveError;
use crate::model::{BBox, ElementNode, ScrollPosition, ViewportSize};
use crate::serialize::truncate_text;

const ELEMENT_NODE: i64 = 1;
const TEXT_NODE: i64 = 3;

/// Element tags that are interactive on their own.
const INTERACTIVE_TAGS: &[&str] = &[
    "a", "button", "input", "select", "textarea", "option", "label", "summary", "details",
];

/// Tags that become interactive only through handler attributes.
const POTENTIALLY_INTERACTIVE_TAGS: &[&str] =
    &["div", "span", "li", "tr", "td", "th", "img", "svg", "path"];

/// Attributes that mark an element as handling input. `tabindex="-1"` is
/// focusable-by-script only and does not count.
const INTERACTIVE_ATTRIBUTES: &[&str] = &[
    "onclick",
    "onmousedown",
    "onmouseup",
    "ontouchstart",
    "tabindex",
    "contenteditable",
    "draggable",
];

/// ARIA roles that mark an element as interactive.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "checkbox",
    "radio",
    "textbox",
    "combobox",
    "listbox",
    "option",
    "menuitem",
    "tab",
    "switch",
    "slider",
    "spinbutton",
    "searchbox",
    "gridcell",
    "treeitem",
];

/// Tags dropped from the retained tree, uppercase as the snapshot reports
/// them.
const SKIPPED_TAGS: &[&str] = &["SCRIPT", "STYLE", "META", "LINK", "HEAD"];

/// Computed styles requested at capture time, decoded positionally from
/// each layout entry.
const CAPTURED_STYLES: &[&str] = &["visibility", "display", "opacity"];

pub(crate) struct MergeSettings {
    pub max_text_length: u32,
    pub max_depth: u32,
    pub viewport_slack: f64,
}

struct AxInfo {
    role: String,
    name: String,
}

struct LayoutEntry {
    bbox: Option<BBox>,
    hidden: bool,
}

/// Decode the snapshot documents and join them against the accessibility
/// tree. Returns the retained tree, roots first.
pub(crate) fn unify(
    dom_raw: &Value,
    ax_raw: &Value,
    viewport: ViewportSize,
    scroll: ScrollPosition,
    settings: &MergeSettings,
) -> Result<Vec<ElementNode>, PerceiveError> {
    let documents = dom_raw
        .get("documents")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            PerceiveError::malformed("DOMSnapshot.captureSnapshot missing 'documents' array")
        })?;
    let strings = decode_strings(dom_raw)?;

    let ax_nodes = ax_raw.get("nodes").and_then(Value::as_array).ok_or_else(|| {
        PerceiveError::malformed("Accessibility.getFullAXTree missing 'nodes' array")
    })?;
    let ax_index = build_ax_index(ax_nodes);

    let mut roots = Vec::new();
    for doc in documents {
        merge_document(doc, &strings, &ax_index, viewport, scroll, settings, &mut roots)?;
    }
    Ok(roots)
}

fn decode_strings(dom_raw: &Value) -> Result<Vec<String>, PerceiveError> {
    dom_raw
        .get("strings")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            PerceiveError::malformed("DOMSnapshot.captureSnapshot missing 'strings' array")
        })?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| PerceiveError::malformed("non-string entry in snapshot string table"))
        })
        .collect()
}

/// Index accessibility nodes by backend id. Nodes without a role carry no
/// usable semantics and are left out, which keeps them excluded from
/// role-based interactivity.
fn build_ax_index(ax_nodes: &[Value]) -> HashMap<u64, AxInfo> {
    let mut index = HashMap::new();
    for node in ax_nodes {
        let Some(backend_id) = node.get("backendDOMNodeId").and_then(Value::as_u64) else {
            continue;
        };
        let role = node
            .get("role")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if role.is_empty() {
            continue;
        }
        let name = node
            .get("name")
            .and_then(|n| n.get("value"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        index.insert(backend_id, AxInfo { role, name });
    }
    index
}

fn merge_document(
    doc: &Value,
    strings: &[String],
    ax_index: &HashMap<u64, AxInfo>,
    viewport: ViewportSize,
    scroll: ScrollPosition,
    settings: &MergeSettings,
    roots: &mut Vec<ElementNode>,
) -> Result<(), PerceiveError> {
    let nodes = doc
        .get("nodes")
        .ok_or_else(|| PerceiveError::malformed("snapshot document missing 'nodes'"))?;

    let names = nodes.get("nodeName").and_then(Value::as_array);
    let values = nodes.get("nodeValue").and_then(Value::as_array);
    let backend_ids = nodes.get("backendNodeId").and_then(Value::as_array);
    let attributes = nodes.get("attributes").and_then(Value::as_array);
    let types = int_array(nodes.get("nodeType"));
    let parents = int_array(nodes.get("parentIndex"));
    let count = types.len();

    // Parents precede children in the snapshot, so one forward pass
    // resolves every depth.
    let mut depths = vec![0u32; count];
    for i in 0..count {
        let p = parents.get(i).copied().unwrap_or(-1);
        if p >= 0 && (p as usize) < i {
            depths[i] = depths[p as usize] + 1;
        }
    }

    let geometry = decode_layout(doc, strings);

    // First pass: decode the retained element nodes into per-raw-index
    // slots.
    let mut slots: Vec<Option<ElementNode>> = (0..count).map(|_| None).collect();
    for i in 0..count {
        if types[i] != ELEMENT_NODE || depths[i] > settings.max_depth {
            continue;
        }
        let Some(tag_raw) = names
            .and_then(|arr| arr.get(i))
            .and_then(|v| indexed_string(v, strings))
        else {
            continue;
        };
        if SKIPPED_TAGS.contains(&tag_raw) {
            continue;
        }
        let backend_id = backend_ids
            .and_then(|arr| arr.get(i))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if backend_id == 0 {
            continue;
        }

        let tag = tag_raw.to_lowercase();
        let attrs = extract_attributes(attributes, i, strings);
        let ax = ax_index.get(&backend_id);
        let role = ax.map(|info| info.role.clone());
        let ax_name = ax.and_then(|info| {
            if info.name.is_empty() {
                None
            } else {
                Some(info.name.clone())
            }
        });

        let layout = geometry.get(&i);
        // Snapshot bounds are document-absolute; shift into viewport
        // coordinates.
        let bbox = layout.and_then(|entry| entry.bbox).map(|b| BBox {
            x: b.x - scroll.x,
            y: b.y - scroll.y,
            ..b
        });
        let hidden = layout.map(|entry| entry.hidden).unwrap_or(false);
        let visible = bbox
            .map(|b| b.has_area() && !hidden && near_viewport(&b, viewport, settings.viewport_slack))
            .unwrap_or(false);
        let interactive = classify_interactive(&tag, &attrs, role.as_deref());

        slots[i] = Some(ElementNode {
            id: BackendNodeId::from(backend_id),
            index: None,
            tag,
            role,
            ax_name,
            text: String::new(),
            attributes: attrs,
            bbox,
            visible,
            interactive,
            children: Vec::new(),
            depth: depths[i],
        });
    }

    // Second pass: text nodes contribute to their direct parent only, so
    // script and style bodies never leak into a retained ancestor.
    for i in 0..count {
        if types[i] != TEXT_NODE {
            continue;
        }
        let p = parents.get(i).copied().unwrap_or(-1);
        if p < 0 || (p as usize) >= i {
            continue;
        }
        let Some(parent) = slots[p as usize].as_mut() else {
            continue;
        };
        let Some(text) = values
            .and_then(|arr| arr.get(i))
            .and_then(|v| indexed_string(v, strings))
        else {
            continue;
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !parent.text.is_empty() {
            parent.text.push(' ');
        }
        parent.text.push_str(trimmed);
    }
    for slot in slots.iter_mut().flatten() {
        slot.text = truncate_text(&slot.text, settings.max_text_length);
    }

    // Third pass: re-parent each retained node to its nearest retained
    // ancestor, skipping over dropped wrappers.
    let mut nearest: Vec<Option<usize>> = vec![None; count];
    for i in 0..count {
        let p = parents.get(i).copied().unwrap_or(-1);
        if p >= 0 && (p as usize) < i {
            let p = p as usize;
            nearest[i] = if slots[p].is_some() { Some(p) } else { nearest[p] };
        }
    }

    let mut children_of: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut root_indices = Vec::new();
    for i in 0..count {
        if slots[i].is_none() {
            continue;
        }
        match nearest[i] {
            Some(p) => children_of.entry(p).or_default().push(i),
            None => root_indices.push(i),
        }
    }

    for root in root_indices {
        if let Some(node) = attach(root, &mut slots, &children_of) {
            roots.push(node);
        }
    }
    Ok(())
}

fn attach(
    index: usize,
    slots: &mut [Option<ElementNode>],
    children_of: &HashMap<usize, Vec<usize>>,
) -> Option<ElementNode> {
    let mut node = slots[index].take()?;
    if let Some(kids) = children_of.get(&index) {
        for &kid in kids {
            if let Some(child) = attach(kid, slots, children_of) {
                node.children.push(child);
            }
        }
    }
    Some(node)
}

/// Role, tag and handler-attribute classification. Visibility is judged
/// separately; indexing requires both.
pub(crate) fn classify_interactive(
    tag: &str,
    attrs: &HashMap<String, String>,
    role: Option<&str>,
) -> bool {
    if INTERACTIVE_TAGS.contains(&tag) {
        return true;
    }

    if let Some(role) = role {
        if INTERACTIVE_ROLES.contains(&role.to_lowercase().as_str()) {
            return true;
        }
    }

    for attr in INTERACTIVE_ATTRIBUTES {
        if let Some(value) = attrs.get(*attr) {
            if *attr == "tabindex" && value == "-1" {
                continue;
            }
            return true;
        }
    }

    // A role attribute counts only when it names an interactive role;
    // role="presentation" and friends stay inert.
    if let Some(role) = attrs.get("role") {
        if INTERACTIVE_ROLES.contains(&role.to_lowercase().as_str()) {
            return true;
        }
    }

    if POTENTIALLY_INTERACTIVE_TAGS.contains(&tag) {
        if attrs.contains_key("onclick")
            || attrs.contains_key("data-action")
            || attrs
                .get("class")
                .map(|c| c.contains("btn"))
                .unwrap_or(false)
        {
            return true;
        }
    }

    false
}

/// Decode the layout section: node indices paired with bounds rects and
/// the captured computed styles.
fn decode_layout(doc: &Value, strings: &[String]) -> HashMap<usize, LayoutEntry> {
    let mut map = HashMap::new();
    let Some(layout) = doc.get("layout") else {
        return map;
    };
    let indices = int_array(layout.get("nodeIndex"));
    let bounds = layout.get("bounds").and_then(Value::as_array);
    let styles = layout.get("styles").and_then(Value::as_array);

    for (pos, &raw_index) in indices.iter().enumerate() {
        if raw_index < 0 {
            continue;
        }
        let bbox = bounds
            .and_then(|b| b.get(pos))
            .and_then(Value::as_array)
            .and_then(|rect| decode_rect(rect));
        let hidden = styles
            .and_then(|s| s.get(pos))
            .and_then(Value::as_array)
            .map(|props| style_hides(props, strings))
            .unwrap_or(false);
        map.insert(raw_index as usize, LayoutEntry { bbox, hidden });
    }
    map
}

/// Each bounds entry is an `[x, y, width, height]` rect.
fn decode_rect(values: &[Value]) -> Option<BBox> {
    if values.len() < 4 {
        return None;
    }
    Some(BBox {
        x: values[0].as_f64()?,
        y: values[1].as_f64()?,
        width: values[2].as_f64()?,
        height: values[3].as_f64()?,
    })
}

fn style_hides(props: &[Value], strings: &[String]) -> bool {
    let mut visibility = None;
    let mut display = None;
    let mut opacity = None;
    for (slot, value) in props.iter().enumerate() {
        let resolved = indexed_string(value, strings);
        match CAPTURED_STYLES.get(slot) {
            Some(&"visibility") => visibility = resolved,
            Some(&"display") => display = resolved,
            Some(&"opacity") => opacity = resolved,
            _ => {}
        }
    }
    matches!(display, Some("none"))
        || matches!(visibility, Some("hidden") | Some("collapse"))
        || matches!(opacity, Some("0"))
}

/// Within or near the viewport. The slack admits elements roughly one
/// scroll away as scroll-to-reach candidates.
fn near_viewport(bbox: &BBox, viewport: ViewportSize, slack: f64) -> bool {
    bbox.y < viewport.height + slack
        && bbox.y + bbox.height > -slack
        && bbox.x < viewport.width + slack
        && bbox.x + bbox.width > -slack
}

fn extract_attributes(
    attributes: Option<&Vec<Value>>,
    node_index: usize,
    strings: &[String],
) -> HashMap<String, String> {
    let mut result = HashMap::new();
    if let Some(node_attrs) = attributes
        .and_then(|arr| arr.get(node_index))
        .and_then(Value::as_array)
    {
        for chunk in node_attrs.chunks(2) {
            if chunk.len() == 2 {
                if let (Some(key), Some(value)) = (
                    indexed_string(&chunk[0], strings),
                    indexed_string(&chunk[1], strings),
                ) {
                    result.insert(key.to_string(), value.to_string());
                }
            }
        }
    }
    result
}

/// Snapshot fields are usually string-table indices, but some builds emit
/// inline strings; tolerate both.
fn indexed_string<'a>(value: &'a Value, strings: &'a [String]) -> Option<&'a str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Number(n) => {
            let idx = n.as_i64()?;
            if idx < 0 {
                return None;
            }
            strings.get(idx as usize).map(String::as_str)
        }
        _ => None,
    }
}

fn int_array(value: Option<&Value>) -> Vec<i64> {
    value
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(|v| v.as_i64().unwrap_or(-1)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> MergeSettings {
        MergeSettings {
            max_text_length: 100,
            max_depth: 50,
            viewport_slack: 800.0,
        }
    }

    fn viewport() -> ViewportSize {
        ViewportSize {
            width: 1280.0,
            height: 800.0,
        }
    }

    /// html > body > (button "Buy now", script "var x=1")
    fn snapshot_payload() -> Value {
        json!({
            "documents": [{
                "nodes": {
                    "nodeName": [0, 1, 2, 3, 4, 5, 4],
                    "nodeType": [9, 1, 1, 1, 3, 1, 3],
                    "nodeValue": [-1, -1, -1, -1, 6, -1, 7],
                    "parentIndex": [-1, 0, 1, 2, 3, 2, 5],
                    "backendNodeId": [100, 101, 102, 103, 104, 105, 106],
                    "attributes": [[], [], [], [8, 9, 10, 11], [], [], []]
                },
                "layout": {
                    "nodeIndex": [1, 2, 3],
                    "bounds": [
                        [0.0, 0.0, 1280.0, 2000.0],
                        [0.0, 0.0, 1280.0, 2000.0],
                        [40.0, 80.0, 200.0, 32.0]
                    ],
                    "styles": [[12, 13, 14], [12, 13, 14], [12, 13, 14]]
                }
            }],
            "strings": [
                "#document", "HTML", "BODY", "BUTTON", "#text", "SCRIPT",
                "Buy now", "var x=1;",
                "id", "buy-button", "class", "cta",
                "visible", "block", "1"
            ]
        })
    }

    fn ax_payload() -> Value {
        json!({
            "nodes": [
                {
                    "backendDOMNodeId": 103,
                    "role": { "value": "button" },
                    "name": { "value": "Buy now" }
                },
                {
                    "backendDOMNodeId": 102,
                    "role": { "value": "" },
                    "name": { "value": "ignored" }
                }
            ]
        })
    }

    #[test]
    fn builds_the_retained_tree() {
        let roots = unify(
            &snapshot_payload(),
            &ax_payload(),
            viewport(),
            ScrollPosition::default(),
            &settings(),
        )
        .expect("unify");

        assert_eq!(roots.len(), 1);
        let html = &roots[0];
        assert_eq!(html.tag, "html");
        assert_eq!(html.children.len(), 1);
        let body = &html.children[0];
        assert_eq!(body.tag, "body");
        // The script element and its text are dropped entirely.
        assert_eq!(body.children.len(), 1);
        let button = &body.children[0];
        assert_eq!(button.tag, "button");
        assert_eq!(button.text, "Buy now");
        assert_eq!(button.attributes.get("id").map(String::as_str), Some("buy-button"));
        assert_eq!(button.role.as_deref(), Some("button"));
        assert!(button.interactive);
        assert!(button.visible);
        assert_eq!(u64::from(button.id), 103);
    }

    #[test]
    fn empty_role_is_left_out_of_the_ax_join() {
        let roots = unify(
            &snapshot_payload(),
            &ax_payload(),
            viewport(),
            ScrollPosition::default(),
            &settings(),
        )
        .expect("unify");
        let body = &roots[0].children[0];
        assert_eq!(body.role, None);
        assert!(!body.interactive);
    }

    #[test]
    fn bounds_shift_into_viewport_coordinates() {
        let roots = unify(
            &snapshot_payload(),
            &ax_payload(),
            viewport(),
            ScrollPosition { x: 0.0, y: 50.0 },
            &settings(),
        )
        .expect("unify");
        let button = &roots[0].children[0].children[0];
        let bbox = button.bbox.expect("bbox");
        assert_eq!(bbox.y, 30.0);
        assert_eq!(bbox.x, 40.0);
    }

    #[test]
    fn far_offscreen_nodes_are_invisible() {
        let mut payload = snapshot_payload();
        payload["documents"][0]["layout"]["bounds"][2] =
            json!([40.0, 5000.0, 200.0, 32.0]);
        let roots = unify(
            &payload,
            &ax_payload(),
            viewport(),
            ScrollPosition::default(),
            &settings(),
        )
        .expect("unify");
        let button = &roots[0].children[0].children[0];
        assert!(!button.visible);
        assert!(button.interactive);
    }

    #[test]
    fn display_none_hides_a_node() {
        let mut payload = snapshot_payload();
        // Swap the button's display style entry to "none".
        payload["documents"][0]["layout"]["styles"][2] = json!([12, 15, 14]);
        payload["strings"]
            .as_array_mut()
            .expect("strings")
            .push(json!("none"));
        let roots = unify(
            &payload,
            &ax_payload(),
            viewport(),
            ScrollPosition::default(),
            &settings(),
        )
        .expect("unify");
        let button = &roots[0].children[0].children[0];
        assert!(!button.visible);
    }

    #[test]
    fn missing_documents_is_malformed() {
        let err = unify(
            &json!({ "strings": [] }),
            &ax_payload(),
            viewport(),
            ScrollPosition::default(),
            &settings(),
        )
        .expect_err("must fail");
        assert!(matches!(err, PerceiveError::Extraction(_)));
    }

    #[test]
    fn missing_ax_nodes_is_malformed() {
        let err = unify(
            &snapshot_payload(),
            &json!({}),
            viewport(),
            ScrollPosition::default(),
            &settings(),
        )
        .expect_err("must fail");
        assert!(matches!(err, PerceiveError::Extraction(_)));
    }

    #[test]
    fn interactivity_classification() {
        let empty = HashMap::new();
        assert!(classify_interactive("button", &empty, None));
        assert!(classify_interactive("input", &empty, None));
        assert!(!classify_interactive("div", &empty, None));
        assert!(classify_interactive("div", &empty, Some("button")));

        let mut attrs = HashMap::new();
        attrs.insert("onclick".to_string(), "go()".to_string());
        assert!(classify_interactive("div", &attrs, None));

        let mut attrs = HashMap::new();
        attrs.insert("tabindex".to_string(), "-1".to_string());
        assert!(!classify_interactive("div", &attrs, None));
        attrs.insert("tabindex".to_string(), "0".to_string());
        assert!(classify_interactive("div", &attrs, None));

        let mut attrs = HashMap::new();
        attrs.insert("role".to_string(), "presentation".to_string());
        assert!(!classify_interactive("div", &attrs, None));
        attrs.insert("role".to_string(), "menuitem".to_string());
        assert!(classify_interactive("div", &attrs, None));
    }
}

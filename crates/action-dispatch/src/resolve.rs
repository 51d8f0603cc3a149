//! Selector-driven target resolution with ranked fallback.
//!
//! Resolution turns one of a node's pre-computed selectors into a live
//! remote-object handle. Strategies are tried in rank order; a miss or a
//! recoverable failure falls through to the next strategy, and only a fatal
//! transport loss aborts the chain.

use serde_json::json;
use tracing::debug;

use cdp_session::{ProtocolClient, SessionError};
use dom_perceiver::{IndexedNode, Selector};

/// A strategy that found the element: the handle plus the strategy name,
/// which the dispatcher records in the result.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedTarget {
    pub object_id: String,
    pub strategy: &'static str,
}

pub(crate) async fn resolve_target(
    client: &dyn ProtocolClient,
    node: &IndexedNode,
) -> Result<Option<ResolvedTarget>, SessionError> {
    for selector in &node.selectors.ranked {
        match resolve_selector(client, selector).await {
            Ok(Some(object_id)) => {
                debug!(
                    target: "dispatch",
                    index = node.index,
                    strategy = selector.strategy(),
                    "target resolved"
                );
                return Ok(Some(ResolvedTarget {
                    object_id,
                    strategy: selector.strategy(),
                }));
            }
            Ok(None) => {
                debug!(
                    target: "dispatch",
                    index = node.index,
                    strategy = selector.strategy(),
                    "strategy missed; falling back"
                );
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(
                    target: "dispatch",
                    index = node.index,
                    strategy = selector.strategy(),
                    %err,
                    "strategy failed; falling back"
                );
            }
        }
    }
    Ok(None)
}

async fn resolve_selector(
    client: &dyn ProtocolClient,
    selector: &Selector,
) -> Result<Option<String>, SessionError> {
    match selector {
        Selector::TestId { selector } | Selector::Css { selector } => {
            let expression = format!("document.querySelector({})", js_string(selector));
            evaluate_to_object(client, &expression).await
        }
        Selector::Aria { role, name } => query_ax_tree(client, role, name).await,
        Selector::Text { text } => evaluate_to_object(client, &text_probe(text)).await,
        Selector::XPath { xpath } => evaluate_to_object(client, &xpath_probe(xpath)).await,
    }
}

/// Evaluate an expression expecting an element, without `returnByValue`, so
/// a hit comes back as a remote-object handle.
async fn evaluate_to_object(
    client: &dyn ProtocolClient,
    expression: &str,
) -> Result<Option<String>, SessionError> {
    let result = client
        .call("Runtime.evaluate", json!({ "expression": expression }))
        .await?;
    // A raising expression (bad selector syntax) is a miss, not an abort.
    if result.get("exceptionDetails").is_some() {
        return Ok(None);
    }
    let payload = &result["result"];
    if payload["subtype"].as_str() == Some("null") {
        return Ok(None);
    }
    Ok(payload["objectId"].as_str().map(str::to_string))
}

/// Accessibility-tree query by role and accessible name, resolved to a
/// remote object via the matched backend id.
async fn query_ax_tree(
    client: &dyn ProtocolClient,
    role: &str,
    name: &str,
) -> Result<Option<String>, SessionError> {
    let found = client
        .call(
            "Accessibility.queryAXTree",
            json!({ "accessibleName": name, "role": role }),
        )
        .await?;
    let backend_id = found["nodes"].as_array().and_then(|nodes| {
        nodes.iter().find_map(|node| {
            if node["ignored"].as_bool().unwrap_or(false) {
                return None;
            }
            node["backendDOMNodeId"].as_u64()
        })
    });
    let Some(backend_id) = backend_id else {
        return Ok(None);
    };
    let resolved = client
        .call("DOM.resolveNode", json!({ "backendNodeId": backend_id }))
        .await?;
    Ok(resolved["object"]["objectId"].as_str().map(str::to_string))
}

/// Deepest element whose trimmed text equals the needle, in document order.
fn text_probe(text: &str) -> String {
    format!(
        r#"(() => {{
    const needle = {};
    let best = null;
    for (const el of document.querySelectorAll('*')) {{
        const text = (el.innerText || el.textContent || '').trim();
        if (text === needle && (!best || best.contains(el))) {{ best = el; }}
    }}
    return best;
}})()"#,
        js_string(text)
    )
}

fn xpath_probe(xpath: &str) -> String {
    format!(
        "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
        js_string(xpath)
    )
}

/// A JSON string literal is also a valid JS string literal.
fn js_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

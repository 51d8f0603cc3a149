//! The extraction pass: three concurrent protocol queries folded into one
//! immutable snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::debug;

use cdp_session::ProtocolClient;

use crate::error::PerceiveError;
use crate::merge::{self, MergeSettings};
use crate::model::{BrowserStateSnapshot, ScrollPosition, ViewportSize};
use crate::serialize::{self, SerializeSettings};

/// Tuning for one extraction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceiverConfig {
    /// Deadline per protocol query.
    pub extraction_timeout_ms: u64,
    /// Ceiling on indexed elements per pass.
    pub max_elements: u32,
    /// Tree depth beyond which nodes are dropped.
    pub max_depth: u32,
    /// Character bound for rendered text.
    pub max_text_length: u32,
    /// Distance past the viewport edge still considered reachable.
    pub viewport_slack_px: f64,
}

impl Default for PerceiverConfig {
    fn default() -> Self {
        Self {
            extraction_timeout_ms: 10_000,
            max_elements: 500,
            max_depth: 50,
            max_text_length: 100,
            viewport_slack_px: 800.0,
        }
    }
}

/// Extraction seam the orchestration loop is written against.
#[async_trait]
pub trait Perceiver: Send {
    async fn extract(&mut self) -> Result<BrowserStateSnapshot, PerceiveError>;
}

/// Unifies the structural snapshot, the accessibility tree and the layout
/// metrics of the active tab into a [`BrowserStateSnapshot`].
pub struct DomPerceiver {
    client: Arc<dyn ProtocolClient>,
    config: PerceiverConfig,
    last_url: Option<String>,
}

impl DomPerceiver {
    pub fn new(client: Arc<dyn ProtocolClient>, config: PerceiverConfig) -> Self {
        Self {
            client,
            config,
            last_url: None,
        }
    }

    async fn query(&self, method: &'static str, params: Value) -> Result<Value, PerceiveError> {
        let bound = Duration::from_millis(self.config.extraction_timeout_ms);
        match timeout(bound, self.client.call(method, params)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PerceiveError::from_query(method, err)),
            Err(_) => Err(PerceiveError::ExtractionTimeout {
                query: method.to_string(),
                timeout_ms: self.config.extraction_timeout_ms,
            }),
        }
    }
}

#[async_trait]
impl Perceiver for DomPerceiver {
    async fn extract(&mut self) -> Result<BrowserStateSnapshot, PerceiveError> {
        let url = self
            .client
            .current_url()
            .await
            .map_err(|err| PerceiveError::from_query("Page.getNavigationHistory", err))?;

        // All three run concurrently over the shared transport; the merge
        // starts only once every query has settled.
        let (dom_res, ax_res, metrics_res) = tokio::join!(
            self.query(
                "DOMSnapshot.captureSnapshot",
                json!({
                    "computedStyles": ["visibility", "display", "opacity"],
                    "includeDOMRects": true,
                    "includePaintOrder": true,
                }),
            ),
            self.query("Accessibility.getFullAXTree", json!({})),
            self.query("Page.getLayoutMetrics", json!({})),
        );
        let (dom_raw, ax_raw, metrics_raw) = match (dom_res, ax_res, metrics_res) {
            (Ok(dom), Ok(ax), Ok(metrics)) => (dom, ax, metrics),
            (dom, ax, metrics) => {
                return Err(worst_of([dom.err(), ax.err(), metrics.err()]));
            }
        };

        let (viewport, scroll) = decode_layout_metrics(&metrics_raw)?;
        let tree = merge::unify(
            &dom_raw,
            &ax_raw,
            viewport,
            scroll,
            &MergeSettings {
                max_text_length: self.config.max_text_length,
                max_depth: self.config.max_depth,
                viewport_slack: self.config.viewport_slack_px,
            },
        )?;

        let snapshot = serialize::assemble(
            tree,
            url,
            self.last_url.clone(),
            scroll,
            viewport,
            &SerializeSettings {
                max_elements: self.config.max_elements,
                max_text_length: self.config.max_text_length,
            },
        );

        debug!(
            target: "perceiver",
            url = %snapshot.url,
            indexed = snapshot.indexed.len(),
            "extraction pass complete"
        );

        self.last_url = Some(snapshot.url.clone());
        Ok(snapshot)
    }
}

/// Transport loss outranks a timeout, which outranks a decode failure.
fn worst_of(errors: [Option<PerceiveError>; 3]) -> PerceiveError {
    let mut timeout = None;
    let mut fallback = None;
    for err in errors.into_iter().flatten() {
        match &err {
            PerceiveError::Transport(_) => return err,
            PerceiveError::ExtractionTimeout { .. } => {
                if timeout.is_none() {
                    timeout = Some(err);
                }
            }
            _ => {
                if fallback.is_none() {
                    fallback = Some(err);
                }
            }
        }
    }
    timeout
        .or(fallback)
        .unwrap_or_else(|| PerceiveError::malformed("extraction failed without a recorded error"))
}

fn decode_layout_metrics(
    metrics: &Value,
) -> Result<(ViewportSize, ScrollPosition), PerceiveError> {
    let viewport = metrics
        .get("cssLayoutViewport")
        .or_else(|| metrics.get("layoutViewport"))
        .ok_or_else(|| {
            PerceiveError::malformed("Page.getLayoutMetrics missing layout viewport")
        })?;
    let width = viewport
        .get("clientWidth")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let height = viewport
        .get("clientHeight")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let x = viewport.get("pageX").and_then(Value::as_f64).unwrap_or(0.0);
    let y = viewport.get("pageY").and_then(Value::as_f64).unwrap_or(0.0);
    Ok((ViewportSize { width, height }, ScrollPosition { x, y }))
}

//! Intent execution over the protocol session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use cdp_session::{ProtocolClient, SessionError};
use dom_perceiver::{BrowserStateSnapshot, IndexedNode, ViewportSize};

use crate::input::{parse_key, KeyCombo};
use crate::intent::{preview, ActionIntent, ScrollDirection};
use crate::resolve::{resolve_target, ResolvedTarget};
use crate::result::ActionResult;

/// Tuning for execution mechanics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries after the first attempt, for transient element failures.
    pub action_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_base_delay_ms: u64,
    /// Pixels one `scroll` intent moves the page.
    pub scroll_amount_px: i64,
    /// Upper bound on an engine-requested wait.
    pub max_wait_secs: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            action_retries: 2,
            retry_base_delay_ms: 500,
            scroll_amount_px: 500,
            max_wait_secs: 30.0,
        }
    }
}

/// Capability seam the orchestration loop executes intents through.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Execute one intent against the snapshot that produced it.
    ///
    /// Per-action failures come back inside the [`ActionResult`]; the only
    /// `Err` is a fatal transport loss.
    async fn execute(
        &self,
        intent: &ActionIntent,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError>;
}

/// Live dispatcher over a protocol session. Stateless between calls: every
/// execution is parameterized by the snapshot it validates against, and the
/// snapshot itself is never mutated.
pub struct ActionDispatcher {
    client: Arc<dyn ProtocolClient>,
    config: DispatchConfig,
}

/// What to do to a resolved element.
enum Gesture<'a> {
    Click,
    Type { text: &'a str },
    Hover,
    Focus,
    Select { value: &'a str },
}

impl Gesture<'_> {
    fn label(&self) -> &'static str {
        match self {
            Gesture::Click => "click",
            Gesture::Type { .. } => "type into",
            Gesture::Hover => "hover",
            Gesture::Focus => "focus",
            Gesture::Select { .. } => "select in",
        }
    }
}

const FOCUS_JS: &str = "function() { this.focus(); }";
const CLICK_JS: &str = "function() { this.click(); }";
const SCROLL_JS: &str = "function() { this.scrollIntoView({behavior: 'instant', block: 'center', inline: 'center'}); }";
const RECT_JS: &str = r#"function() {
    const rect = this.getBoundingClientRect();
    return { x: rect.left, y: rect.top, width: rect.width, height: rect.height };
}"#;
const CLEAR_JS: &str = r#"function() {
    if (this.isContentEditable) {
        this.textContent = '';
    } else if (this.value !== undefined) {
        this.value = '';
    }
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;
const SELECT_JS: &str = r#"function(wanted) {
    if (this.tagName !== 'SELECT') { throw new Error('not a select element'); }
    for (const option of this.options) {
        if (option.value === wanted || option.text === wanted) {
            option.selected = true;
            this.dispatchEvent(new Event('change', { bubbles: true }));
            return option.text;
        }
    }
    throw new Error('no option matching ' + wanted);
}"#;

/// Failure messages worth retrying: the page may simply not be done moving.
fn transient_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["not visible", "failed to resolve", "no geometry", "timed out", "detached"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Fold a non-fatal session error into a failed result; let fatal ones out.
fn fold_err(err: SessionError, context: &str) -> Result<ActionResult, SessionError> {
    if err.is_fatal() {
        Err(err)
    } else {
        Ok(ActionResult::failed(format!("{context}: {err}")))
    }
}

impl ActionDispatcher {
    pub fn new(client: Arc<dyn ProtocolClient>, config: DispatchConfig) -> Self {
        Self { client, config }
    }

    async fn element_action(
        &self,
        index: u32,
        gesture: Gesture<'_>,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError> {
        let Some(node) = snapshot.node(index) else {
            let bound = match snapshot.max_index() {
                Some(max) => format!("highest is {max}"),
                None => "no elements are indexed".to_string(),
            };
            return Ok(ActionResult::invalid_target(format!(
                "no element with index {index} in the current snapshot ({bound})"
            )));
        };

        let mut last_failure = String::new();
        let attempts = self.config.action_retries + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let backoff =
                    Duration::from_millis(self.config.retry_base_delay_ms << (attempt - 2));
                debug!(target: "dispatch", index, attempt, ?backoff, "retrying after backoff");
                tokio::time::sleep(backoff).await;
            }
            match self.attempt_gesture(node, &gesture, snapshot).await {
                Ok(result) if result.is_success() || !transient_failure(&result.message) => {
                    return Ok(result.with_attempts(attempt));
                }
                Ok(result) => last_failure = result.message,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if err.retryable() => last_failure = err.to_string(),
                Err(err) => {
                    return Ok(ActionResult::failed(format!(
                        "{} element {index} failed: {err}",
                        gesture.label()
                    ))
                    .with_attempts(attempt));
                }
            }
        }
        Ok(ActionResult::failed(format!(
            "{} element {index} failed after {attempts} attempts: {last_failure}",
            gesture.label()
        ))
        .with_attempts(attempts))
    }

    async fn attempt_gesture(
        &self,
        node: &IndexedNode,
        gesture: &Gesture<'_>,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError> {
        let Some(target) = resolve_target(self.client.as_ref(), node).await? else {
            return Ok(ActionResult::failed(format!(
                "failed to resolve element {} with any strategy",
                node.index
            )));
        };
        match gesture {
            Gesture::Click => self.pointer_click(node, &target, snapshot).await,
            Gesture::Type { text } => self.type_into(node, &target, text).await,
            Gesture::Hover => self.hover_over(node, &target, snapshot).await,
            Gesture::Focus => self.focus_target(node, &target).await,
            Gesture::Select { value } => self.select_in(node, &target, value).await,
        }
    }

    async fn pointer_click(
        &self,
        node: &IndexedNode,
        target: &ResolvedTarget,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError> {
        self.scroll_into_view(&target.object_id).await?;
        let Some((x, y)) = self.click_point(&target.object_id, snapshot).await? else {
            // No geometry at all: dispatch the click inside the page.
            return self.scripted_click(node, target).await;
        };
        for event in ["mouseMoved", "mousePressed", "mouseReleased"] {
            let mut params = json!({ "type": event, "x": x, "y": y, "modifiers": 0 });
            if event != "mouseMoved" {
                params["button"] = json!("left");
                params["clickCount"] = json!(1);
            }
            self.client.call("Input.dispatchMouseEvent", params).await?;
        }
        Ok(ActionResult::ok_via(
            format!("clicked element {} at ({x:.0}, {y:.0})", node.index),
            target.strategy,
        ))
    }

    async fn scripted_click(
        &self,
        node: &IndexedNode,
        target: &ResolvedTarget,
    ) -> Result<ActionResult, SessionError> {
        let result = self
            .client
            .call(
                "Runtime.callFunctionOn",
                json!({ "objectId": target.object_id, "functionDeclaration": CLICK_JS }),
            )
            .await?;
        if result.get("exceptionDetails").is_some() {
            return Ok(ActionResult::failed(format!(
                "no geometry found for element {} and the scripted click raised",
                node.index
            )));
        }
        Ok(ActionResult::ok_via(
            format!("clicked element {} via scripted fallback", node.index),
            target.strategy,
        ))
    }

    async fn type_into(
        &self,
        node: &IndexedNode,
        target: &ResolvedTarget,
        text: &str,
    ) -> Result<ActionResult, SessionError> {
        self.scroll_into_view(&target.object_id).await?;
        self.focus_object(&target.object_id).await?;
        // Clear through events so framework-managed inputs stay in sync.
        self.client
            .call(
                "Runtime.callFunctionOn",
                json!({ "objectId": target.object_id, "functionDeclaration": CLEAR_JS }),
            )
            .await?;
        self.client
            .call("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(ActionResult::ok_via(
            format!("typed {:?} into element {}", preview(text), node.index),
            target.strategy,
        ))
    }

    async fn hover_over(
        &self,
        node: &IndexedNode,
        target: &ResolvedTarget,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError> {
        self.scroll_into_view(&target.object_id).await?;
        let Some((x, y)) = self.click_point(&target.object_id, snapshot).await? else {
            return Ok(ActionResult::failed(format!(
                "element {} is not visible; no geometry to hover",
                node.index
            )));
        };
        self.client
            .call(
                "Input.dispatchMouseEvent",
                json!({ "type": "mouseMoved", "x": x, "y": y }),
            )
            .await?;
        Ok(ActionResult::ok_via(
            format!("hovering element {} at ({x:.0}, {y:.0})", node.index),
            target.strategy,
        ))
    }

    async fn focus_target(
        &self,
        node: &IndexedNode,
        target: &ResolvedTarget,
    ) -> Result<ActionResult, SessionError> {
        self.scroll_into_view(&target.object_id).await?;
        self.focus_object(&target.object_id).await?;
        Ok(ActionResult::ok_via(
            format!("focused element {}", node.index),
            target.strategy,
        ))
    }

    async fn select_in(
        &self,
        node: &IndexedNode,
        target: &ResolvedTarget,
        value: &str,
    ) -> Result<ActionResult, SessionError> {
        self.scroll_into_view(&target.object_id).await?;
        let result = self
            .client
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": target.object_id,
                    "functionDeclaration": SELECT_JS,
                    "arguments": [{ "value": value }],
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let reason = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("selection raised");
            return Ok(ActionResult::failed(format!(
                "select in element {} failed: {reason}",
                node.index
            )));
        }
        let chosen = result["result"]["value"].as_str().unwrap_or(value);
        Ok(ActionResult::ok_via(
            format!("selected {chosen:?} in element {}", node.index),
            target.strategy,
        ))
    }

    /// Protocol scroll with a scripted fallback; only transport loss aborts.
    async fn scroll_into_view(&self, object_id: &str) -> Result<(), SessionError> {
        match self
            .client
            .call("DOM.scrollIntoViewIfNeeded", json!({ "objectId": object_id }))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(target: "dispatch", %err, "scrollIntoViewIfNeeded failed; scripted scroll");
                self.client
                    .call(
                        "Runtime.callFunctionOn",
                        json!({ "objectId": object_id, "functionDeclaration": SCROLL_JS }),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn focus_object(&self, object_id: &str) -> Result<(), SessionError> {
        match self
            .client
            .call("DOM.focus", json!({ "objectId": object_id }))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(target: "dispatch", %err, "DOM.focus failed; scripted focus");
                self.client
                    .call(
                        "Runtime.callFunctionOn",
                        json!({ "objectId": object_id, "functionDeclaration": FOCUS_JS }),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Geometry ladder: content quads, box model, then a scripted rect.
    /// `None` means the element has no usable geometry anywhere.
    async fn click_point(
        &self,
        object_id: &str,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<Option<(f64, f64)>, SessionError> {
        let quads = self.gather_quads(object_id).await?;
        Ok(best_click_point(&quads, snapshot.viewport))
    }

    async fn gather_quads(&self, object_id: &str) -> Result<Vec<Vec<f64>>, SessionError> {
        match self
            .client
            .call("DOM.getContentQuads", json!({ "objectId": object_id }))
            .await
        {
            Ok(result) => {
                let quads = decode_quads(&result["quads"]);
                if !quads.is_empty() {
                    return Ok(quads);
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => debug!(target: "dispatch", %err, "getContentQuads failed"),
        }

        match self
            .client
            .call("DOM.getBoxModel", json!({ "objectId": object_id }))
            .await
        {
            Ok(result) => {
                let content = float_array(&result["model"]["content"]);
                if content.len() >= 8 {
                    return Ok(vec![content]);
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => debug!(target: "dispatch", %err, "getBoxModel failed"),
        }

        match self
            .client
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": RECT_JS,
                    "returnByValue": true,
                }),
            )
            .await
        {
            Ok(result) => {
                let rect = &result["result"]["value"];
                let (x, y) = (
                    rect["x"].as_f64().unwrap_or(0.0),
                    rect["y"].as_f64().unwrap_or(0.0),
                );
                let (w, h) = (
                    rect["width"].as_f64().unwrap_or(0.0),
                    rect["height"].as_f64().unwrap_or(0.0),
                );
                if w > 0.0 && h > 0.0 {
                    return Ok(vec![vec![x, y, x + w, y, x + w, y + h, x, y + h]]);
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => debug!(target: "dispatch", %err, "scripted rect failed"),
        }

        Ok(Vec::new())
    }

    async fn dispatch_key_events(&self, combo: &KeyCombo) -> Result<(), SessionError> {
        for kind in ["keyDown", "keyUp"] {
            let mut params = json!({
                "type": kind,
                "key": combo.key,
                "modifiers": combo.modifiers,
            });
            if let Some(code) = &combo.code {
                params["code"] = json!(code);
            }
            if let Some(vk) = combo.windows_virtual_key_code {
                params["windowsVirtualKeyCode"] = json!(vk);
            }
            self.client.call("Input.dispatchKeyEvent", params).await?;
            // Enter needs the carriage-return char event between down and up
            // for form submission handlers to see it.
            if kind == "keyDown" && combo.key == "Enter" {
                self.client
                    .call(
                        "Input.dispatchKeyEvent",
                        json!({ "type": "char", "text": "\r", "key": "Enter" }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn press(&self, combo_text: &str) -> Result<ActionResult, SessionError> {
        let combo = parse_key(combo_text);
        match self.dispatch_key_events(&combo).await {
            Ok(()) => Ok(ActionResult::ok(format!("pressed {combo_text}"))),
            Err(err) => fold_err(err, &format!("key press {combo_text} failed")),
        }
    }

    async fn scroll_page(&self, direction: ScrollDirection) -> Result<ActionResult, SessionError> {
        let amount = self.config.scroll_amount_px;
        let (dx, dy) = direction.delta(amount);
        match self
            .client
            .evaluate(&format!("window.scrollBy({dx}, {dy})"))
            .await
        {
            Ok(_) => Ok(ActionResult::ok(format!("scrolled {direction} by {amount}px"))),
            Err(err) => fold_err(err, &format!("scroll {direction} failed")),
        }
    }

    async fn wait_for(&self, seconds: f64) -> Result<ActionResult, SessionError> {
        let capped = if seconds.is_finite() {
            seconds.clamp(0.0, self.config.max_wait_secs)
        } else {
            0.0
        };
        tokio::time::sleep(Duration::from_secs_f64(capped)).await;
        Ok(ActionResult::ok(format!("waited {capped:.1}s")))
    }

    async fn navigate_to(&self, url: &str) -> Result<ActionResult, SessionError> {
        match self.client.navigate(url).await {
            Ok(()) => Ok(ActionResult::ok(format!("navigated to {url}"))),
            Err(err) => fold_err(err, &format!("navigation to {url} failed")),
        }
    }

    async fn history_move(
        &self,
        outcome: Result<(), SessionError>,
        success: &str,
        context: &str,
    ) -> Result<ActionResult, SessionError> {
        match outcome {
            Ok(()) => Ok(ActionResult::ok(success)),
            Err(err) => fold_err(err, context),
        }
    }

    async fn tab_overview(&self) -> Result<ActionResult, SessionError> {
        match self.client.tabs().await {
            Ok(tabs) if tabs.is_empty() => Ok(ActionResult::ok("no open tabs")),
            Ok(tabs) => {
                let lines: Vec<String> = tabs
                    .iter()
                    .enumerate()
                    .map(|(position, tab)| {
                        let marker = if tab.is_active { "*" } else { " " };
                        format!("[{position}]{marker} {} ({})", tab.title, tab.url)
                    })
                    .collect();
                Ok(ActionResult::ok(lines.join("\n")))
            }
            Err(err) => fold_err(err, "tab listing failed"),
        }
    }

    async fn open_tab(&self, url: &str) -> Result<ActionResult, SessionError> {
        match self.client.create_tab(url).await {
            Ok(tab) => Ok(ActionResult::ok(format!("opened new tab at {}", tab.url))),
            Err(err) => fold_err(err, &format!("new tab at {url} failed")),
        }
    }

    async fn switch_to_tab(&self, index: usize) -> Result<ActionResult, SessionError> {
        match self.client.switch_tab(index).await {
            Ok(tab) => Ok(ActionResult::ok(format!(
                "switched to tab {index}: {}",
                tab.url
            ))),
            Err(err) => fold_err(err, &format!("switch to tab {index} failed")),
        }
    }

    async fn close_tab_at(&self, index: usize) -> Result<ActionResult, SessionError> {
        match self.client.close_tab(index).await {
            Ok(()) => Ok(ActionResult::ok(format!("closed tab {index}"))),
            Err(err) => fold_err(err, &format!("close tab {index} failed")),
        }
    }
}

#[async_trait]
impl Dispatcher for ActionDispatcher {
    async fn execute(
        &self,
        intent: &ActionIntent,
        snapshot: &BrowserStateSnapshot,
    ) -> Result<ActionResult, SessionError> {
        debug!(target: "dispatch", intent = %intent.describe(), "executing");
        match intent {
            ActionIntent::Click { index } => {
                self.element_action(*index, Gesture::Click, snapshot).await
            }
            ActionIntent::TypeText { index, text } => {
                self.element_action(*index, Gesture::Type { text }, snapshot)
                    .await
            }
            ActionIntent::Hover { index } => {
                self.element_action(*index, Gesture::Hover, snapshot).await
            }
            ActionIntent::Focus { index } => {
                self.element_action(*index, Gesture::Focus, snapshot).await
            }
            ActionIntent::SelectOption { index, value } => {
                self.element_action(*index, Gesture::Select { value }, snapshot)
                    .await
            }
            ActionIntent::Navigate { url } => self.navigate_to(url).await,
            ActionIntent::Scroll { direction } => self.scroll_page(*direction).await,
            ActionIntent::Wait { seconds } => self.wait_for(*seconds).await,
            ActionIntent::PressKey { key } => self.press(key).await,
            ActionIntent::AskHuman { question } => Ok(ActionResult::uncertain(format!(
                "escalation requested: {question}"
            ))),
            ActionIntent::Done { message, .. } => Ok(ActionResult::ok(message.clone())),
            ActionIntent::GoBack => {
                let outcome = self.client.go_back().await;
                self.history_move(outcome, "went back", "go back failed").await
            }
            ActionIntent::GoForward => {
                let outcome = self.client.go_forward().await;
                self.history_move(outcome, "went forward", "go forward failed")
                    .await
            }
            ActionIntent::RefreshPage => {
                let outcome = self.client.refresh().await;
                self.history_move(outcome, "page refreshed", "refresh failed")
                    .await
            }
            ActionIntent::NewTab { url } => self.open_tab(url).await,
            ActionIntent::SwitchTab { tab_index } => self.switch_to_tab(*tab_index).await,
            ActionIntent::CloseTab { tab_index } => self.close_tab_at(*tab_index).await,
            ActionIntent::GetTabs => self.tab_overview().await,
        }
    }
}

fn decode_quads(raw: &Value) -> Vec<Vec<f64>> {
    raw.as_array()
        .map(|quads| {
            quads
                .iter()
                .map(float_array)
                .filter(|quad| quad.len() >= 8)
                .collect()
        })
        .unwrap_or_default()
}

fn float_array(raw: &Value) -> Vec<f64> {
    raw.as_array()
        .map(|values| values.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Center of the quad with the largest viewport-visible area, clamped into
/// the viewport. `None` when no quad has eight coordinates.
fn best_click_point(quads: &[Vec<f64>], viewport: ViewportSize) -> Option<(f64, f64)> {
    let mut best: Option<(&Vec<f64>, f64)> = None;
    for quad in quads.iter().filter(|quad| quad.len() >= 8) {
        let xs: Vec<f64> = quad.iter().step_by(2).copied().collect();
        let ys: Vec<f64> = quad.iter().skip(1).step_by(2).copied().collect();
        let (min_x, max_x) = bounds(&xs);
        let (min_y, max_y) = bounds(&ys);
        if max_x < 0.0 || max_y < 0.0 || min_x > viewport.width || min_y > viewport.height {
            continue;
        }
        let visible = (max_x.min(viewport.width) - min_x.max(0.0))
            * (max_y.min(viewport.height) - min_y.max(0.0));
        if best.as_ref().map(|(_, area)| visible > *area).unwrap_or(true) {
            best = Some((quad, visible));
        }
    }

    let quad = match best {
        Some((quad, _)) => quad,
        // Everything off-screen: aim at the first quad and let the clamp
        // bring the point back inside.
        None => quads.iter().find(|quad| quad.len() >= 8)?,
    };
    let xs: Vec<f64> = quad.iter().step_by(2).copied().collect();
    let ys: Vec<f64> = quad.iter().skip(1).step_by(2).copied().collect();
    let x = xs.iter().sum::<f64>() / xs.len() as f64;
    let y = ys.iter().sum::<f64>() / ys.len() as f64;
    Some((
        x.clamp(0.0, (viewport.width - 1.0).max(0.0)),
        y.clamp(0.0, (viewport.height - 1.0).max(0.0)),
    ))
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use cdp_session::TabInfo;
    use dom_perceiver::{BBox, ScrollPosition, Selector, SelectorSet};
    use helmsman_core_types::{BackendNodeId, TargetId};

    use crate::result::{ActionStatus, FailureKind};

    use super::*;

    /// Scripted protocol endpoint that records every call. Methods without
    /// a canned response answer with an empty object, which is how most
    /// fire-and-forget protocol commands reply anyway.
    struct FakeClient {
        responses: Mutex<HashMap<String, Value>>,
        failures: Mutex<HashMap<String, SessionError>>,
        calls: Mutex<Vec<(String, Value)>>,
        url: Mutex<String>,
        tab_list: Mutex<Vec<TabInfo>>,
    }

    impl FakeClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                url: Mutex::new("https://shop.test/cart".to_string()),
                tab_list: Mutex::new(Vec::new()),
            })
        }

        fn respond(&self, method: &str, value: Value) {
            self.responses.lock().insert(method.to_string(), value);
        }

        fn fail_with(&self, method: &str, err: SessionError) {
            self.failures.lock().insert(method.to_string(), err);
        }

        fn add_tab(&self, url: &str, title: &str, is_active: bool) {
            let mut tabs = self.tab_list.lock();
            let target_id = TargetId::from(format!("target-{}", tabs.len()));
            tabs.push(TabInfo {
                target_id,
                url: url.to_string(),
                title: title.to_string(),
                session_id: None,
                is_active,
            });
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().clone()
        }

        fn calls_of(&self, method: &str) -> Vec<Value> {
            self.calls
                .lock()
                .iter()
                .filter(|(name, _)| name == method)
                .map(|(_, params)| params.clone())
                .collect()
        }

        fn answer(&self, method: &str) -> Result<Value, SessionError> {
            if let Some(err) = self.failures.lock().get(method) {
                return Err(err.clone());
            }
            if let Some(value) = self.responses.lock().get(method) {
                return Ok(value.clone());
            }
            Ok(json!({}))
        }
    }

    #[async_trait]
    impl ProtocolClient for FakeClient {
        async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
            self.calls.lock().push((method.to_string(), params));
            self.answer(method)
        }

        async fn browser_call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
            self.calls.lock().push((method.to_string(), params));
            self.answer(method)
        }

        async fn evaluate(&self, expression: &str) -> Result<Value, SessionError> {
            self.calls
                .lock()
                .push(("evaluate".to_string(), json!(expression)));
            self.answer("evaluate")
        }

        async fn current_url(&self) -> Result<String, SessionError> {
            Ok(self.url.lock().clone())
        }

        async fn tabs(&self) -> Result<Vec<TabInfo>, SessionError> {
            Ok(self.tab_list.lock().clone())
        }

        async fn create_tab(&self, url: &str) -> Result<TabInfo, SessionError> {
            self.calls
                .lock()
                .push(("create_tab".to_string(), json!(url)));
            self.add_tab(url, "", true);
            let tab = self.tab_list.lock().last().cloned();
            tab.ok_or_else(|| SessionError::internal("tab list empty after create"))
        }

        async fn switch_tab(&self, index: usize) -> Result<TabInfo, SessionError> {
            self.tab_list
                .lock()
                .get(index)
                .cloned()
                .ok_or(SessionError::NoSuchTab(index))
        }

        async fn close_tab(&self, index: usize) -> Result<(), SessionError> {
            let mut tabs = self.tab_list.lock();
            if tabs.len() <= 1 {
                return Err(SessionError::LastTab);
            }
            if index >= tabs.len() {
                return Err(SessionError::NoSuchTab(index));
            }
            tabs.remove(index);
            Ok(())
        }

        async fn navigate(&self, url: &str) -> Result<(), SessionError> {
            self.calls.lock().push(("navigate".to_string(), json!(url)));
            self.answer("navigate")?;
            *self.url.lock() = url.to_string();
            Ok(())
        }

        async fn go_back(&self) -> Result<(), SessionError> {
            self.calls.lock().push(("go_back".to_string(), json!(null)));
            self.answer("go_back").map(|_| ())
        }

        async fn go_forward(&self) -> Result<(), SessionError> {
            self.calls
                .lock()
                .push(("go_forward".to_string(), json!(null)));
            self.answer("go_forward").map(|_| ())
        }

        async fn refresh(&self) -> Result<(), SessionError> {
            self.calls.lock().push(("refresh".to_string(), json!(null)));
            self.answer("refresh").map(|_| ())
        }
    }

    fn indexed_node(index: u32, selectors: Vec<Selector>) -> IndexedNode {
        IndexedNode {
            index,
            id: BackendNodeId::from(100 + u64::from(index)),
            tag: "button".to_string(),
            line: format!("<button>node {index}</button>"),
            selectors: SelectorSet { ranked: selectors },
            bbox: BBox {
                x: 100.0,
                y: 100.0,
                width: 80.0,
                height: 30.0,
            },
            depth: 2,
        }
    }

    fn snapshot(nodes: Vec<IndexedNode>) -> BrowserStateSnapshot {
        BrowserStateSnapshot {
            url: "https://shop.test/cart".to_string(),
            previous_url: None,
            scroll: ScrollPosition::default(),
            viewport: ViewportSize {
                width: 1280.0,
                height: 800.0,
            },
            tree: Vec::new(),
            indexed: nodes,
            captured_at: chrono::Utc::now(),
        }
    }

    fn css(selector: &str) -> Selector {
        Selector::Css {
            selector: selector.to_string(),
        }
    }

    fn dispatcher(client: Arc<FakeClient>) -> ActionDispatcher {
        let config = DispatchConfig {
            retry_base_delay_ms: 1,
            ..DispatchConfig::default()
        };
        ActionDispatcher::new(client, config)
    }

    #[tokio::test]
    async fn stale_index_never_touches_the_browser() {
        let client = FakeClient::new();
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(5, vec![css("#only")])]);

        let result = dispatch
            .execute(&ActionIntent::Click { index: 7 }, &snap)
            .await
            .unwrap();

        assert_eq!(result.status, ActionStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::InvalidTarget));
        assert!(result.message.contains("highest is 5"), "{}", result.message);
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn click_resolves_css_and_dispatches_pointer_events() {
        let client = FakeClient::new();
        client.respond(
            "Runtime.evaluate",
            json!({ "result": { "objectId": "obj-1", "subtype": "node" } }),
        );
        client.respond(
            "DOM.getContentQuads",
            json!({ "quads": [[100.0, 100.0, 180.0, 100.0, 180.0, 130.0, 100.0, 130.0]] }),
        );
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(5, vec![css("#add-to-cart")])]);

        let result = dispatch
            .execute(&ActionIntent::Click { index: 5 }, &snap)
            .await
            .unwrap();

        assert!(result.is_success(), "{}", result.message);
        assert_eq!(result.strategy.as_deref(), Some("css"));
        assert_eq!(result.attempts, 1);
        assert!(result.message.contains("(140, 115)"), "{}", result.message);

        let mouse = client.calls_of("Input.dispatchMouseEvent");
        assert_eq!(mouse.len(), 3);
        assert_eq!(mouse[0]["type"], "mouseMoved");
        assert_eq!(mouse[1]["type"], "mousePressed");
        assert_eq!(mouse[1]["button"], "left");
        assert_eq!(mouse[2]["type"], "mouseReleased");
    }

    #[tokio::test]
    async fn css_miss_falls_back_to_aria() {
        let client = FakeClient::new();
        client.respond("Runtime.evaluate", json!({ "result": { "subtype": "null" } }));
        client.respond(
            "Accessibility.queryAXTree",
            json!({ "nodes": [{ "backendDOMNodeId": 41, "ignored": false }] }),
        );
        client.respond(
            "DOM.resolveNode",
            json!({ "object": { "objectId": "obj-aria" } }),
        );
        client.respond(
            "DOM.getContentQuads",
            json!({ "quads": [[10.0, 10.0, 60.0, 10.0, 60.0, 40.0, 10.0, 40.0]] }),
        );
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(
            0,
            vec![
                css("#gone"),
                Selector::Aria {
                    role: "button".to_string(),
                    name: "Add to cart".to_string(),
                },
            ],
        )]);

        let result = dispatch
            .execute(&ActionIntent::Click { index: 0 }, &snap)
            .await
            .unwrap();

        assert!(result.is_success(), "{}", result.message);
        assert_eq!(result.strategy.as_deref(), Some("aria"));
        let ax = client.calls_of("Accessibility.queryAXTree");
        assert_eq!(ax[0]["accessibleName"], "Add to cart");
        assert_eq!(ax[0]["role"], "button");
    }

    #[tokio::test]
    async fn geometry_free_elements_fall_back_to_scripted_click() {
        let client = FakeClient::new();
        client.respond(
            "Runtime.evaluate",
            json!({ "result": { "objectId": "obj-1" } }),
        );
        // No quads, no box model, no scripted rect: the ladder runs dry.
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(0, vec![css("#hidden-input")])]);

        let result = dispatch
            .execute(&ActionIntent::Click { index: 0 }, &snap)
            .await
            .unwrap();

        assert!(result.is_success(), "{}", result.message);
        assert!(
            result.message.contains("scripted fallback"),
            "{}",
            result.message
        );
        assert!(client.calls_of("Input.dispatchMouseEvent").is_empty());
    }

    #[tokio::test]
    async fn type_text_focuses_clears_and_inserts() {
        let client = FakeClient::new();
        client.respond(
            "Runtime.evaluate",
            json!({ "result": { "objectId": "obj-2" } }),
        );
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(3, vec![css("input[name=q]")])]);

        let result = dispatch
            .execute(
                &ActionIntent::TypeText {
                    index: 3,
                    text: "hello".to_string(),
                },
                &snap,
            )
            .await
            .unwrap();

        assert!(result.is_success(), "{}", result.message);
        assert_eq!(client.calls_of("DOM.focus").len(), 1);
        let inserted = client.calls_of("Input.insertText");
        assert_eq!(inserted[0]["text"], "hello");
        // The clear runs as a scripted function before the insert.
        assert!(!client.calls_of("Runtime.callFunctionOn").is_empty());
    }

    #[tokio::test]
    async fn all_strategies_exhausted_is_action_failed_after_retries() {
        let client = FakeClient::new();
        client.respond("Runtime.evaluate", json!({ "result": { "subtype": "null" } }));
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(2, vec![css("#missing")])]);

        let result = dispatch
            .execute(&ActionIntent::Click { index: 2 }, &snap)
            .await
            .unwrap();

        assert_eq!(result.status, ActionStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::ActionFailed));
        assert_eq!(result.attempts, 3);
        assert!(result.message.contains("3 attempts"), "{}", result.message);
        assert!(
            result.message.contains("failed to resolve"),
            "{}",
            result.message
        );
    }

    #[tokio::test]
    async fn transport_loss_propagates_as_an_error() {
        let client = FakeClient::new();
        client.fail_with(
            "Runtime.evaluate",
            SessionError::Transport("socket closed".to_string()),
        );
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(0, vec![css("#a")])]);

        let err = dispatch
            .execute(&ActionIntent::Click { index: 0 }, &snap)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn select_option_reports_the_chosen_label() {
        let client = FakeClient::new();
        client.respond(
            "Runtime.evaluate",
            json!({ "result": { "objectId": "obj-3" } }),
        );
        client.respond(
            "Runtime.callFunctionOn",
            json!({ "result": { "value": "Large" } }),
        );
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(vec![indexed_node(1, vec![css("select#size")])]);

        let result = dispatch
            .execute(
                &ActionIntent::SelectOption {
                    index: 1,
                    value: "L".to_string(),
                },
                &snap,
            )
            .await
            .unwrap();

        assert!(result.is_success(), "{}", result.message);
        assert!(result.message.contains("Large"), "{}", result.message);
    }

    #[tokio::test]
    async fn press_key_sends_down_char_and_up() {
        let client = FakeClient::new();
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(Vec::new());

        let result = dispatch
            .execute(
                &ActionIntent::PressKey {
                    key: "Control+Enter".to_string(),
                },
                &snap,
            )
            .await
            .unwrap();

        assert!(result.is_success());
        let events = client.calls_of("Input.dispatchKeyEvent");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], "keyDown");
        assert_eq!(events[0]["key"], "Enter");
        assert_eq!(events[0]["modifiers"], 2);
        assert_eq!(events[0]["windowsVirtualKeyCode"], 13);
        assert_eq!(events[1]["type"], "char");
        assert_eq!(events[2]["type"], "keyUp");
    }

    #[tokio::test]
    async fn scroll_runs_the_page_script() {
        let client = FakeClient::new();
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(Vec::new());

        let result = dispatch
            .execute(
                &ActionIntent::Scroll {
                    direction: ScrollDirection::Down,
                },
                &snap,
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.message.contains("500px"), "{}", result.message);
        let evals = client.calls_of("evaluate");
        assert_eq!(evals[0], json!("window.scrollBy(0, 500)"));
    }

    #[tokio::test]
    async fn wait_clamps_hostile_durations() {
        let client = FakeClient::new();
        let config = DispatchConfig {
            max_wait_secs: 0.2,
            ..DispatchConfig::default()
        };
        let dispatch = ActionDispatcher::new(client, config);
        let snap = snapshot(Vec::new());

        let long = dispatch
            .execute(&ActionIntent::Wait { seconds: 900.0 }, &snap)
            .await
            .unwrap();
        assert_eq!(long.message, "waited 0.2s");

        let nan = dispatch
            .execute(&ActionIntent::Wait { seconds: f64::NAN }, &snap)
            .await
            .unwrap();
        assert_eq!(nan.message, "waited 0.0s");
    }

    #[tokio::test]
    async fn navigation_goes_through_the_session() {
        let client = FakeClient::new();
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(Vec::new());

        let result = dispatch
            .execute(
                &ActionIntent::Navigate {
                    url: "https://example.org/checkout".to_string(),
                },
                &snap,
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(client.current_url().await.unwrap(), "https://example.org/checkout");

        let back = dispatch.execute(&ActionIntent::GoBack, &snap).await.unwrap();
        assert_eq!(back.message, "went back");
    }

    #[tokio::test]
    async fn tab_listing_marks_the_active_tab() {
        let client = FakeClient::new();
        client.add_tab("https://a.test/", "Alpha", true);
        client.add_tab("https://b.test/", "Beta", false);
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(Vec::new());

        let result = dispatch.execute(&ActionIntent::GetTabs, &snap).await.unwrap();
        assert!(result.message.contains("[0]* Alpha"), "{}", result.message);
        assert!(result.message.contains("[1]  Beta"), "{}", result.message);

        let missing = dispatch
            .execute(&ActionIntent::SwitchTab { tab_index: 5 }, &snap)
            .await
            .unwrap();
        assert_eq!(missing.status, ActionStatus::Failed);

        // Closing the only remaining tab after one close is refused, and the
        // refusal stays inside the result.
        let closed = dispatch
            .execute(&ActionIntent::CloseTab { tab_index: 1 }, &snap)
            .await
            .unwrap();
        assert!(closed.is_success());
        let refused = dispatch
            .execute(&ActionIntent::CloseTab { tab_index: 0 }, &snap)
            .await
            .unwrap();
        assert_eq!(refused.status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn ask_human_is_uncertain_without_touching_the_page() {
        let client = FakeClient::new();
        let dispatch = dispatcher(client.clone());
        let snap = snapshot(Vec::new());

        let result = dispatch
            .execute(
                &ActionIntent::AskHuman {
                    question: "which account?".to_string(),
                },
                &snap,
            )
            .await
            .unwrap();

        assert_eq!(result.status, ActionStatus::Uncertain);
        assert!(client.calls().is_empty());
    }

    #[test]
    fn best_click_point_prefers_the_most_visible_quad() {
        let viewport = ViewportSize {
            width: 1280.0,
            height: 800.0,
        };
        let quads = vec![
            // Mostly off-screen to the left.
            vec![-150.0, 10.0, 50.0, 10.0, 50.0, 40.0, -150.0, 40.0],
            vec![200.0, 200.0, 400.0, 200.0, 400.0, 300.0, 200.0, 300.0],
        ];
        assert_eq!(best_click_point(&quads, viewport), Some((300.0, 250.0)));
    }

    #[test]
    fn best_click_point_clamps_offscreen_centers() {
        let viewport = ViewportSize {
            width: 1280.0,
            height: 800.0,
        };
        let below = vec![vec![600.0, 900.0, 700.0, 900.0, 700.0, 950.0, 600.0, 950.0]];
        assert_eq!(best_click_point(&below, viewport), Some((650.0, 799.0)));
    }

    #[test]
    fn best_click_point_needs_a_full_quad() {
        let viewport = ViewportSize {
            width: 1280.0,
            height: 800.0,
        };
        assert_eq!(best_click_point(&[], viewport), None);
        assert_eq!(best_click_point(&[vec![1.0, 2.0]], viewport), None);
    }
}

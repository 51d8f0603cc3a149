use helmsman_core_types::TargetId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One page target known to the session, as surfaced to callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabInfo {
    pub target_id: TargetId,
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub is_active: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct TabEntry {
    pub target_id: TargetId,
    pub session_id: Option<String>,
    pub url: String,
    pub title: String,
}

/// In-memory view of the browser's page targets.
///
/// The registry is pure bookkeeping; protocol traffic happens in the session
/// which feeds `Target.getTargets` payloads into [`TabRegistry::reconcile`].
#[derive(Default)]
pub(crate) struct TabRegistry {
    tabs: Vec<TabEntry>,
    active: usize,
}

impl TabRegistry {
    /// Rebuild the tab list from a `Target.getTargets` payload, keeping
    /// attached session ids for targets we already know and keeping the
    /// active tab if it still exists.
    pub fn reconcile(&mut self, target_infos: &[Value]) {
        let active_target = self.tabs.get(self.active).map(|tab| tab.target_id.clone());

        let mut next = Vec::new();
        for info in target_infos {
            if info.get("type").and_then(Value::as_str) != Some("page") {
                continue;
            }
            let Some(target_id) = info.get("targetId").and_then(Value::as_str) else {
                continue;
            };
            let known = self
                .tabs
                .iter()
                .find(|tab| tab.target_id.0 == target_id)
                .and_then(|tab| tab.session_id.clone());
            next.push(TabEntry {
                target_id: TargetId::from(target_id),
                session_id: known,
                url: info
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                title: info
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        self.tabs = next;
        self.active = active_target
            .and_then(|target| self.position(&target))
            .unwrap_or(0);
    }

    pub fn position(&self, target: &TargetId) -> Option<usize> {
        self.tabs.iter().position(|tab| &tab.target_id == target)
    }

    pub fn push_active(&mut self, entry: TabEntry) {
        self.tabs.push(entry);
        self.active = self.tabs.len() - 1;
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn set_active(&mut self, index: usize) {
        if index < self.tabs.len() {
            self.active = index;
        }
    }

    pub fn get(&self, index: usize) -> Option<&TabEntry> {
        self.tabs.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TabEntry> {
        self.tabs.get_mut(index)
    }

    pub fn active_entry(&self) -> Option<&TabEntry> {
        self.tabs.get(self.active)
    }

    pub fn remove(&mut self, index: usize) {
        if index >= self.tabs.len() {
            return;
        }
        self.tabs.remove(index);
        if self.active >= self.tabs.len() && !self.tabs.is_empty() {
            self.active = self.tabs.len() - 1;
        } else if self.active > index {
            self.active -= 1;
        }
    }

    pub fn infos(&self) -> Vec<TabInfo> {
        self.tabs
            .iter()
            .enumerate()
            .map(|(i, tab)| TabInfo {
                target_id: tab.target_id.clone(),
                url: tab.url.clone(),
                title: tab.title.clone(),
                session_id: tab.session_id.clone(),
                is_active: i == self.active,
            })
            .collect()
    }
}

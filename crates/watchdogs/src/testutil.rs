//! Shared protocol-client fake for watchdog tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use cdp_session::{ProtocolClient, SessionError, TabInfo};

type EvalFn = Box<dyn Fn(&str) -> Result<Value, SessionError> + Send + Sync>;

/// Client whose `evaluate` is a scripted closure; every other capability is
/// inert. The watchdogs only ever evaluate, so this is all they need.
pub(crate) struct ScriptClient {
    eval: EvalFn,
}

impl ScriptClient {
    pub(crate) fn new(
        eval: impl Fn(&str) -> Result<Value, SessionError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            eval: Box::new(eval),
        })
    }

    /// Client answering every evaluation with the same value.
    pub(crate) fn always(value: Value) -> Arc<Self> {
        Self::new(move |_| Ok(value.clone()))
    }
}

#[async_trait]
impl ProtocolClient for ScriptClient {
    async fn call(&self, _method: &str, _params: Value) -> Result<Value, SessionError> {
        Ok(Value::Null)
    }

    async fn browser_call(&self, _method: &str, _params: Value) -> Result<Value, SessionError> {
        Ok(Value::Null)
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, SessionError> {
        (self.eval)(expression)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Ok("about:blank".to_string())
    }

    async fn tabs(&self) -> Result<Vec<TabInfo>, SessionError> {
        Ok(Vec::new())
    }

    async fn create_tab(&self, _url: &str) -> Result<TabInfo, SessionError> {
        Err(SessionError::internal("not scripted"))
    }

    async fn switch_tab(&self, _index: usize) -> Result<TabInfo, SessionError> {
        Err(SessionError::internal("not scripted"))
    }

    async fn close_tab(&self, _index: usize) -> Result<(), SessionError> {
        Ok(())
    }

    async fn navigate(&self, _url: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn go_back(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn go_forward(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

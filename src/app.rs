//! Component assembly for one run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use action_dispatch::ActionDispatcher;
use agent_loop::{OrchestrationLoop, RunOutcome};
use cdp_session::{CdpSession, ProtocolClient};
use dom_perceiver::DomPerceiver;
use helmsman_event_bus::EventBus;
use session_watchdogs::WatchdogSet;

use crate::config::HelmsmanConfig;
use crate::engine::ScriptedDecisionEngine;
use crate::observer::LoggingObserver;

/// Launch or attach, start the watchdogs, and drive `task` to a terminal
/// status with the scripted engine.
pub async fn run_task(
    config: &HelmsmanConfig,
    task: &str,
    start_url: Option<&str>,
    plan: &Path,
) -> Result<RunOutcome> {
    // Parse the plan before touching a browser so a bad file fails fast.
    let engine = Arc::new(ScriptedDecisionEngine::from_file(plan)?);

    let bus = EventBus::new();
    let session = CdpSession::connect(config.session.clone(), bus.clone())
        .await
        .context("failed to launch or attach to a browser")?;
    let client: Arc<dyn ProtocolClient> = session.clone();

    let watchdogs = WatchdogSet::standard(bus.clone(), client.clone(), config.watchdogs.clone());
    let failures = watchdogs.start_all().await;
    if !failures.is_empty() {
        warn!(
            target: "cli",
            missing = failures.len(),
            total = watchdogs.len(),
            "running with a reduced watchdog set"
        );
    }

    if let Some(url) = start_url {
        client
            .navigate(url)
            .await
            .with_context(|| format!("failed to open start page {url}"))?;
        info!(target: "cli", %url, "start page open");
    }

    let perceiver = DomPerceiver::new(client.clone(), config.perceiver.clone());
    let dispatcher = Arc::new(ActionDispatcher::new(
        client.clone(),
        config.dispatch.clone(),
    ));

    let mut orchestration = OrchestrationLoop::new(
        Box::new(perceiver),
        engine,
        dispatcher,
        client,
        bus,
        config.orchestration.clone(),
    )
    .with_observer(Arc::new(LoggingObserver));

    let outcome = orchestration.run(task).await;
    watchdogs.stop_all().await;
    Ok(outcome)
}

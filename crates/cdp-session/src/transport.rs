use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use helmsman_event_bus::ProtocolEvent;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::launcher::{self, LaunchedBrowser};

/// Where a command is addressed: the browser endpoint itself, or one
/// attached (flat-mode) target session.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

/// Low-level wire seam. The session logic is written against this trait so
/// tests can substitute a scripted transport for a live connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a command and await its response payload.
    async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, SessionError>;

    /// Next protocol event, or `None` once the connection is gone.
    async fn next_event(&self) -> Option<ProtocolEvent>;

    fn is_alive(&self) -> bool;
}

struct PendingCommand {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, SessionError>>,
}

/// Live DevTools connection: one actor task owns the WebSocket, correlates
/// responses to callers by call id, and forwards events to a channel the
/// session pumps onto the bus. Loss of the socket marks the transport dead;
/// there is no automatic reconnect. Callers see a fatal
/// [`SessionError::Transport`] and decide what to do with the run.
pub struct ChromiumTransport {
    command_tx: mpsc::Sender<PendingCommand>,
    events_rx: Mutex<mpsc::Receiver<ProtocolEvent>>,
    loop_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    browser: Mutex<Option<LaunchedBrowser>>,
    alive: Arc<AtomicBool>,
    command_timeout: Duration,
}

impl ChromiumTransport {
    /// Connect to `config.websocket_url`, or launch a browser when none is
    /// configured, then start the actor and heartbeat tasks.
    pub async fn connect(config: &SessionConfig) -> Result<Self, SessionError> {
        let (browser, ws_url) = match config.websocket_url.clone() {
            Some(raw) => {
                let endpoint = Url::parse(&raw)
                    .map_err(|err| SessionError::Launch(format!("invalid websocket url {raw:?}: {err}")))?;
                if !matches!(endpoint.scheme(), "ws" | "wss") {
                    return Err(SessionError::Launch(format!(
                        "websocket url {raw:?} must use the ws or wss scheme"
                    )));
                }
                (None, raw)
            }
            None => {
                let launched = launcher::launch(config).await?;
                let url = launched.ws_url.clone();
                (Some(launched), url)
            }
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            let result = run_loop(conn, command_rx, events_tx).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "cdp", %err, "transport loop terminated with error");
            }
        });

        let heartbeat_task = spawn_heartbeat(
            command_tx.clone(),
            alive.clone(),
            Duration::from_millis(config.heartbeat_interval_ms),
            config.command_timeout(),
        );

        info!(target: "cdp", url = %ws_url, "devtools connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task,
            heartbeat_task,
            browser: Mutex::new(browser),
            alive,
            command_timeout: config.command_timeout(),
        })
    }
}

#[async_trait]
impl Transport for ChromiumTransport {
    async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Transport("connection lost".to_string()));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let pending = PendingCommand {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(pending)
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;

        match tokio::time::timeout(self.command_timeout, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Transport(
                "command response channel closed".to_string(),
            )),
            Err(_) => Err(SessionError::CommandTimeout {
                method: method.to_string(),
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }

    async fn next_event(&self) -> Option<ProtocolEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<PendingCommand>,
    event_tx: mpsc::Sender<ProtocolEvent>,
) -> Result<(), SessionError> {
    let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, SessionError>>> =
        HashMap::new();

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                submit(&mut conn, cmd, &mut inflight)?;
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        deliver_response(resp, &mut inflight);
                    }
                    Some(Ok(Message::Event(event))) => {
                        forward_event(event, &event_tx).await;
                    }
                    Some(Err(err)) => {
                        let session_err = map_cdp_error(err);
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(session_err.clone()));
                        }
                        return Err(session_err);
                    }
                    None => {
                        let err = SessionError::Transport("devtools connection closed".to_string());
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(err.clone()));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn submit(
    conn: &mut Connection<CdpEventMessage>,
    cmd: PendingCommand,
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, SessionError>>>,
) -> Result<(), SessionError> {
    let session = match cmd.target {
        CommandTarget::Browser => None,
        CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
    };

    let method_id: MethodId = cmd.method.clone().into();
    match conn.submit_command(method_id, session, cmd.params) {
        Ok(call_id) => {
            inflight.insert(call_id, cmd.responder);
            Ok(())
        }
        Err(err) => {
            let session_err = SessionError::Transport(err.to_string());
            let _ = cmd.responder.send(Err(session_err.clone()));
            Err(session_err)
        }
    }
}

fn deliver_response(
    resp: Response,
    inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, SessionError>>>,
) {
    let entry = inflight.remove(&resp.id);
    let result = extract_payload(resp);

    if let Some(sender) = entry {
        let _ = sender.send(result);
    }
}

async fn forward_event(event: CdpEventMessage, event_tx: &mpsc::Sender<ProtocolEvent>) {
    let raw: CdpJsonEventMessage = match event.try_into() {
        Ok(raw) => raw,
        Err(err) => {
            warn!(target: "cdp", %err, "failed to decode protocol event");
            return;
        }
    };

    let mut payload = ProtocolEvent::new(raw.method.into_owned(), raw.params);
    if let Some(session_id) = raw.session_id {
        payload = payload.with_session(session_id);
    }

    if event_tx.send(payload).await.is_err() {
        debug!(target: "cdp", "event channel closed; dropping protocol event");
    }
}

fn extract_payload(resp: Response) -> Result<Value, SessionError> {
    if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        Err(SessionError::Protocol {
            code: error.code,
            message: error.message,
        })
    } else {
        Err(SessionError::internal("empty protocol response"))
    }
}

fn map_cdp_error(err: CdpError) -> SessionError {
    let detail = err.to_string();
    match err {
        CdpError::JavascriptException(_) => SessionError::Script(detail),
        CdpError::FrameNotFound(_) | CdpError::Serde(_) => SessionError::Internal(detail),
        // Everything else on the connection stream means the wire is bad.
        _ => SessionError::Transport(detail),
    }
}

fn spawn_heartbeat(
    sender: mpsc::Sender<PendingCommand>,
    alive: Arc<AtomicBool>,
    cadence: Duration,
    deadline: Duration,
) -> Option<JoinHandle<()>> {
    if cadence.as_millis() == 0 {
        return None;
    }

    let response_deadline = deadline.min(Duration::from_secs(5));

    Some(tokio::spawn(async move {
        let mut ticker = interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;
            if !alive.load(Ordering::Relaxed) {
                break;
            }

            let (resp_tx, resp_rx) = oneshot::channel();
            let probe = PendingCommand {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".to_string(),
                params: Value::Object(Default::default()),
                responder: resp_tx,
            };

            if sender.send(probe).await.is_err() {
                debug!(target: "cdp", "heartbeat send failed (channel closed)");
                break;
            }

            match tokio::time::timeout(response_deadline, resp_rx).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp", %err, "heartbeat command error");
                    alive.store(false, Ordering::Relaxed);
                    break;
                }
                Ok(Err(_)) | Err(_) => {
                    warn!(target: "cdp", "heartbeat lost; marking transport dead");
                    alive.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }))
}

impl Drop for ChromiumTransport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }

        if let Ok(mut guard) = self.browser.try_lock() {
            if let Some(launched) = guard.take() {
                kill_child(launched.child);
            }
        }
    }
}

fn kill_child(mut child: Child) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(err) = child.kill().await {
                warn!(target: "cdp", %err, "failed to kill browser child");
            }
        });
    } else {
        debug!(target: "cdp", "no runtime available to kill browser child");
    }
}

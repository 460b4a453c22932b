use crate::config::{ClientConfig, HeartbeatPolicy, ReconnectPolicy};
use crate::dispatcher::{ConnectionEvent, Dispatch, DispatchSender};
use crate::subscriptions::SubscriptionRegistry;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use pulse_core::wire::{decode_frame, encode_frame, ControlMsg, PingPayload, ServerMsg};
use pulse_core::EntityKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Disconnected => "disconnected",
            ReadyState::Connecting => "connecting",
            ReadyState::Connected => "connected",
            ReadyState::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub ready_state: ReadyState,
    pub reconnect_attempts: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("websocket connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection closed before the handshake completed")]
    Aborted,
}

#[derive(Debug)]
struct LinkState {
    ready_state: ReadyState,
    reconnect_attempts: u32,
    last_heartbeat: Option<DateTime<Utc>>,
}

struct Shared {
    ws_url: Url,
    max_frame_bytes: usize,
    reconnect: ReconnectPolicy,
    heartbeat: HeartbeatPolicy,
    events: DispatchSender,
    link: Mutex<LinkState>,
    registry: Mutex<SubscriptionRegistry>,
    outbound_tx: mpsc::UnboundedSender<ControlMsg>,
    outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<ControlMsg>>,
    shutdown: watch::Sender<bool>,
    /// Set by the link task, under the registry lock, once it has decided to
    /// exit for lack of subscribers.
    retiring: AtomicBool,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_ready_state(&self, ready_state: ReadyState) {
        self.link().ready_state = ready_state;
    }

    fn mark_connected(&self) {
        let mut link = self.link();
        link.ready_state = ReadyState::Connected;
        link.reconnect_attempts = 0;
        link.last_heartbeat = Some(Utc::now());
    }

    fn mark_reconnecting(&self, attempt: u32) {
        let mut link = self.link();
        link.ready_state = ReadyState::Reconnecting;
        link.reconnect_attempts = attempt;
    }

    fn touch_heartbeat(&self) {
        self.link().last_heartbeat = Some(Utc::now());
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn should_retry(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let registry = self.registry();
        if registry.is_empty() {
            self.retiring.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    async fn emit(&self, dispatch: Dispatch) {
        if self.events.send(dispatch).await.is_err() {
            debug!(event = "pulse_dispatch_closed");
        }
    }
}

/// Owns the single websocket to the backend. Cloning shares the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig, events: DispatchSender) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                ws_url: config.ws_url.clone(),
                max_frame_bytes: config.max_frame_bytes,
                reconnect: config.reconnect,
                heartbeat: config.heartbeat,
                events,
                link: Mutex::new(LinkState {
                    ready_state: ReadyState::Disconnected,
                    reconnect_attempts: 0,
                    last_heartbeat: None,
                }),
                registry: Mutex::new(SubscriptionRegistry::new()),
                outbound_tx,
                outbound_rx: AsyncMutex::new(outbound_rx),
                shutdown,
                retiring: AtomicBool::new(false),
                task: AsyncMutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let link = self.shared.link();
        ConnectionStatus {
            is_connected: link.ready_state == ReadyState::Connected,
            ready_state: link.ready_state,
            reconnect_attempts: link.reconnect_attempts,
            last_heartbeat: link.last_heartbeat,
        }
    }

    /// Starts the connection task and waits for its first handshake. A no-op
    /// while a task is already connecting, connected or reconnecting; a task
    /// that is on its way out is joined and replaced.
    pub async fn connect(&self) -> Result<(), ConnError> {
        let ready_rx = {
            let mut task = self.shared.task.lock().await;
            let live = task.as_ref().is_some_and(|handle| !handle.is_finished());
            if live && !self.shared.retiring.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(handle) = task.take() {
                if let Err(err) = handle.await {
                    warn!(event = "pulse_link_join_error", error = %err);
                }
            }
            self.shared.retiring.store(false, Ordering::SeqCst);
            self.shared.shutdown.send_replace(false);
            self.shared.set_ready_state(ReadyState::Connecting);
            let (ready_tx, ready_rx) = oneshot::channel();
            *task = Some(tokio::spawn(run_link(self.shared.clone(), ready_tx)));
            ready_rx
        };
        ready_rx.await.unwrap_or(Err(ConnError::Aborted))
    }

    /// Stops the connection task, aborting any handshake or backoff sleep.
    pub async fn disconnect(&self) {
        let mut task = self.shared.task.lock().await;
        self.stop_task(&mut task).await;
    }

    /// Tears the link down only if nothing subscribed while the task lock
    /// was being acquired.
    async fn disconnect_if_idle(&self) {
        let mut task = self.shared.task.lock().await;
        if !self.shared.registry().is_empty() {
            debug!(event = "pulse_teardown_skipped");
            return;
        }
        self.stop_task(&mut task).await;
    }

    async fn stop_task(&self, task: &mut Option<JoinHandle<()>>) {
        self.shared.shutdown.send_replace(true);
        if let Some(handle) = task.take() {
            if let Err(err) = handle.await {
                warn!(event = "pulse_link_join_error", error = %err);
            }
        }
        self.shared.set_ready_state(ReadyState::Disconnected);
    }

    /// Registers interest and makes sure the link is up. The subscription
    /// stays registered even if the first handshake fails.
    pub async fn subscribe(&self, kind: EntityKind, id: &str) -> Result<(), ConnError> {
        let msg = self.shared.registry().subscribe(kind, id);
        if let Some(msg) = msg {
            info!(event = "pulse_subscribe", kind = kind.as_str(), id);
            let _ = self.shared.outbound_tx.send(msg);
        }
        self.connect().await
    }

    /// Drops one reference; the link is torn down with the last one.
    pub async fn unsubscribe(&self, kind: EntityKind, id: &str) {
        let (msg, now_empty) = {
            let mut registry = self.shared.registry();
            let msg = registry.unsubscribe(kind, id);
            (msg, registry.is_empty())
        };
        let Some(msg) = msg else {
            return;
        };
        info!(event = "pulse_unsubscribe", kind = kind.as_str(), id);
        let _ = self.shared.outbound_tx.send(msg);
        if now_empty {
            self.disconnect_if_idle().await;
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn covers_post(&self, post_id: &str) -> bool {
        self.shared.registry().covers_post(post_id)
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

async fn run_link(shared: Arc<Shared>, ready: oneshot::Sender<Result<(), ConnError>>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;

    loop {
        if shared.is_shutting_down() {
            break;
        }
        let connect = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            result = connect_async(shared.ws_url.as_str()) => result,
        };

        match connect {
            Ok((ws, _)) => {
                attempt = 0;
                shared.mark_connected();
                info!(event = "pulse_connected", url = %shared.ws_url);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                shared.emit(Dispatch::Connection(ConnectionEvent::Connected)).await;

                match run_session(&shared, ws, &mut shutdown).await {
                    SessionEnd::Shutdown => {
                        shared.set_ready_state(ReadyState::Disconnected);
                        info!(event = "pulse_disconnected", reason = "client");
                        shared
                            .emit(Dispatch::Connection(ConnectionEvent::Disconnected {
                                reason: "client disconnect".to_string(),
                                will_retry: false,
                            }))
                            .await;
                        break;
                    }
                    SessionEnd::Lost(reason) => {
                        let will_retry = shared.should_retry();
                        shared.set_ready_state(ReadyState::Disconnected);
                        warn!(event = "pulse_connection_lost", reason = %reason, will_retry);
                        shared
                            .emit(Dispatch::Connection(ConnectionEvent::Disconnected {
                                reason,
                                will_retry,
                            }))
                            .await;
                        if !will_retry {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(event = "pulse_connect_error", url = %shared.ws_url, error = %err);
                let reason = err.to_string();
                shared
                    .emit(Dispatch::Connection(ConnectionEvent::Error {
                        message: reason.clone(),
                    }))
                    .await;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(ConnError::Connect {
                        url: shared.ws_url.to_string(),
                        reason,
                    }));
                }
                if !shared.should_retry() {
                    break;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        shared.mark_reconnecting(attempt);
        let delay = shared.reconnect.delay_for(attempt);
        debug!(
            event = "pulse_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_ready_state(ReadyState::Disconnected);
    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(ConnError::Aborted));
    }
}

async fn run_session(
    shared: &Shared,
    mut ws: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut outbound = shared.outbound_rx.lock().await;
    // Frames queued while offline are superseded by the active set below.
    while outbound.try_recv().is_ok() {}

    let active = shared.registry().active_messages();
    for msg in &active {
        if let Err(reason) = send_control(&mut ws, msg, shared.max_frame_bytes).await {
            return SessionEnd::Lost(reason);
        }
    }
    if !active.is_empty() {
        debug!(event = "pulse_resubscribed", count = active.len());
    }

    let ping_interval = shared.heartbeat.ping_interval();
    let timeout = shared.heartbeat.timeout();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = stopped(shutdown) => {
                while let Ok(msg) = outbound.try_recv() {
                    let _ = send_control(&mut ws, &msg, shared.max_frame_bytes).await;
                }
                let _ = ws.close(None).await;
                return SessionEnd::Shutdown;
            }
            incoming = ws.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                };
                deadline = Instant::now() + timeout;
                shared.touch_heartbeat();
                match msg {
                    Message::Text(text) => {
                        if let Some(reply) = handle_frame(shared, &text).await {
                            if let Err(reason) = send_control(&mut ws, &reply, shared.max_frame_bytes).await {
                                return SessionEnd::Lost(reason);
                            }
                        }
                    }
                    Message::Close(_) => return SessionEnd::Lost("closed by server".to_string()),
                    _ => {}
                }
            }
            Some(msg) = outbound.recv() => {
                if let Err(reason) = send_control(&mut ws, &msg, shared.max_frame_bytes).await {
                    return SessionEnd::Lost(reason);
                }
            }
            _ = ping.tick() => {
                let frame = ControlMsg::Ping(PingPayload {
                    timestamp: Utc::now().timestamp_millis(),
                });
                if let Err(reason) = send_control(&mut ws, &frame, shared.max_frame_bytes).await {
                    return SessionEnd::Lost(reason);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(event = "pulse_heartbeat_timeout", timeout_ms = timeout.as_millis() as u64);
                let _ = ws.close(None).await;
                return SessionEnd::Lost("heartbeat timeout".to_string());
            }
        }
    }
}

async fn send_control(ws: &mut WsStream, msg: &ControlMsg, max_frame_bytes: usize) -> Result<(), String> {
    let frame = match encode_frame(msg, max_frame_bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "pulse_encode_error", error = %err);
            return Ok(());
        }
    };
    ws.send(Message::Text(frame)).await.map_err(|err| err.to_string())
}

/// Returns the reply to send back, if any.
async fn handle_frame(shared: &Shared, text: &str) -> Option<ControlMsg> {
    let msg = match decode_frame::<ServerMsg>(text, shared.max_frame_bytes) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(event = "pulse_decode_error", error = %err);
            return None;
        }
    };
    match msg {
        ServerMsg::Ping(payload) => return Some(ControlMsg::Pong(payload)),
        ServerMsg::Pong(_) => return None,
        ServerMsg::Subscribed(target) => {
            debug!(event = "pulse_subscribed_ack", target = ?target.entity());
            return None;
        }
        _ => {}
    }
    let event = msg.into_domain_event()?;
    if let Some(post_id) = event.post_id() {
        let covered = shared.registry().covers_post(post_id);
        if !covered {
            debug!(event = "pulse_event_filtered", kind = event.name(), post_id);
            return None;
        }
    }
    shared.emit(Dispatch::Domain(event)).await;
    None
}

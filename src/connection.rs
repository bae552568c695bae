use crate::bus::{ClientEvent, EventBus};
use crate::config::Settings;
use crate::entity::Id;
use crate::error::{Error, Result};
use crate::protocol::Envelope;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// An open transport: text frames out, text frames in. The link is closed once
/// `inbound` yields `None`.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link, returning once the remote end confirmed the connection.
    async fn open(&self, url: &Url) -> Result<Link>;
}

/// WebSocket transport with one writer task and one reader task per link.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Link> {
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut rx_outbound) = mpsc::unbounded_channel::<String>();
        let (tx_inbound, inbound) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = rx_outbound.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!("Failed to write frame: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Socket writer task finished");
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        if tx_inbound.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Socket read error: {}", e);
                        break;
                    }
                }
            }
            debug!("Socket reader task finished");
        });

        Ok(Link { outbound, inbound })
    }
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Snapshot of the logical session behind the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: Option<Id>,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

/// The single persistent connection of one logged-in user.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    handlers: Mutex<HashMap<String, Handler>>,
    link: Mutex<LinkState>,
}

struct LinkState {
    user_id: Option<Id>,
    state: ConnectionState,
    attempts: u32,
    outbound: Option<mpsc::UnboundedSender<String>>,
    supervisor: Option<JoinHandle<()>>,
    // Bumped on every connect/disconnect so a superseded supervisor cannot touch state.
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                bus,
                handlers: Mutex::new(HashMap::new()),
                link: Mutex::new(LinkState {
                    user_id: None,
                    state: ConnectionState::Closed,
                    attempts: 0,
                    outbound: None,
                    supervisor: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Open the connection for `user_id` and wait for the first outcome.
    ///
    /// Returns `Open` on success, `Connecting` when the first attempt failed and the
    /// reconnect loop took over, or `Closed` if no connection can be attempted at all.
    pub async fn connect(&self, user_id: &Id) -> ConnectionState {
        let url = match self.inner.settings.socket_url(user_id) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot connect: {}", e);
                return ConnectionState::Closed;
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut link = lock(&self.inner.link);
            if link.supervisor.is_some()
                && link.state != ConnectionState::Closed
                && link.user_id.as_ref() == Some(user_id)
            {
                debug!("Connection for {} already active", user_id);
                return link.state;
            }
            if let Some(old) = link.supervisor.take() {
                old.abort();
            }
            link.generation += 1;
            link.user_id = Some(user_id.clone());
            link.attempts = 0;
            link.outbound = None;
            if std::mem::replace(&mut link.state, ConnectionState::Connecting)
                != ConnectionState::Connecting
            {
                self.inner
                    .bus
                    .publish(ClientEvent::ConnectionChanged(ConnectionState::Connecting));
            }
            let generation = link.generation;

            info!("Connecting to {}", url);
            let inner = self.inner.clone();
            link.supervisor = Some(tokio::spawn(supervise(inner, url, generation, ready_tx)));
        }

        match ready_rx.await {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Register the handler for `frame_type`, replacing any previous one.
    pub fn on_message<F>(&self, frame_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let frame_type = frame_type.into();
        if lock(&self.inner.handlers)
            .insert(frame_type.clone(), Arc::new(handler))
            .is_some()
        {
            debug!("Replaced handler for `{}` frames", frame_type);
        }
    }

    pub fn off_message(&self, frame_type: &str) {
        lock(&self.inner.handlers).remove(frame_type);
    }

    /// Fire-and-forget. Dropped when the connection is not open; there is no queue.
    pub fn send<T: Serialize>(&self, frame_type: &str, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize `{}` frame: {}", frame_type, e);
                return;
            }
        };
        let text = match serde_json::to_string(&Envelope::new(frame_type, data)) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize `{}` frame: {}", frame_type, e);
                return;
            }
        };

        let link = lock(&self.inner.link);
        match (&link.outbound, link.state) {
            (Some(outbound), ConnectionState::Open) => {
                if outbound.send(text).is_err() {
                    debug!("Link closed, dropped `{}` frame", frame_type);
                }
            }
            _ => debug!("Not connected, dropped `{}` frame", frame_type),
        }
    }

    /// Close the transport, forget all handlers and stop reconnecting.
    pub fn disconnect(&self) {
        let supervisor = {
            let mut link = lock(&self.inner.link);
            link.generation += 1;
            link.outbound = None;
            link.attempts = 0;
            link.supervisor.take()
        };
        if let Some(task) = supervisor {
            task.abort();
            info!("Disconnected");
        }
        lock(&self.inner.handlers).clear();
        self.inner.set_state(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn session(&self) -> SessionInfo {
        let link = lock(&self.inner.link);
        SessionInfo {
            user_id: link.user_id.clone(),
            state: link.state,
            reconnect_attempts: link.attempts,
        }
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut link = lock(&self.link);
            std::mem::replace(&mut link.state, state) != state
        };
        if changed {
            self.bus.publish(ClientEvent::ConnectionChanged(state));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.link).generation == generation
    }

    fn opened(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        {
            let mut link = lock(&self.link);
            if link.generation != generation {
                return false;
            }
            link.outbound = Some(outbound);
            link.attempts = 0;
        }
        self.set_state(ConnectionState::Open);
        true
    }

    /// Count one more reconnect attempt and return its delay, or `None` after the cap.
    fn next_attempt(&self, generation: u64) -> Option<(u32, std::time::Duration)> {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return None;
        }
        link.outbound = None;
        link.attempts += 1;
        let attempt = link.attempts;
        self.settings
            .timings
            .reconnect_delay(attempt)
            .map(|delay| (attempt, delay))
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };
        let handler = lock(&self.handlers).get(&envelope.frame_type).cloned();
        match handler {
            Some(handler) => handler(&envelope.data),
            None => debug!("No handler for `{}` frame", envelope.frame_type),
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    url: Url,
    generation: u64,
    ready: oneshot::Sender<ConnectionState>,
) {
    let mut ready = Some(ready);
    let mut report = |state: ConnectionState| {
        if let Some(tx) = ready.take() {
            let _ = tx.send(state);
        }
    };

    loop {
        match inner.connector.open(&url).await {
            Ok(Link {
                outbound,
                mut inbound,
            }) => {
                if !inner.opened(generation, outbound) {
                    return;
                }
                info!("Connection open");
                report(ConnectionState::Open);

                // Frames are handled one at a time, in arrival order.
                while let Some(text) = inbound.recv().await {
                    inner.dispatch(&text);
                }
                if !inner.is_current(generation) {
                    return;
                }
                warn!("Connection closed unexpectedly");
            }
            Err(e) => warn!("Failed to open connection: {}", e),
        }

        if !inner.is_current(generation) {
            return;
        }
        match inner.next_attempt(generation) {
            Some((attempt, delay)) => {
                inner.set_state(ConnectionState::Connecting);
                report(ConnectionState::Connecting);
                info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay, attempt, inner.settings.timings.max_reconnect_attempts
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                if inner.is_current(generation) {
                    error!(
                        "Giving up after {} reconnect attempts",
                        inner.settings.timings.max_reconnect_attempts
                    );
                    inner.set_state(ConnectionState::Closed);
                }
                report(ConnectionState::Closed);
                return;
            }
        }
    }
}

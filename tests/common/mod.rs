// Shared fakes for the integration tests: a scripted transport and an in-memory REST API.
#![allow(dead_code)]

use async_trait::async_trait;
use marketlink::api::{DeliveryChannel, NotificationDto, RestApi};
use marketlink::connection::{Connector, Link};
use marketlink::entity::{Id, Identity, Role};
use marketlink::error::{Error, Result};
use marketlink::notification::NotificationPreferences;
use marketlink::protocol::{ChatDto, Envelope, MessageDto};
use marketlink::{Session, Settings, Timings};
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

static INIT_LOGGER: Once = Once::new();

pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Let spawned tasks (the connection supervisor, ack tasks) catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub fn settings() -> Settings {
    Settings::new("http://api.marketlink.test").unwrap()
}

pub fn settings_with(timings: Timings) -> Settings {
    let mut settings = settings();
    settings.timings = timings;
    settings
}

pub fn customer(id: &str) -> Identity {
    Identity::new(id, format!("Customer {}", id), Role::Customer)
}

pub fn provider(id: &str) -> Identity {
    Identity::new(id, format!("Provider {}", id), Role::Provider)
}

// -----------------------------------------------------------------------------
// Transport
// -----------------------------------------------------------------------------

/// The far end of one link handed out by `MockConnector`.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn push(&self, frame_type: &str, data: Value) {
        let text = serde_json::to_string(&Envelope::new(frame_type, data)).unwrap();
        self.to_client.send(text).unwrap();
    }

    pub fn push_raw(&self, text: &str) {
        self.to_client.send(text.to_string()).unwrap();
    }

    /// Close the link from the server side but keep listening to what the
    /// client still writes.
    pub fn hang_up(self) -> mpsc::UnboundedReceiver<String> {
        self.from_client
    }

    /// Every frame the client wrote so far.
    pub fn received(&mut self) -> Vec<Envelope> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(Envelope::parse(&text).unwrap());
        }
        frames
    }

    pub fn received_of(&mut self, frame_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|f| f.frame_type == frame_type)
            .map(|f| f.data)
            .collect()
    }
}

/// Connector whose open attempts succeed or fail from a script.
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<bool>>,
    refuse_by_default: Mutex<bool>,
    attempts: Mutex<Vec<(Instant, Url)>>,
    servers: Mutex<VecDeque<ServerEnd>>,
}

impl MockConnector {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let connector = Self::default();
        *connector.refuse_by_default.lock().unwrap() = true;
        Arc::new(connector)
    }

    /// Outcomes for the next attempts, `true` meaning accept.
    pub fn script(&self, outcomes: &[bool]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.attempts.lock().unwrap().iter().map(|(_, url)| url.clone()).collect()
    }

    /// Gaps between consecutive open attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        self.attempts()
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect()
    }

    /// Server end of the most recent accepted link.
    pub fn server(&self) -> ServerEnd {
        self.servers
            .lock()
            .unwrap()
            .pop_back()
            .expect("no link was accepted")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> Result<Link> {
        self.attempts.lock().unwrap().push((Instant::now(), url.clone()));
        let accept = match self.script.lock().unwrap().pop_front() {
            Some(accept) => accept,
            None => !*self.refuse_by_default.lock().unwrap(),
        };
        if !accept {
            return Err(Error::Connection("connection refused".into()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.servers.lock().unwrap().push_back(ServerEnd {
            to_client,
            from_client,
        });
        Ok(Link { outbound, inbound })
    }
}

// -----------------------------------------------------------------------------
// REST
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeApi {
    pub chats: Mutex<Vec<ChatDto>>,
    pub history: Mutex<HashMap<Id, Vec<MessageDto>>>,
    pub pending: Mutex<Vec<NotificationDto>>,
    pub prefs: Mutex<NotificationPreferences>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    history_gate: Mutex<Option<Arc<Notify>>>,
    delivered_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call to `endpoint` fail with a 500.
    pub fn fail(&self, endpoint: &'static str) {
        self.failing.lock().unwrap().insert(endpoint);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// History requests block until the returned handle is notified.
    pub fn hold_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.history_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Delivery acks block until the returned handle is notified.
    pub fn hold_delivered(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.delivered_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn record(&self, endpoint: &'static str, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(endpoint) {
            return Err(Error::Status {
                endpoint: endpoint.to_string(),
                status: 500,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RestApi for FakeApi {
    async fn list_chats(&self) -> Result<Vec<ChatDto>> {
        self.record("chats", "chats".into())?;
        Ok(self.chats.lock().unwrap().clone())
    }

    async fn chat_messages(&self, chat_id: &Id) -> Result<Vec<MessageDto>> {
        let gate = self.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record("history", format!("history:{}", chat_id))?;
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<NotificationDto>> {
        self.record("pending", format!("pending:{}", limit))?;
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn ack_delivered(&self, id: &Id, channel: DeliveryChannel) -> Result<()> {
        let gate = self.delivered_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let channel = match channel {
            DeliveryChannel::Pull => "pull",
            DeliveryChannel::Push => "push",
        };
        self.record("delivered", format!("delivered:{}:{}", id, channel))
    }

    async fn ack_seen(&self, id: &Id) -> Result<()> {
        self.record("seen", format!("seen:{}", id))
    }

    async fn ack_chat_seen(&self, chat_id: &Id) -> Result<()> {
        self.record("chat_seen", format!("chat_seen:{}", chat_id))
    }

    async fn preferences(&self) -> Result<NotificationPreferences> {
        self.record("preferences", "preferences".into())?;
        Ok(self.prefs.lock().unwrap().clone())
    }

    async fn save_preferences(&self, prefs: &NotificationPreferences) -> Result<()> {
        self.record("save_preferences", "save_preferences".into())?;
        *self.prefs.lock().unwrap() = prefs.clone();
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Payload builders
// -----------------------------------------------------------------------------

pub fn chat_json(id: &str, customer: &str, provider: &str) -> Value {
    json!({
        "id": id,
        "customerId": customer,
        "providerId": provider,
        "customerName": format!("Customer {}", customer),
        "providerName": format!("Provider {}", provider),
    })
}

pub fn chat_dto(id: &str, customer: &str, provider: &str) -> ChatDto {
    serde_json::from_value(chat_json(id, customer, provider)).unwrap()
}

pub fn message_json(id: u64, chat: &str, sender: &str, content: &str) -> Value {
    json!({
        "id": id,
        "chatId": chat,
        "senderId": sender,
        "senderName": format!("User {}", sender),
        "content": content,
    })
}

pub fn message_dto(id: u64, chat: &str, sender: &str, content: &str) -> MessageDto {
    serde_json::from_value(message_json(id, chat, sender, content)).unwrap()
}

pub fn notification_dto(id: u64, kind: &str, body: &str) -> NotificationDto {
    serde_json::from_value(json!({
        "id": id,
        "type": kind,
        "status": "pending",
        "message": body,
    }))
    .unwrap()
}

// -----------------------------------------------------------------------------
// Sessions
// -----------------------------------------------------------------------------

pub struct Harness {
    pub session: Session,
    pub api: Arc<FakeApi>,
    pub connector: Arc<MockConnector>,
}

impl Harness {
    pub fn new(identity: Identity) -> Self {
        Self::with(identity, FakeApi::new(), MockConnector::accepting())
    }

    pub fn with(identity: Identity, api: Arc<FakeApi>, connector: Arc<MockConnector>) -> Self {
        setup_logging();
        let session = Session::new(settings(), identity, api.clone(), connector.clone());
        Self {
            session,
            api,
            connector,
        }
    }

    /// Start the session and return the server end of its link.
    pub async fn start(&self) -> ServerEnd {
        self.session.start().await.unwrap();
        self.connector.server()
    }
}

use crate::connection::ConnectionState;
use crate::entity::Id;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Observable changes of the client state, for whatever renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// Soft connectivity indicator
    ConnectionChanged(ConnectionState),

    /// The room list changed (load, insert, unread counter)
    ChatsUpdated,

    /// A room created while connected received its server id
    ChatIdResolved { temporary: Id, id: Id },

    MessageAppended { chat_id: Id, message_id: Id },

    MessagesRead { chat_id: Id, count: usize },

    NotificationAdded { id: Id },

    NotificationRemoved { id: Id },

    PresenceChanged { user_id: Id, online: bool },

    /// Platform-native alert; alerts sharing a tag replace each other
    Alert {
        tag: String,
        title: String,
        body: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// The bus as a stream. Lagged gaps are skipped; the stream ends with the bus.
    pub fn stream(&self) -> impl Stream<Item = ClientEvent> {
        let mut rx = self.tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event stream lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

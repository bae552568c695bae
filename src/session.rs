use crate::api::RestApi;
use crate::bus::EventBus;
use crate::chat::{ChatMessage, ChatRoom};
use crate::config::Settings;
use crate::connection::{ConnectionManager, ConnectionState, Connector};
use crate::entity::Identity;
use crate::error::Result;
use crate::notification::{NotificationCenter, NotificationKind};
use crate::presence::PresenceTracker;
use crate::protocol::{
    decode, frame, ChatCreated, ChatMessagePushed, MessageRead, OnlineUsers, PresenceUpdate,
    RequestActivity,
};
use crate::store::ChatStore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything one logged-in user needs: the connection and the three stores that
/// consume it. Sessions share nothing, so several can run side by side.
pub struct Session {
    identity: Identity,
    bus: EventBus,
    conn: ConnectionManager,
    chats: ChatStore,
    notifications: NotificationCenter,
    presence: PresenceTracker,
}

impl Session {
    pub fn new(
        settings: Settings,
        identity: Identity,
        api: Arc<dyn RestApi>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let bus = EventBus::new();
        let timings = settings.timings.clone();
        let conn = ConnectionManager::new(settings, connector, bus.clone());
        let me = identity.user_id.clone();

        Self {
            chats: ChatStore::new(me.clone(), conn.clone(), api.clone(), bus.clone()),
            notifications: NotificationCenter::new(
                me,
                api,
                bus.clone(),
                timings.notification_expiry,
                timings.pending_pull_limit,
            ),
            presence: PresenceTracker::new(identity.clone(), conn.clone(), bus.clone(), &timings),
            identity,
            bus,
            conn,
        }
    }

    /// Register handlers, connect, and run the initial loads. Only a failed chat
    /// load is reported; the connection retries on its own and a failed pull
    /// heals on the next foreground.
    pub async fn start(&self) -> Result<ConnectionState> {
        info!("Starting session for {}", self.identity);
        self.register_handlers();

        let state = self.conn.connect(&self.identity.user_id).await;
        if state != ConnectionState::Open {
            warn!("Connection not open yet ({:?}), continuing offline", state);
        }
        self.presence.start();

        if let Err(e) = self.notifications.pull().await {
            warn!("Initial notification pull failed: {}", e);
        }
        self.chats.load_chats().await?;
        Ok(state)
    }

    /// The application regained foreground visibility.
    pub async fn on_foreground(&self) {
        if let Err(e) = self.notifications.pull().await {
            warn!("Notification pull failed: {}", e);
        }
    }

    /// Tear down timers and the connection.
    pub fn shutdown(&self) {
        info!("Shutting down session for {}", self.identity);
        self.presence.stop();
        self.notifications.clear();
        self.conn.disconnect();
    }

    /// One handler per frame type; frames several stores care about fan out here.
    fn register_handlers(&self) {
        let chats = self.chats.clone();
        let notifications = self.notifications.clone();
        self.on::<ChatCreated, _>(frame::CHAT_CREATED, move |event| {
            // Rooms we asked for ourselves are not news.
            if !chats.awaiting_creation(&event.chat.customer_id, &event.chat.provider_id) {
                notifications.on_chat_created(&event);
            }
            chats.handle_chat_created(ChatRoom::from(event.chat));
        });

        let chats = self.chats.clone();
        let notifications = self.notifications.clone();
        self.on::<ChatMessagePushed, _>(frame::CHAT_MESSAGE, move |pushed| {
            notifications.on_chat_message(&pushed);
            chats.handle_chat_message(ChatMessage::from(pushed.message));
        });

        let chats = self.chats.clone();
        self.on::<MessageRead, _>(frame::MESSAGE_READ, move |receipt| {
            chats.handle_message_read(receipt);
        });

        let presence = self.presence.clone();
        self.on::<PresenceUpdate, _>(frame::USER_ONLINE, move |update| {
            presence.handle_online(update)
        });
        let presence = self.presence.clone();
        self.on::<PresenceUpdate, _>(frame::USER_OFFLINE, move |update| {
            presence.handle_offline(update)
        });
        let presence = self.presence.clone();
        self.on::<PresenceUpdate, _>(frame::USER_ACTIVITY, move |update| {
            presence.handle_activity(update)
        });
        let presence = self.presence.clone();
        self.on::<OnlineUsers, _>(frame::ONLINE_USERS_LIST, move |users| {
            presence.handle_snapshot(users.into_users())
        });

        for (frame_type, kind) in [
            (frame::JOB_ASSIGNED, NotificationKind::JobAssigned),
            (frame::JOB_COMPLETED, NotificationKind::JobCompleted),
            (frame::NEW_SERVICE_REQUEST, NotificationKind::Request),
            (frame::REQUEST_STATUS_UPDATED, NotificationKind::StatusUpdate),
        ] {
            let notifications = self.notifications.clone();
            self.on::<RequestActivity, _>(frame_type, move |event| {
                notifications.on_request_activity(kind, &event);
            });
        }
    }

    fn on<T, F>(&self, frame_type: &'static str, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.conn.on_message(frame_type, move |data: &Value| {
            match decode::<T>(frame_type, data) {
                Ok(payload) => handler(payload),
                Err(e) => warn!("Dropping frame: {}", e),
            }
        });
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn chats(&self) -> &ChatStore {
        &self.chats
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }
}

//! Wire format of the persistent connection: `{type, data}` envelopes and the typed
//! payload of every frame the client sends or consumes.

use crate::chat::{DeliveryState, MessageKind};
use crate::entity::Id;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod frame {
    pub const CHAT_CREATED: &str = "chat_created";
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const MESSAGE_READ: &str = "message_read";
    pub const USER_ONLINE: &str = "user_online";
    pub const USER_OFFLINE: &str = "user_offline";
    pub const USER_ACTIVITY: &str = "user_activity";
    pub const ONLINE_USERS_LIST: &str = "online_users_list";
    pub const JOB_ASSIGNED: &str = "job_assigned";
    pub const JOB_COMPLETED: &str = "job_completed";
    pub const NEW_SERVICE_REQUEST: &str = "new_service_request";
    pub const REQUEST_STATUS_UPDATED: &str = "request_status_updated";

    pub const CREATE_CHAT: &str = "create_chat";
    pub const HEARTBEAT: &str = "heartbeat";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(frame_type: impl Into<String>, data: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
        }
    }

    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Decode a frame payload, tagging failures with the frame type.
pub fn decode<T: DeserializeOwned>(frame_type: &str, data: &Value) -> Result<T> {
    T::deserialize(data).map_err(|source| Error::Protocol {
        frame: frame_type.to_string(),
        source,
    })
}

// -----------------------------------------------------------------------------
// Shapes shared with the REST API
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDto {
    pub id: Id,
    pub customer_id: Id,
    pub provider_id: Id,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub provider_phone: Option<String>,
    #[serde(default)]
    pub last_message: Option<MessageDto>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: Id,
    pub chat_id: Id,
    pub sender_id: Id,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, alias = "createdAt")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub status: Option<DeliveryState>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// Inbound payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCreated {
    #[serde(flatten)]
    pub chat: ChatDto,
    #[serde(default)]
    pub notification_id: Option<Id>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePushed {
    #[serde(flatten)]
    pub message: MessageDto,
    #[serde(default)]
    pub notification_id: Option<Id>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub chat_id: Id,
    #[serde(alias = "readBy")]
    pub reader_id: Id,
    /// Highest message id covered by the receipt; absent means every message.
    #[serde(default, alias = "messageId")]
    pub up_to_message_id: Option<Id>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: Id,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, alias = "lastSeen")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OnlineUsers {
    List(Vec<PresenceUpdate>),
    Wrapped { users: Vec<PresenceUpdate> },
}

impl OnlineUsers {
    pub fn into_users(self) -> Vec<PresenceUpdate> {
        match self {
            OnlineUsers::List(users) | OnlineUsers::Wrapped { users } => users,
        }
    }
}

/// Payload of job and service-request frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestActivity {
    #[serde(default, alias = "jobId")]
    pub request_id: Option<Id>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sender_id: Option<Id>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub notification_id: Option<Id>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// Outbound payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub chat_id: Id,
    pub sender_id: Id,
    pub content: String,
    pub message_type: MessageKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChat {
    pub customer_id: Id,
    pub provider_id: Id,
}

/// Heartbeat and activity signals share one shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Liveness {
    pub user_id: Id,
    pub timestamp: DateTime<Utc>,
}

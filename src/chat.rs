use crate::entity::Id;
use crate::protocol::{ChatDto, MessageDto};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Id,
    pub chat_id: Id,
    pub sender_id: Id,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub state: DeliveryState,
    pub read_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Message composed while disconnected; it only exists on this client.
    pub fn local(chat_id: Id, sender_id: Id, content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Id::local(),
            chat_id,
            sender_id,
            content: content.into(),
            timestamp: Utc::now(),
            kind,
            state: DeliveryState::Sent,
            read_at: None,
        }
    }

    /// Whether a read receipt bounded by `bound` covers this message.
    pub fn covered_by(&self, bound: Option<&Id>) -> bool {
        match bound {
            None => true,
            Some(bound) => match (self.id.numeric(), bound.numeric()) {
                (Some(id), Some(bound)) => id <= bound,
                _ => self.id == *bound,
            },
        }
    }
}

impl From<MessageDto> for ChatMessage {
    fn from(dto: MessageDto) -> Self {
        Self {
            id: dto.id,
            chat_id: dto.chat_id,
            sender_id: dto.sender_id,
            content: dto.content,
            timestamp: dto.timestamp.unwrap_or_else(Utc::now),
            kind: dto.message_type,
            state: dto.status.unwrap_or(DeliveryState::Delivered),
            read_at: dto.read_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Id,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl Participant {
    pub fn new(id: Id, name: Option<String>) -> Self {
        Self {
            id,
            name,
            phone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: Id,
    pub customer: Participant,
    pub provider: Participant,
    pub last_message: Option<ChatMessage>,
    pub unread: u32,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn new(id: Id, customer: Participant, provider: Participant) -> Self {
        Self {
            id,
            customer,
            provider,
            last_message: None,
            unread: 0,
            created_at: Utc::now(),
        }
    }

    /// Unordered match on the two participant ids.
    pub fn joins(&self, a: &Id, b: &Id) -> bool {
        same_pair((&self.customer.id, &self.provider.id), (a, b))
    }

    pub fn counterpart(&self, me: &Id) -> &Participant {
        if self.customer.id == *me {
            &self.provider
        } else {
            &self.customer
        }
    }
}

pub(crate) fn same_pair(x: (&Id, &Id), y: (&Id, &Id)) -> bool {
    (x.0 == y.0 && x.1 == y.1) || (x.0 == y.1 && x.1 == y.0)
}

impl From<ChatDto> for ChatRoom {
    fn from(dto: ChatDto) -> Self {
        Self {
            id: dto.id,
            customer: Participant {
                id: dto.customer_id,
                name: dto.customer_name,
                phone: dto.customer_phone,
            },
            provider: Participant {
                id: dto.provider_id,
                name: dto.provider_name,
                phone: dto.provider_phone,
            },
            last_message: dto.last_message.map(ChatMessage::from),
            unread: dto.unread_count,
            created_at: dto.created_at.unwrap_or_else(Utc::now),
        }
    }
}

use crate::api::RestApi;
use crate::bus::{ClientEvent, EventBus};
use crate::chat::{same_pair, ChatMessage, ChatRoom, DeliveryState, MessageKind, Participant};
use crate::connection::ConnectionManager;
use crate::entity::Id;
use crate::error::Result;
use crate::protocol::{frame, CreateChat, MessageRead, OutgoingMessage};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// Result of `ChatStore::send_message`.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Handed to the connection; the server echo will append it.
    Pushed,
    /// Disconnected: stored locally as `Sent`.
    Local(ChatMessage),
}

/// Chat directory plus the ordered message list of every room.
#[derive(Clone)]
pub struct ChatStore {
    me: Id,
    inner: Arc<Mutex<Directory>>,
    conn: ConnectionManager,
    api: Arc<dyn RestApi>,
    bus: EventBus,
}

#[derive(Default)]
struct Directory {
    rooms: Vec<ChatRoom>,
    messages: HashMap<Id, Vec<ChatMessage>>,
    active: Option<Id>,
    pending: Vec<PendingChat>,
    resolved: HashMap<Id, Id>,
}

struct PendingChat {
    temporary: Id,
    customer: Id,
    provider: Id,
}

impl ChatStore {
    pub fn new(me: Id, conn: ConnectionManager, api: Arc<dyn RestApi>, bus: EventBus) -> Self {
        Self {
            me,
            inner: Arc::new(Mutex::new(Directory::default())),
            conn,
            api,
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the room list. Rooms already known are replaced by the server's copy.
    pub async fn load_chats(&self) -> Result<usize> {
        let chats = self.api.list_chats().await.map_err(|e| {
            error!("Failed to load chats: {}", e);
            e
        })?;
        let count = chats.len();
        {
            let mut dir = self.lock();
            for room in chats.into_iter().map(ChatRoom::from) {
                dir.messages.entry(room.id.clone()).or_default();
                match dir.rooms.iter_mut().find(|r| r.id == room.id) {
                    Some(existing) => *existing = room,
                    None => dir.rooms.push(room),
                }
            }
        }
        info!("Loaded {} chats", count);
        self.bus.publish(ClientEvent::ChatsUpdated);
        Ok(count)
    }

    /// Live `chat_created`. Returns whether the room was new.
    pub fn handle_chat_created(&self, room: ChatRoom) -> bool {
        let mut resolved = Vec::new();
        let inserted = {
            let mut guard = self.lock();
            let dir = &mut *guard;

            if let Some(pos) = dir
                .pending
                .iter()
                .position(|p| room.joins(&p.customer, &p.provider))
            {
                let pending = dir.pending.remove(pos);
                resolved.push(pending.temporary);
            }

            // A room fabricated offline for the same pair is superseded by the server's.
            let mut moved_last = None;
            if let Some(pos) = dir
                .rooms
                .iter()
                .position(|r| r.id.is_local() && r.joins(&room.customer.id, &room.provider.id))
            {
                let local = dir.rooms.remove(pos);
                if let Some(mut held) = dir.messages.remove(&local.id) {
                    for msg in &mut held {
                        msg.chat_id = room.id.clone();
                    }
                    moved_last = held.last().cloned();
                    dir.messages.entry(room.id.clone()).or_default().extend(held);
                }
                resolved.push(local.id);
            }

            for temporary in &resolved {
                dir.resolved.insert(temporary.clone(), room.id.clone());
            }

            match dir.rooms.iter_mut().find(|r| r.id == room.id) {
                Some(existing) => {
                    if existing.last_message.is_none() {
                        existing.last_message = moved_last;
                    }
                    false
                }
                None => {
                    let mut room = room.clone();
                    if room.last_message.is_none() {
                        room.last_message = moved_last;
                    }
                    dir.messages.entry(room.id.clone()).or_default();
                    dir.rooms.push(room);
                    true
                }
            }
        };

        for temporary in resolved {
            debug!("Chat {} resolved to {}", temporary, room.id);
            self.bus.publish(ClientEvent::ChatIdResolved {
                temporary,
                id: room.id.clone(),
            });
        }
        if inserted {
            info!("Chat {} created", room.id);
            self.bus.publish(ClientEvent::ChatsUpdated);
        }
        inserted
    }

    /// Live `chat_message`. Returns whether the message was appended.
    pub fn handle_chat_message(&self, message: ChatMessage) -> bool {
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();
        {
            let mut guard = self.lock();
            let dir = &mut *guard;
            // Compared at handling time, not at arrival time.
            let viewing = dir.active.as_ref() == Some(&chat_id);

            let list = dir.messages.entry(chat_id.clone()).or_default();
            if list.iter().any(|m| m.id == message.id) {
                debug!("Ignoring replayed message {} in chat {}", message.id, chat_id);
                return false;
            }
            list.push(message.clone());

            if let Some(room) = dir.rooms.iter_mut().find(|r| r.id == chat_id) {
                if message.sender_id != self.me && !viewing {
                    room.unread += 1;
                }
                room.last_message = Some(message);
            }
        }
        self.bus.publish(ClientEvent::MessageAppended {
            chat_id,
            message_id,
        });
        true
    }

    /// Live `message_read`: the peer read our messages up to a bound.
    pub fn handle_message_read(&self, receipt: MessageRead) -> usize {
        if receipt.reader_id == self.me {
            return 0;
        }
        let read_at = receipt.read_at.unwrap_or_else(Utc::now);
        let bound = receipt.up_to_message_id.as_ref();
        let count = {
            let mut guard = self.lock();
            let dir = &mut *guard;
            let mut count = 0;
            if let Some(list) = dir.messages.get_mut(&receipt.chat_id) {
                for msg in list.iter_mut().filter(|m| {
                    m.sender_id == self.me && m.state != DeliveryState::Read && m.covered_by(bound)
                }) {
                    msg.state = DeliveryState::Read;
                    msg.read_at = Some(read_at);
                    count += 1;
                }
            }
            if let Some(last) = dir
                .rooms
                .iter_mut()
                .find(|r| r.id == receipt.chat_id)
                .and_then(|r| r.last_message.as_mut())
            {
                if last.sender_id == self.me && last.covered_by(bound) {
                    last.state = DeliveryState::Read;
                    last.read_at = Some(read_at);
                }
            }
            count
        };
        if count > 0 {
            self.bus.publish(ClientEvent::MessagesRead {
                chat_id: receipt.chat_id,
                count,
            });
        }
        count
    }

    /// Send into a room. Temporary and offline ids are mapped to the server id first.
    pub fn send_message(&self, chat_id: &Id, content: &str, kind: MessageKind) -> SendOutcome {
        let chat_id = &self.resolve_chat_id(chat_id);
        if self.conn.is_connected() {
            self.conn.send(
                frame::CHAT_MESSAGE,
                &OutgoingMessage {
                    chat_id: chat_id.clone(),
                    sender_id: self.me.clone(),
                    content: content.to_string(),
                    message_type: kind,
                },
            );
            return SendOutcome::Pushed;
        }

        let message = ChatMessage::local(chat_id.clone(), self.me.clone(), content, kind);
        {
            let mut guard = self.lock();
            let dir = &mut *guard;
            dir.messages
                .entry(chat_id.clone())
                .or_default()
                .push(message.clone());
            if let Some(room) = dir.rooms.iter_mut().find(|r| r.id == *chat_id) {
                room.last_message = Some(message.clone());
            }
        }
        debug!("Stored offline message {} in chat {}", message.id, chat_id);
        self.bus.publish(ClientEvent::MessageAppended {
            chat_id: chat_id.clone(),
            message_id: message.id.clone(),
        });
        SendOutcome::Local(message)
    }

    /// Find or create the room between two participants.
    ///
    /// While connected this returns a temporary id; the server id arrives later
    /// through `chat_created` and can be looked up with `resolve_chat_id`.
    pub fn create_chat(&self, customer: Participant, provider: Participant) -> Id {
        let mut dir = self.lock();
        if let Some(room) = dir.rooms.iter().find(|r| r.joins(&customer.id, &provider.id)) {
            return room.id.clone();
        }

        if self.conn.is_connected() {
            let in_flight = dir
                .pending
                .iter()
                .find(|p| same_pair((&p.customer, &p.provider), (&customer.id, &provider.id)))
                .map(|p| p.temporary.clone());
            // Re-sent even when in flight: the first request may have been dropped.
            let temporary = match in_flight {
                Some(temporary) => temporary,
                None => {
                    let temporary = Id::temporary();
                    dir.pending.push(PendingChat {
                        temporary: temporary.clone(),
                        customer: customer.id.clone(),
                        provider: provider.id.clone(),
                    });
                    temporary
                }
            };
            drop(dir);
            self.conn.send(
                frame::CREATE_CHAT,
                &CreateChat {
                    customer_id: customer.id,
                    provider_id: provider.id,
                },
            );
            return temporary;
        }

        let room = ChatRoom::new(Id::local(), customer, provider);
        let id = room.id.clone();
        dir.messages.insert(id.clone(), Vec::new());
        dir.rooms.push(room);
        drop(dir);
        info!("Created offline chat {}", id);
        self.bus.publish(ClientEvent::ChatsUpdated);
        id
    }

    /// Whether a connected `create_chat` for this pair is still waiting for the server.
    pub fn awaiting_creation(&self, a: &Id, b: &Id) -> bool {
        self.lock()
            .pending
            .iter()
            .any(|p| same_pair((&p.customer, &p.provider), (a, b)))
    }

    /// Server id for a temporary or offline id, or the id itself.
    pub fn resolve_chat_id(&self, id: &Id) -> Id {
        self.lock().resolved.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Switch the active room and load its history. The unread counter is left alone.
    pub async fn set_active_chat(&self, id: Option<Id>) -> Result<Vec<ChatMessage>> {
        let chat_id = id.map(|id| self.resolve_chat_id(&id));
        self.lock().active = chat_id.clone();

        let Some(chat_id) = chat_id else {
            return Ok(Vec::new());
        };
        if chat_id.is_local() {
            return Ok(self.messages(&chat_id));
        }

        let history = self.api.chat_messages(&chat_id).await.map_err(|e| {
            error!("Failed to load history for chat {}: {}", chat_id, e);
            e
        })?;

        let mut merged: Vec<ChatMessage> = history.into_iter().map(ChatMessage::from).collect();
        let mut dir = self.lock();
        let fetched: HashSet<Id> = merged.iter().map(|m| m.id.clone()).collect();
        if let Some(held) = dir.messages.get(&chat_id) {
            merged.extend(held.iter().filter(|m| !fetched.contains(&m.id)).cloned());
        }
        dir.messages.insert(chat_id.clone(), merged.clone());
        debug!("Loaded {} messages for chat {}", merged.len(), chat_id);
        Ok(merged)
    }

    pub fn mark_chat_read(&self, chat_id: &Id) {
        let changed = {
            let mut dir = self.lock();
            match dir.rooms.iter_mut().find(|r| r.id == *chat_id) {
                Some(room) if room.unread > 0 => {
                    room.unread = 0;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.bus.publish(ClientEvent::ChatsUpdated);
        }
    }

    pub fn rooms(&self) -> Vec<ChatRoom> {
        self.lock().rooms.clone()
    }

    pub fn room(&self, id: &Id) -> Option<ChatRoom> {
        self.lock().rooms.iter().find(|r| r.id == *id).cloned()
    }

    pub fn messages(&self, chat_id: &Id) -> Vec<ChatMessage> {
        self.lock()
            .messages
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_chat(&self) -> Option<Id> {
        self.lock().active.clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.lock().rooms.iter().map(|r| r.unread).sum()
    }
}

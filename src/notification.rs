use crate::api::{DeliveryChannel, NotificationDto, RestApi};
use crate::bus::{ClientEvent, EventBus};
use crate::entity::Id;
use crate::error::Result;
use crate::protocol::{ChatCreated, ChatMessagePushed, RequestActivity};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[serde(alias = "new_message")]
    MessageNew,
    ChatCreated,
    JobAssigned,
    JobCompleted,
    #[serde(alias = "new_service_request", alias = "new_request")]
    Request,
    #[serde(alias = "request_status_updated")]
    StatusUpdate,
    #[serde(other)]
    System,
}

impl NotificationKind {
    /// Ephemeral kinds disappear on their own after a fixed delay.
    pub fn is_ephemeral(self) -> bool {
        matches!(
            self,
            NotificationKind::System | NotificationKind::JobAssigned | NotificationKind::JobCompleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::MessageNew => "message_new",
            NotificationKind::ChatCreated => "chat_created",
            NotificationKind::JobAssigned => "job_assigned",
            NotificationKind::JobCompleted => "job_completed",
            NotificationKind::Request => "request",
            NotificationKind::StatusUpdate => "status_update",
            NotificationKind::System => "system",
        }
    }

    fn default_title(self) -> &'static str {
        match self {
            NotificationKind::MessageNew => "New message",
            NotificationKind::ChatCreated => "New conversation",
            NotificationKind::JobAssigned => "Job assigned",
            NotificationKind::JobCompleted => "Job completed",
            NotificationKind::Request => "New service request",
            NotificationKind::StatusUpdate => "Request status updated",
            NotificationKind::System => "Notice",
        }
    }
}

/// Server-confirmed status. `Dismissed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Seen,
    Dismissed,
}

impl NotificationStatus {
    /// Only forward moves are valid; a late delivery ack never demotes `Seen`.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        self != NotificationStatus::Dismissed && next > self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Equal to `server_id` when the server assigned one.
    pub id: Id,
    pub server_id: Option<Id>,
    pub kind: NotificationKind,
    pub status: NotificationStatus,
    /// Local, UI-facing flag; distinct from `status`.
    pub read: bool,
    pub title: String,
    pub body: String,
    pub chat_id: Option<Id>,
    pub message_id: Option<Id>,
    pub sender_id: Option<Id>,
    pub sender_name: Option<String>,
    pub request_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    fn new(kind: NotificationKind, server_id: Option<Id>) -> Self {
        Self {
            id: server_id.clone().unwrap_or_else(Id::local),
            server_id,
            kind,
            status: NotificationStatus::Pending,
            read: false,
            title: kind.default_title().to_string(),
            body: String::new(),
            chat_id: None,
            message_id: None,
            sender_id: None,
            sender_name: None,
            request_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_message(pushed: &ChatMessagePushed) -> Self {
        let msg = &pushed.message;
        let mut n = Self::new(NotificationKind::MessageNew, pushed.notification_id.clone());
        if let Some(name) = &msg.sender_name {
            n.title = format!("New message from {}", name);
        }
        n.body = msg.content.clone();
        n.chat_id = Some(msg.chat_id.clone());
        n.message_id = Some(msg.id.clone());
        n.sender_id = Some(msg.sender_id.clone());
        n.sender_name = msg.sender_name.clone();
        n.created_at = msg.timestamp.unwrap_or_else(Utc::now);
        n
    }

    pub fn from_chat_created(event: &ChatCreated, me: &Id) -> Self {
        let chat = &event.chat;
        let mut n = Self::new(NotificationKind::ChatCreated, event.notification_id.clone());
        let (other_id, other_name) = if chat.customer_id == *me {
            (&chat.provider_id, &chat.provider_name)
        } else {
            (&chat.customer_id, &chat.customer_name)
        };
        n.body = match other_name {
            Some(name) => format!("{} started a conversation", name),
            None => "A conversation was started".to_string(),
        };
        n.chat_id = Some(chat.id.clone());
        n.sender_id = Some(other_id.clone());
        n.sender_name = other_name.clone();
        n.created_at = chat.created_at.unwrap_or_else(Utc::now);
        n
    }

    pub fn from_activity(kind: NotificationKind, event: &RequestActivity) -> Self {
        let mut n = Self::new(kind, event.notification_id.clone());
        if let Some(title) = &event.title {
            n.title = title.clone();
        }
        n.body = event
            .message
            .clone()
            .or_else(|| event.status.as_ref().map(|s| format!("Status: {}", s)))
            .unwrap_or_default();
        n.request_id = event.request_id.clone();
        n.sender_id = event.sender_id.clone();
        n.sender_name = event.sender_name.clone();
        n.created_at = event.created_at.unwrap_or_else(Utc::now);
        n
    }

    /// Heuristic identity for notifications without a server id.
    pub fn same_content(&self, other: &Notification) -> bool {
        self.kind == other.kind
            && self.chat_id == other.chat_id
            && self.body == other.body
            && self.sender_id == other.sender_id
    }

    fn alert_tag(&self) -> String {
        match &self.chat_id {
            Some(chat_id) => format!("chat-{}", chat_id),
            None => self.kind.as_str().to_string(),
        }
    }
}

impl From<NotificationDto> for Notification {
    fn from(dto: NotificationDto) -> Self {
        let mut n = Self::new(dto.kind, Some(dto.id));
        n.status = dto.status.unwrap_or(NotificationStatus::Pending);
        if let Some(title) = dto.title {
            n.title = title;
        }
        n.body = dto.body.unwrap_or_default();
        n.chat_id = dto.chat_id;
        n.message_id = dto.message_id;
        n.sender_id = dto.sender_id;
        n.sender_name = dto.sender_name;
        n.request_id = dto.request_id;
        n.created_at = dto.created_at.unwrap_or_else(Utc::now);
        n
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPreferences {
    pub messages: bool,
    pub chats: bool,
    pub jobs: bool,
    pub requests: bool,
    pub system: bool,
    pub native_alerts: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            messages: true,
            chats: true,
            jobs: true,
            requests: true,
            system: true,
            native_alerts: true,
        }
    }
}

impl NotificationPreferences {
    pub fn allows(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::MessageNew => self.messages,
            NotificationKind::ChatCreated => self.chats,
            NotificationKind::JobAssigned | NotificationKind::JobCompleted => self.jobs,
            NotificationKind::Request | NotificationKind::StatusUpdate => self.requests,
            NotificationKind::System => self.system,
        }
    }
}

/// Deduplicated notification list fed by pull reconciliation and live pushes.
#[derive(Clone)]
pub struct NotificationCenter {
    me: Id,
    inner: Arc<Mutex<Inbox>>,
    api: Arc<dyn RestApi>,
    bus: EventBus,
    expiry: Duration,
    pull_limit: usize,
}

#[derive(Default)]
struct Inbox {
    // Newest first
    items: Vec<Notification>,
    timers: HashMap<Id, JoinHandle<()>>,
    // Server ids that were dismissed or expired; they never come back.
    retired: HashSet<Id>,
    // In-flight push delivery acks
    acks: Vec<JoinHandle<()>>,
    prefs: NotificationPreferences,
    alerts_permitted: bool,
}

impl NotificationCenter {
    pub fn new(
        me: Id,
        api: Arc<dyn RestApi>,
        bus: EventBus,
        expiry: Duration,
        pull_limit: usize,
    ) -> Self {
        Self {
            me,
            inner: Arc::new(Mutex::new(Inbox::default())),
            api,
            bus,
            expiry,
            pull_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inbox> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pull reconciliation: fetch server-pending notifications, merge them, and
    /// acknowledge delivery of each one. Returns how many entries were new.
    pub async fn pull(&self) -> Result<usize> {
        let pending = self
            .api
            .pending_notifications(self.pull_limit)
            .await
            .map_err(|e| {
                warn!("Failed to pull pending notifications: {}", e);
                e
            })?;

        let fetched: Vec<Id> = pending.iter().map(|dto| dto.id.clone()).collect();
        let fresh = pending
            .into_iter()
            .filter_map(|dto| self.ingest(Notification::from(dto), false))
            .count();
        info!(
            "Pulled {} pending notifications ({} new)",
            fetched.len(),
            fresh
        );

        let acks = fetched
            .iter()
            .map(|id| self.api.ack_delivered(id, DeliveryChannel::Pull));
        for (id, result) in fetched.iter().zip(join_all(acks).await) {
            match result {
                Ok(()) => self.advance(id, NotificationStatus::Delivered),
                Err(e) => warn!("Delivery ack for notification {} failed: {}", id, e),
            }
        }
        Ok(fresh)
    }

    pub fn on_chat_message(&self, pushed: &ChatMessagePushed) -> Option<Id> {
        if pushed.message.sender_id == self.me {
            return None;
        }
        self.ingest_push(Notification::from_message(pushed))
    }

    pub fn on_chat_created(&self, event: &ChatCreated) -> Option<Id> {
        self.ingest_push(Notification::from_chat_created(event, &self.me))
    }

    pub fn on_request_activity(&self, kind: NotificationKind, event: &RequestActivity) -> Option<Id> {
        self.ingest_push(Notification::from_activity(kind, event))
    }

    fn ingest_push(&self, notification: Notification) -> Option<Id> {
        if !self.lock().prefs.allows(notification.kind) {
            debug!("{} notifications are disabled", notification.kind.as_str());
            return None;
        }
        let server_id = notification.server_id.clone();
        let id = self.ingest(notification, true)?;

        if let Some(server_id) = server_id {
            let center = self.clone();
            let ack = tokio::spawn(async move {
                match center.api.ack_delivered(&server_id, DeliveryChannel::Push).await {
                    Ok(()) => center.advance(&server_id, NotificationStatus::Delivered),
                    Err(e) => warn!("Delivery ack for notification {} failed: {}", server_id, e),
                }
            });
            let mut inbox = self.lock();
            inbox.acks.retain(|task| !task.is_finished());
            inbox.acks.push(ack);
        }
        Some(id)
    }

    /// Merge one notification. Returns its id when it produced a new entry.
    fn ingest(&self, notification: Notification, alert: bool) -> Option<Id> {
        let mut inbox = self.lock();

        if let Some(server_id) = &notification.server_id {
            if inbox.retired.contains(server_id) {
                debug!("Notification {} was dismissed or expired", server_id);
                return None;
            }
            if inbox.items.iter().any(|n| n.server_id.as_ref() == Some(server_id)) {
                debug!("Notification {} already present", server_id);
                return None;
            }
            // An earlier id-less copy of the same event takes over the server id.
            if let Some(existing) = inbox
                .items
                .iter_mut()
                .find(|n| n.server_id.is_none() && n.same_content(&notification))
            {
                let previous = std::mem::replace(&mut existing.id, server_id.clone());
                existing.server_id = Some(server_id.clone());
                if existing.status.can_transition_to(notification.status) {
                    existing.status = notification.status;
                }
                let ephemeral = existing.kind.is_ephemeral();
                if let Some(timer) = inbox.timers.remove(&previous) {
                    timer.abort();
                }
                if ephemeral {
                    self.schedule_expiry(&mut inbox, server_id.clone());
                }
                debug!("Notification {} adopted server id {}", previous, server_id);
                return None;
            }
        } else if inbox.items.iter().any(|n| n.same_content(&notification)) {
            debug!("Dropping duplicate {} notification", notification.kind.as_str());
            return None;
        }

        let id = notification.id.clone();
        if notification.kind.is_ephemeral() {
            self.schedule_expiry(&mut inbox, id.clone());
        }
        let alert = (alert && inbox.alerts_permitted && inbox.prefs.native_alerts).then(|| {
            ClientEvent::Alert {
                tag: notification.alert_tag(),
                title: notification.title.clone(),
                body: notification.body.clone(),
            }
        });
        inbox.items.insert(0, notification);
        drop(inbox);

        self.bus.publish(ClientEvent::NotificationAdded { id: id.clone() });
        if let Some(alert) = alert {
            self.bus.publish(alert);
        }
        Some(id)
    }

    fn schedule_expiry(&self, inbox: &mut Inbox, id: Id) {
        let center = self.clone();
        let delay = self.expiry;
        let key = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            center.expire(&id);
        });
        if let Some(old) = inbox.timers.insert(key, timer) {
            old.abort();
        }
    }

    fn expire(&self, id: &Id) {
        let removed = {
            let mut inbox = self.lock();
            inbox.timers.remove(id);
            match inbox.items.iter().position(|n| n.id == *id) {
                Some(pos) => {
                    let expired = inbox.items.remove(pos);
                    if let Some(server_id) = expired.server_id {
                        inbox.retired.insert(server_id);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            debug!("Notification {} expired", id);
            self.bus.publish(ClientEvent::NotificationRemoved { id: id.clone() });
        }
    }

    /// Apply a server-confirmed status, ignoring invalid transitions.
    fn advance(&self, server_id: &Id, status: NotificationStatus) {
        let mut inbox = self.lock();
        if let Some(n) = inbox
            .items
            .iter_mut()
            .find(|n| n.server_id.as_ref() == Some(server_id))
        {
            if n.status.can_transition_to(status) {
                n.status = status;
            }
        }
    }

    /// Flip the local read flag and, when the server knows the notification, ask it
    /// to record `Seen`. The returned handle is the background acknowledgement.
    pub fn mark_as_read(&self, id: &Id) -> Option<JoinHandle<()>> {
        let server_id = {
            let mut inbox = self.lock();
            let n = inbox.items.iter_mut().find(|n| n.id == *id)?;
            if n.read {
                return None;
            }
            n.read = true;
            n.server_id
                .clone()
                .filter(|_| n.status.can_transition_to(NotificationStatus::Seen))
        }?;

        let center = self.clone();
        Some(tokio::spawn(async move {
            match center.api.ack_seen(&server_id).await {
                Ok(()) => center.advance(&server_id, NotificationStatus::Seen),
                Err(e) => warn!("Failed to mark notification {} as seen: {}", server_id, e),
            }
        }))
    }

    /// Mark everything read; one concurrent `Seen` request per server-known entry.
    /// Returns how many acknowledgements succeeded.
    pub async fn mark_all_as_read(&self) -> usize {
        let server_ids: Vec<Id> = {
            let mut inbox = self.lock();
            inbox
                .items
                .iter_mut()
                .filter_map(|n| {
                    n.read = true;
                    n.server_id
                        .clone()
                        .filter(|_| n.status.can_transition_to(NotificationStatus::Seen))
                })
                .collect()
        };

        let acks = server_ids.iter().map(|id| self.api.ack_seen(id));
        let mut confirmed = 0;
        for (id, result) in server_ids.iter().zip(join_all(acks).await) {
            match result {
                Ok(()) => {
                    self.advance(id, NotificationStatus::Seen);
                    confirmed += 1;
                }
                Err(e) => warn!("Failed to mark notification {} as seen: {}", id, e),
            }
        }
        confirmed
    }

    /// Mark every notification of a chat read, acknowledged with one bulk request.
    pub fn mark_chat_seen(&self, chat_id: &Id) -> JoinHandle<()> {
        let server_ids: Vec<Id> = {
            let mut inbox = self.lock();
            inbox
                .items
                .iter_mut()
                .filter(|n| n.chat_id.as_ref() == Some(chat_id))
                .filter_map(|n| {
                    n.read = true;
                    n.server_id.clone()
                })
                .collect()
        };

        let center = self.clone();
        let chat_id = chat_id.clone();
        tokio::spawn(async move {
            match center.api.ack_chat_seen(&chat_id).await {
                Ok(()) => {
                    for id in &server_ids {
                        center.advance(id, NotificationStatus::Seen);
                    }
                }
                Err(e) => warn!("Failed to mark chat {} notifications as seen: {}", chat_id, e),
            }
        })
    }

    /// Local removal; the server is not told. Returns the dismissed entry.
    pub fn dismiss(&self, id: &Id) -> Option<Notification> {
        let mut dismissed = {
            let mut inbox = self.lock();
            if let Some(timer) = inbox.timers.remove(id) {
                timer.abort();
            }
            let pos = inbox.items.iter().position(|n| n.id == *id)?;
            let removed = inbox.items.remove(pos);
            if let Some(server_id) = &removed.server_id {
                inbox.retired.insert(server_id.clone());
            }
            removed
        };
        if dismissed
            .status
            .can_transition_to(NotificationStatus::Dismissed)
        {
            dismissed.status = NotificationStatus::Dismissed;
        }
        self.bus.publish(ClientEvent::NotificationRemoved { id: id.clone() });
        Some(dismissed)
    }

    pub async fn load_preferences(&self) -> Result<NotificationPreferences> {
        let prefs = self.api.preferences().await?;
        self.lock().prefs = prefs.clone();
        Ok(prefs)
    }

    pub async fn save_preferences(&self, prefs: NotificationPreferences) -> Result<()> {
        self.api.save_preferences(&prefs).await?;
        self.lock().prefs = prefs;
        Ok(())
    }

    pub fn preferences(&self) -> NotificationPreferences {
        self.lock().prefs.clone()
    }

    pub fn set_alert_permission(&self, granted: bool) {
        self.lock().alerts_permitted = granted;
    }

    /// Cancel every expiry timer and pending push ack, and drop all entries.
    pub fn clear(&self) {
        let mut inbox = self.lock();
        for (_, timer) in inbox.timers.drain() {
            timer.abort();
        }
        for ack in inbox.acks.drain(..) {
            ack.abort();
        }
        inbox.items.clear();
        inbox.retired.clear();
    }

    pub fn list(&self) -> Vec<Notification> {
        self.lock().items.clone()
    }

    pub fn get(&self, id: &Id) -> Option<Notification> {
        self.lock().items.iter().find(|n| n.id == *id).cloned()
    }

    pub fn unread_count(&self) -> usize {
        self.lock().items.iter().filter(|n| !n.read).count()
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    pub fn pending_acks(&self) -> usize {
        self.lock()
            .acks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }
}

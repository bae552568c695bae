use crate::config::Settings;
use crate::entity::Id;
use crate::error::{Error, Result};
use crate::notification::{NotificationKind, NotificationPreferences, NotificationStatus};
use crate::protocol::{ChatDto, MessageDto};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Server-side notification as returned by the pending listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDto {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub status: Option<NotificationStatus>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "message")]
    pub body: Option<String>,
    #[serde(default)]
    pub chat_id: Option<Id>,
    #[serde(default)]
    pub message_id: Option<Id>,
    #[serde(default)]
    pub sender_id: Option<Id>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub request_id: Option<Id>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Which ingestion path delivered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    Pull,
    Push,
}

/// The REST endpoints the real-time client consumes.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<ChatDto>>;

    async fn chat_messages(&self, chat_id: &Id) -> Result<Vec<MessageDto>>;

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<NotificationDto>>;

    async fn ack_delivered(&self, id: &Id, channel: DeliveryChannel) -> Result<()>;

    async fn ack_seen(&self, id: &Id) -> Result<()>;

    async fn ack_chat_seen(&self, chat_id: &Id) -> Result<()>;

    async fn preferences(&self) -> Result<NotificationPreferences>;

    async fn save_preferences(&self, prefs: &NotificationPreferences) -> Result<()>;
}

// Listings come back either bare or wrapped in `{ "data": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Bare(items) | Listing::Wrapped { data: items } => items,
        }
    }
}

/// `RestApi` over HTTP with bearer credential injection.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base: settings.api_url.as_str().trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, endpoint: &str) -> Result<reqwest::Response> {
        debug!("-> {}", endpoint);
        let response = builder
            .send()
            .await
            .map_err(|e| Error::request(endpoint, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder, endpoint: &str) -> Result<T> {
        self.execute(builder, endpoint)
            .await?
            .json::<T>()
            .await
            .map_err(|e| Error::request(endpoint, e))
    }
}

#[async_trait]
impl RestApi for HttpApi {
    async fn list_chats(&self) -> Result<Vec<ChatDto>> {
        let path = "/api/chats";
        let listing: Listing<ChatDto> = self.fetch(self.request(Method::GET, path), path).await?;
        Ok(listing.into_vec())
    }

    async fn chat_messages(&self, chat_id: &Id) -> Result<Vec<MessageDto>> {
        let path = format!("/api/chats/{}/messages", chat_id);
        let listing: Listing<MessageDto> =
            self.fetch(self.request(Method::GET, &path), &path).await?;
        Ok(listing.into_vec())
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<NotificationDto>> {
        let path = "/api/notifications/pending";
        let builder = self
            .request(Method::GET, path)
            .query(&[("limit", limit.to_string())]);
        let listing: Listing<NotificationDto> = self.fetch(builder, path).await?;
        Ok(listing.into_vec())
    }

    async fn ack_delivered(&self, id: &Id, channel: DeliveryChannel) -> Result<()> {
        let path = format!("/api/notifications/{}/delivered", id);
        let builder = self
            .request(Method::POST, &path)
            .json(&json!({ "channel": channel }));
        self.execute(builder, &path).await.map(|_| ())
    }

    async fn ack_seen(&self, id: &Id) -> Result<()> {
        let path = format!("/api/notifications/{}/seen", id);
        self.execute(self.request(Method::POST, &path), &path)
            .await
            .map(|_| ())
    }

    async fn ack_chat_seen(&self, chat_id: &Id) -> Result<()> {
        let path = format!("/api/notifications/chat/{}/seen", chat_id);
        self.execute(self.request(Method::POST, &path), &path)
            .await
            .map(|_| ())
    }

    async fn preferences(&self) -> Result<NotificationPreferences> {
        let path = "/api/notifications/preferences";
        self.fetch(self.request(Method::GET, path), path).await
    }

    async fn save_preferences(&self, prefs: &NotificationPreferences) -> Result<()> {
        let path = "/api/notifications/preferences";
        let builder = self.request(Method::PUT, path).json(prefs);
        self.execute(builder, path).await.map(|_| ())
    }
}

//! Real-time communication client for the marketplace: one persistent connection
//! per logged-in user, the chat directory, the notification inbox, and peer
//! presence, all driven by typed frames over that connection.

pub mod api;
pub mod bus;
pub mod chat;
pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod notification;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod store;

pub use api::{DeliveryChannel, HttpApi, NotificationDto, RestApi};
pub use bus::{ClientEvent, EventBus};
pub use chat::{ChatMessage, ChatRoom, DeliveryState, MessageKind, Participant};
pub use config::{Settings, Timings};
pub use connection::{ConnectionManager, ConnectionState, Connector, Link, SessionInfo, WsConnector};
pub use entity::{Id, Identity, Role};
pub use error::{Error, Result};
pub use notification::{
    Notification, NotificationCenter, NotificationKind, NotificationPreferences, NotificationStatus,
};
pub use presence::{PresenceRecord, PresenceTracker};
pub use session::Session;
pub use store::{ChatStore, SendOutcome};

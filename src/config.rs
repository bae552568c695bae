use crate::entity::{Id, Identity, Role};
use crate::error::{Error, Result};
use reqwest::Url;
use std::time::Duration;

/// Fixed timing constants of the real-time client.
#[derive(Debug, Clone)]
pub struct Timings {
    /// First reconnect delay; attempt `n` waits `reconnect_base * 2^(n-1)`.
    pub reconnect_base: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// A presence record older than this is treated as offline.
    pub presence_stale_after: Duration,
    pub activity_throttle: Duration,
    /// Lifetime of ephemeral notifications (system, job assigned/completed).
    pub notification_expiry: Duration,
    pub pending_pull_limit: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            presence_stale_after: Duration::from_secs(120),
            activity_throttle: Duration::from_secs(1),
            notification_expiry: Duration::from_secs(10),
            pending_pull_limit: 50,
        }
    }
}

/// Upper bound for a single reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(600);

impl Timings {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the cap is hit.
    pub fn reconnect_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_reconnect_attempts {
            return None;
        }
        let delay = 2u32
            .checked_pow(attempt - 1)
            .and_then(|factor| self.reconnect_base.checked_mul(factor))
            .unwrap_or(MAX_RECONNECT_DELAY);
        Some(delay.min(MAX_RECONNECT_DELAY))
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: Url,
    pub token: Option<String>,
    pub timings: Timings,
}

impl Settings {
    pub fn new(api_url: &str) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .map_err(|e| Error::Config(format!("invalid API url `{}`: {}", api_url, e)))?;
        Ok(Self {
            api_url,
            token: None,
            timings: Timings::default(),
        })
    }

    /// Reads settings and the logged-in identity from `MARKETLINK_*` variables.
    pub fn from_env() -> Result<(Self, Identity)> {
        let api_url = require("MARKETLINK_API_URL")?;
        let mut settings = Self::new(&api_url)?;
        settings.token = std::env::var("MARKETLINK_TOKEN").ok().filter(|t| !t.is_empty());

        let user_id = require("MARKETLINK_USER_ID")?;
        let name = std::env::var("MARKETLINK_USER_NAME").unwrap_or_else(|_| user_id.clone());
        let role = match std::env::var("MARKETLINK_ROLE").as_deref() {
            Ok("provider") => Role::Provider,
            Ok("customer") | Err(_) => Role::Customer,
            Ok(other) => {
                return Err(Error::Config(format!("unknown role `{}`", other)));
            }
        };

        Ok((settings, Identity::new(Id::new(user_id), name, role)))
    }

    /// `{ws|wss}://{host}/ws?userId={id}`, derived from the REST base url.
    pub fn socket_url(&self, user_id: &Id) -> Result<Url> {
        let mut url = self.api_url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::Config(format!("cannot derive socket url from {}", self.api_url)))?;
        url.set_path("/ws");
        url.query_pairs_mut()
            .clear()
            .append_pair("userId", user_id.as_str());
        Ok(url)
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::Config(format!("{} is not set", key)))
}

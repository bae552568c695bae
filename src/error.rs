use thiserror::Error;

/// Errors raised by the real-time client.
///
/// None of these are fatal: connection failures are retried by the connection
/// manager, malformed frames are dropped, and only the critical REST loads hand
/// their error back to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed `{frame}` frame: {source}")]
    Protocol {
        frame: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("request to {endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn request(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Request {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

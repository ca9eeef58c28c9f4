use crate::{Terminal, subscription::SubscriptionId};
use thiserror::Error;

/// All socket IO related errors generated in `carry-integration`.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Sink error")]
    Sink,

    #[error("Deserialising JSON error: {error} for payload: {payload}")]
    Deserialise {
        error: serde_json::Error,
        payload: String,
    },

    #[error("Serialising JSON error: {0}")]
    Serialise(serde_json::Error),

    #[error("error parsing Url: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("error subscribing to resources over the socket: {0}")]
    Subscribe(String),

    #[error("VenueSocket terminated with closing frame: {0}")]
    Terminated(String),

    #[error("connection attempt timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("exhausted {0} reconnection attempts")]
    ReconnectAttemptsExhausted(u32),

    #[error("{entity} does not support: {item}")]
    Unsupported { entity: &'static str, item: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("consumed unidentifiable message: {0}")]
    Unidentifiable(SubscriptionId),

    #[error("consumed error message from exchange: {0}")]
    Exchange(String),
}

impl Terminal for SocketError {
    fn is_terminal(&self) -> bool {
        matches!(self, SocketError::ReconnectAttemptsExhausted(_))
    }
}

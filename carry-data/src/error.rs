use carry_instrument::exchange::ExchangeId;
use thiserror::Error;

/// All market-data related errors generated in `carry-data`.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("socket error: {0}")]
    Socket(#[from] carry_integration::error::SocketError),

    #[error("unidentifiable venue message from {exchange}: {payload}")]
    Unidentifiable {
        exchange: ExchangeId,
        payload: String,
    },

    #[error("venue {exchange} reported subscription error: {message}")]
    Subscription {
        exchange: ExchangeId,
        message: String,
    },

    #[error("{exchange} does not provide channel: {channel}")]
    UnsupportedChannel {
        exchange: ExchangeId,
        channel: &'static str,
    },

    #[error("historical store error: {0}")]
    Storage(String),
}

use crate::{error::DataError, event::MarketEvent};
use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use serde::{Deserialize, Serialize};

/// [`Binance`](binance) USDT-M futures stream decoding and subscription building.
pub mod binance;

/// [`Bybit`](bybit) V5 linear stream decoding and subscription building.
pub mod bybit;

/// [`Okx`](okx) V5 public stream decoding and subscription building.
pub mod okx;

/// Market-data channel in canonical form, translated into venue-native stream names by each
/// venue's subscription builder.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Ticker,
    Depth5,
    Depth20,
    Trades,
    MarkPrice,
    Funding,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Ticker => "ticker",
            Channel::Depth5 => "depth5",
            Channel::Depth20 => "depth20",
            Channel::Trades => "trades",
            Channel::MarkPrice => "mark_price",
            Channel::Funding => "funding",
        }
    }
}

/// Public stream URL for the provided venue.
pub fn stream_url(exchange: ExchangeId) -> &'static str {
    match exchange {
        ExchangeId::Binance => binance::BASE_URL_BINANCE_FUTURES,
        ExchangeId::Bybit => bybit::BASE_URL_BYBIT_LINEAR,
        ExchangeId::Okx => okx::BASE_URL_OKX,
    }
}

/// Venue-native market identifier for a canonical [`Symbol`].
pub fn native_symbol(exchange: ExchangeId, symbol: &Symbol) -> String {
    match exchange {
        ExchangeId::Binance => binance::native_symbol(symbol),
        ExchangeId::Bybit => bybit::native_symbol(symbol),
        ExchangeId::Okx => okx::native_symbol(symbol),
    }
}

/// Build the subscription payload(s) for the provided venue, symbols and channels.
///
/// Payloads are opaque strings stored by the connection supervisor and replayed verbatim after
/// every reconnect.
pub fn subscribe_payloads(
    exchange: ExchangeId,
    symbols: &[Symbol],
    channels: &[Channel],
) -> Vec<String> {
    match exchange {
        ExchangeId::Binance => binance::subscribe_payloads(symbols, channels, true),
        ExchangeId::Bybit => bybit::subscribe_payloads(symbols, channels, true),
        ExchangeId::Okx => okx::subscribe_payloads(symbols, channels, true),
    }
}

/// Build the matching unsubscribe payload(s).
pub fn unsubscribe_payloads(
    exchange: ExchangeId,
    symbols: &[Symbol],
    channels: &[Channel],
) -> Vec<String> {
    match exchange {
        ExchangeId::Binance => binance::subscribe_payloads(symbols, channels, false),
        ExchangeId::Bybit => bybit::subscribe_payloads(symbols, channels, false),
        ExchangeId::Okx => okx::subscribe_payloads(symbols, channels, false),
    }
}

/// Decode one venue payload into zero or more normalised [`MarketEvent`]s.
///
/// Subscription acks and heartbeat frames decode to an empty `Vec`. A malformed payload is an
/// error for the *single* record only - callers log and continue.
pub fn parse(exchange: ExchangeId, payload: &str) -> Result<Vec<MarketEvent>, DataError> {
    match exchange {
        ExchangeId::Binance => binance::parse(payload),
        ExchangeId::Bybit => bybit::parse(payload),
        ExchangeId::Okx => okx::parse(payload),
    }
}

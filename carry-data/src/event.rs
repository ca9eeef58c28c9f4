use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, Utc};
use derive_more::From;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalised Carry market event, wrapping a [`DataKind`] variant in stream metadata.
///
/// `time_exchange` is the venue-reported event time; `time_received` is stamped on ingress and
/// used for processing-latency statistics.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MarketEvent<Kind = DataKind> {
    pub time_exchange: DateTime<Utc>,
    pub time_received: DateTime<Utc>,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub kind: Kind,
}

impl<Kind> MarketEvent<Kind> {
    /// Event time as milliseconds since the Unix epoch - the ordering key of the backtest
    /// event queue.
    pub fn timestamp_ms(&self) -> u64 {
        self.time_exchange.timestamp_millis().max(0) as u64
    }

    pub fn map_kind<F, O>(self, op: F) -> MarketEvent<O>
    where
        F: FnOnce(Kind) -> O,
    {
        MarketEvent {
            time_exchange: self.time_exchange,
            time_received: self.time_received,
            exchange: self.exchange,
            symbol: self.symbol,
            kind: op(self.kind),
        }
    }
}

/// Available kinds of normalised Carry [`MarketEvent`].
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize, From)]
pub enum DataKind {
    Trade(PublicTrade),
    Depth(DepthUpdate),
    Ticker(Ticker),
    Funding(FundingRate),
    MarkPrice(MarkPriceUpdate),
    Kline(Kline),
}

impl DataKind {
    /// Short name used for per-kind statistics keys.
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Trade(_) => "trade",
            DataKind::Depth(_) => "depth",
            DataKind::Ticker(_) => "ticker",
            DataKind::Funding(_) => "funding",
            DataKind::MarkPrice(_) => "mark_price",
            DataKind::Kline(_) => "kline",
        }
    }

    /// Depth updates may be dropped under back-pressure; funding and heartbeat-adjacent
    /// events never are.
    pub fn is_droppable(&self) -> bool {
        matches!(self, DataKind::Depth(_) | DataKind::Ticker(_))
    }
}

/// Normalised public trade.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct PublicTrade {
    pub id: String,
    pub price: Decimal,
    pub amount: Decimal,
    /// Aggressor side: `Sell` if the seller crossed the spread.
    pub side: Side,
}

/// A single `(price, amount)` level of an order book ladder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize)]
pub struct Level {
    pub price: Decimal,
    pub amount: Decimal,
}

impl Level {
    pub fn new<T>(price: T, amount: T) -> Self
    where
        T: Into<Decimal>,
    {
        Self {
            price: price.into(),
            amount: amount.into(),
        }
    }
}

impl<T> From<(T, T)> for Level
where
    T: Into<Decimal>,
{
    fn from((price, amount): (T, T)) -> Self {
        Self::new(price, amount)
    }
}

/// Kind of an L2 depth update.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthKind {
    /// Full replacement of both sides.
    Snapshot,
    /// Incremental upsert; a zero amount deletes the level.
    Delta,
}

/// Normalised L2 depth update. Bids are sorted descending, asks ascending.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct DepthUpdate {
    pub kind: DepthKind,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Normalised 24h ticker summary.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Ticker {
    pub last_price: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
}

/// Normalised funding-rate record.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct FundingRate {
    /// Per-period funding rate (not annualized).
    pub rate: Decimal,
    /// Venue-predicted next-period rate, where provided.
    pub predicted_rate: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
}

/// Normalised mark-price update.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct MarkPriceUpdate {
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
}

/// Normalised kline/candle.
///
/// When loaded from historical storage the event timestamp is shifted to
/// `open_time + 60s - 1ms` so a final kline sorts after the intra-minute events it summarises.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: u64,
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timestamp_ms_matches_time_exchange() {
        let event = MarketEvent {
            time_exchange: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            time_received: Utc::now(),
            exchange: ExchangeId::Binance,
            symbol: Symbol::new("BTC/USDT:USDT"),
            kind: DataKind::Trade(PublicTrade {
                id: "1".into(),
                price: dec!(100),
                amount: dec!(1),
                side: Side::Buy,
            }),
        };
        assert_eq!(event.timestamp_ms(), 1_700_000_000_123);
    }

    #[test]
    fn test_droppable_kinds() {
        let depth = DataKind::Depth(DepthUpdate {
            kind: DepthKind::Delta,
            bids: vec![],
            asks: vec![],
        });
        let funding = DataKind::Funding(FundingRate {
            rate: dec!(0.0001),
            predicted_rate: None,
            mark_price: None,
            next_funding_time: None,
        });
        assert!(depth.is_droppable());
        assert!(!funding.is_droppable());
    }
}

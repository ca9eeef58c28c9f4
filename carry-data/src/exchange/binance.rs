use crate::{
    error::DataError,
    event::{
        DataKind, DepthKind, DepthUpdate, FundingRate, Level, MarkPriceUpdate, MarketEvent,
        PublicTrade, Ticker,
    },
    exchange::Channel,
};
use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use carry_integration::{Validator, de::de_u64_epoch_ms_as_datetime_utc, error::SocketError};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::hash::Hasher;

/// [`Binance`](https://binance-docs.github.io/apidocs/futures/en/) USDT-M futures combined
/// stream base url.
pub const BASE_URL_BINANCE_FUTURES: &str = "wss://fstream.binance.com/stream";

/// Request id derived from the stream names, so an identical request always carries the same
/// id and subscription payloads stay byte-stable across rebuilds (the reconnect-replay ledger
/// matches unsubscribes against the original payload string).
fn request_id(params: &[String]) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    for param in params {
        hasher.write(param.as_bytes());
    }
    // Binance expects a modest integer id
    hasher.finish() % 1_000_000
}

/// Venue-native market identifier, eg/ "BTCUSDT" for canonical "BTC/USDT:USDT".
pub fn native_symbol(symbol: &Symbol) -> String {
    format!("{}{}", symbol.base(), symbol.quote())
}

/// Canonical [`Symbol`] recovered from a venue-native identifier, eg/ "BTCUSDT".
pub fn canonical_symbol(native: &str) -> Symbol {
    for quote in ["USDT", "USDC", "BUSD", "USD"] {
        if let Some(base) = native.strip_suffix(quote)
            && !base.is_empty()
        {
            return Symbol::new(format!("{base}/{quote}"));
        }
    }
    Symbol::new(native)
}

/// Combined-stream name for a `(Symbol, Channel)` pair.
///
/// See docs: <https://binance-docs.github.io/apidocs/futures/en/#websocket-market-streams>
fn stream_name(symbol: &Symbol, channel: Channel) -> String {
    let market = native_symbol(symbol).to_lowercase();
    match channel {
        Channel::Ticker => format!("{market}@ticker"),
        Channel::Depth5 => format!("{market}@depth5@100ms"),
        Channel::Depth20 => format!("{market}@depth20@100ms"),
        Channel::Trades => format!("{market}@aggTrade"),
        // Mark price and funding ride the same stream
        Channel::MarkPrice | Channel::Funding => format!("{market}@markPrice@1s"),
    }
}

/// Build `SUBSCRIBE`/`UNSUBSCRIBE` payloads for the provided symbols and channels.
///
/// ### Payload Example
/// ```json
/// {"method":"SUBSCRIBE","params":["btcusdt@aggTrade","btcusdt@markPrice@1s"],"id":1}
/// ```
pub fn subscribe_payloads(
    symbols: &[Symbol],
    channels: &[Channel],
    subscribe: bool,
) -> Vec<String> {
    let params = symbols
        .iter()
        .cartesian_product(channels.iter())
        .map(|(symbol, channel)| stream_name(symbol, *channel))
        .unique()
        .collect::<Vec<_>>();

    if params.is_empty() {
        return vec![];
    }

    vec![
        json!({
            "method": if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" },
            "params": params,
            "id": request_id(&params),
        })
        .to_string(),
    ]
}

/// Binance subscription response message.
///
/// ### Raw Payload Examples
/// #### Subscription Success
/// ```json
/// {"id":1,"result":null}
/// ```
/// #### Subscription Failure
/// ```json
/// {"id":1,"result":[]}
/// ```
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceSubResponse {
    result: Option<Vec<String>>,
    id: u64,
}

impl Validator for BinanceSubResponse {
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized,
    {
        if self.result.is_none() {
            Ok(self)
        } else {
            Err(SocketError::Subscribe(
                "received failure subscription response".to_owned(),
            ))
        }
    }
}

/// Binance combined-stream wrapper.
///
/// Every data message on `/stream` arrives as `{"stream":"<name>","data":{...}}`.
#[derive(Debug, Deserialize)]
struct BinanceCombinedStream {
    #[serde(rename = "stream")]
    _stream: String,
    data: BinanceMessage,
}

/// Binance futures data message, routed by the `"e"` event-type tag.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum BinanceMessage {
    #[serde(rename = "aggTrade")]
    AggTrade(BinanceAggTrade),
    #[serde(rename = "depthUpdate")]
    Depth(BinanceDepth),
    #[serde(rename = "24hrTicker")]
    Ticker(BinanceTicker),
    #[serde(rename = "markPriceUpdate")]
    MarkPrice(BinanceMarkPrice),
}

/// ### Raw Payload Example
/// ```json
/// {
///     "e":"aggTrade","E":1749354825205,"a":26129,"s":"BTCUSDT",
///     "p":"0.001","q":"100","f":100,"l":105,"T":1749354825200,"m":true
/// }
/// ```
#[derive(Debug, Deserialize)]
struct BinanceAggTrade {
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "a")]
    id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    amount: Decimal,
    #[serde(rename = "T", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Partial book depth update (top 5/20 levels, 100ms cadence). Treated as a snapshot of the
/// visible top of book.
///
/// ### Raw Payload Example
/// ```json
/// {
///     "e":"depthUpdate","E":1749354825205,"T":1749354825200,"s":"BTCUSDT",
///     "U":157,"u":160,"pu":149,
///     "b":[["25100.5","1.5"]],"a":[["25101.0","2.0"]]
/// }
/// ```
#[derive(Debug, Deserialize)]
struct BinanceDepth {
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "T", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

/// ### Raw Payload Example
/// ```json
/// {
///     "e":"24hrTicker","E":1749354825205,"s":"BTCUSDT","p":"250.5","P":"1.02",
///     "c":"25100.5","v":"120034.1","q":"3012345678.0"
/// }
/// ```
#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
    #[serde(rename = "c")]
    last_price: Decimal,
    #[serde(rename = "v")]
    volume_24h: Decimal,
}

/// Mark price + funding-rate update. Normalises into *two* events: a mark-price record and a
/// funding record.
///
/// ### Raw Payload Example
/// ```json
/// {
///     "e":"markPriceUpdate","E":1749354825205,"s":"BTCUSDT","p":"25100.50",
///     "i":"25099.80","P":"25101.1","r":"0.00010000","T":1749360000000
/// }
/// ```
#[derive(Debug, Deserialize)]
struct BinanceMarkPrice {
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
    #[serde(rename = "p")]
    mark_price: Decimal,
    #[serde(rename = "i")]
    index_price: Option<Decimal>,
    #[serde(rename = "r")]
    funding_rate: Decimal,
    #[serde(rename = "T", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    next_funding_time: DateTime<Utc>,
}

/// Top-level Binance frame: either a combined-stream data message or a subscription ack.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BinancePayload {
    Combined(BinanceCombinedStream),
    Ack(BinanceSubResponse),
}

/// Decode one Binance payload into zero or more normalised [`MarketEvent`]s.
pub fn parse(payload: &str) -> Result<Vec<MarketEvent>, DataError> {
    let frame =
        serde_json::from_str::<BinancePayload>(payload).map_err(|error| SocketError::Deserialise {
            error,
            payload: payload.to_owned(),
        })?;

    match frame {
        BinancePayload::Ack(response) => {
            response.validate().map_err(|error| DataError::Subscription {
                exchange: ExchangeId::Binance,
                message: error.to_string(),
            })?;
            Ok(vec![])
        }
        BinancePayload::Combined(combined) => Ok(normalise(combined.data)),
    }
}

fn normalise(message: BinanceMessage) -> Vec<MarketEvent> {
    let time_received = Utc::now();
    let event = |time_exchange, market: &str, kind| MarketEvent {
        time_exchange,
        time_received,
        exchange: ExchangeId::Binance,
        symbol: canonical_symbol(market),
        kind,
    };

    match message {
        BinanceMessage::AggTrade(trade) => vec![event(
            trade.time,
            &trade.market,
            DataKind::Trade(PublicTrade {
                id: trade.id.to_string(),
                price: trade.price,
                amount: trade.amount,
                // buyer_is_maker => the seller crossed the spread
                side: if trade.buyer_is_maker {
                    Side::Sell
                } else {
                    Side::Buy
                },
            }),
        )],
        BinanceMessage::Depth(depth) => vec![event(
            depth.time,
            &depth.market,
            DataKind::Depth(DepthUpdate {
                kind: DepthKind::Snapshot,
                bids: depth.bids.into_iter().map(Level::from).collect(),
                asks: depth.asks.into_iter().map(Level::from).collect(),
            }),
        )],
        BinanceMessage::Ticker(ticker) => vec![event(
            ticker.time,
            &ticker.market,
            DataKind::Ticker(Ticker {
                last_price: ticker.last_price,
                best_bid: None,
                best_ask: None,
                volume_24h: Some(ticker.volume_24h),
            }),
        )],
        BinanceMessage::MarkPrice(mark) => vec![
            event(
                mark.time,
                &mark.market,
                DataKind::MarkPrice(MarkPriceUpdate {
                    mark_price: mark.mark_price,
                    index_price: mark.index_price,
                }),
            ),
            event(
                mark.time,
                &mark.market,
                DataKind::Funding(FundingRate {
                    rate: mark.funding_rate,
                    predicted_rate: None,
                    mark_price: Some(mark.mark_price),
                    next_funding_time: Some(mark.next_funding_time),
                }),
            ),
        ],
    }
}

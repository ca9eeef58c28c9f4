use crate::{
    error::DataError,
    event::{
        DataKind, DepthKind, DepthUpdate, FundingRate, Level, MarkPriceUpdate, MarketEvent,
        PublicTrade, Ticker,
    },
    exchange::Channel,
};
use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use carry_integration::{
    Validator,
    de::{de_opt_str_epoch_ms_as_datetime_utc, de_u64_epoch_ms_as_datetime_utc},
    error::SocketError,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// [`Bybit`](https://bybit-exchange.github.io/docs/v5/ws/connect) V5 linear (USDT perpetual)
/// public stream base url.
pub const BASE_URL_BYBIT_LINEAR: &str = "wss://stream.bybit.com/v5/public/linear";

/// Venue-native market identifier, eg/ "BTCUSDT" for canonical "BTC/USDT:USDT".
pub fn native_symbol(symbol: &Symbol) -> String {
    format!("{}{}", symbol.base(), symbol.quote())
}

/// Canonical [`Symbol`] recovered from a venue-native identifier.
pub fn canonical_symbol(native: &str) -> Symbol {
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = native.strip_suffix(quote)
            && !base.is_empty()
        {
            return Symbol::new(format!("{base}/{quote}"));
        }
    }
    Symbol::new(native)
}

/// Topic name for a `(Symbol, Channel)` pair.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/orderbook>
fn topic(symbol: &Symbol, channel: Channel) -> String {
    let market = native_symbol(symbol);
    match channel {
        // Funding and mark price arrive on the tickers topic
        Channel::Ticker | Channel::MarkPrice | Channel::Funding => format!("tickers.{market}"),
        Channel::Depth5 => format!("orderbook.1.{market}"),
        Channel::Depth20 => format!("orderbook.50.{market}"),
        Channel::Trades => format!("publicTrade.{market}"),
    }
}

/// Build `subscribe`/`unsubscribe` payloads for the provided symbols and channels.
///
/// ### Payload Example
/// ```json
/// {"op":"subscribe","args":["tickers.BTCUSDT","publicTrade.BTCUSDT"]}
/// ```
pub fn subscribe_payloads(
    symbols: &[Symbol],
    channels: &[Channel],
    subscribe: bool,
) -> Vec<String> {
    let args = symbols
        .iter()
        .cartesian_product(channels.iter())
        .map(|(symbol, channel)| topic(symbol, *channel))
        .unique()
        .collect::<Vec<_>>();

    if args.is_empty() {
        return vec![];
    }

    vec![
        json!({
            "op": if subscribe { "subscribe" } else { "unsubscribe" },
            "args": args,
        })
        .to_string(),
    ]
}

/// Bybit subscription / operation response message.
///
/// ### Raw Payload Examples
/// #### Subscription Success
/// ```json
/// {"success":true,"ret_msg":"","op":"subscribe","conn_id":"..."}
/// ```
/// #### Subscription Failure
/// ```json
/// {"success":false,"ret_msg":"error:handler not found","op":"subscribe"}
/// ```
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct BybitSubResponse {
    success: bool,
    #[serde(default)]
    ret_msg: String,
}

impl Validator for BybitSubResponse {
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized,
    {
        if self.success {
            Ok(self)
        } else {
            Err(SocketError::Subscribe(format!(
                "received failure subscription response: {}",
                self.ret_msg
            )))
        }
    }
}

/// Bybit topic-routed data envelope.
#[derive(Debug, Deserialize)]
struct BybitEnvelope {
    topic: String,
    #[serde(rename = "type", default)]
    message_type: Option<String>,
    #[serde(rename = "ts", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
    data: serde_json::Value,
}

/// ### Raw Payload Example
/// ```json
/// {"T":1749354825200,"s":"BTCUSDT","S":"Buy","v":"0.005","p":"25100.5","i":"8872b307-..."}
/// ```
#[derive(Debug, Deserialize)]
struct BybitTrade {
    #[serde(rename = "T", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "v")]
    amount: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "i")]
    id: String,
}

/// ### Raw Payload Example
/// ```json
/// {"s":"BTCUSDT","b":[["25100.5","1.5"]],"a":[["25101.0","2.0"]],"u":18521288,"seq":7961638724}
/// ```
#[derive(Debug, Deserialize)]
struct BybitOrderBook {
    #[serde(rename = "s")]
    market: String,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

/// Linear ticker payload. Delta messages omit unchanged fields, hence the pervasive `Option`s.
///
/// ### Raw Payload Example
/// ```json
/// {
///     "symbol":"BTCUSDT","lastPrice":"25100.5","bid1Price":"25100.0","ask1Price":"25101.0",
///     "markPrice":"25100.8","indexPrice":"25099.9","fundingRate":"0.0001",
///     "nextFundingTime":"1749360000000","volume24h":"120034.1"
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    symbol: String,
    last_price: Option<Decimal>,
    bid1_price: Option<Decimal>,
    ask1_price: Option<Decimal>,
    mark_price: Option<Decimal>,
    index_price: Option<Decimal>,
    funding_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_str_epoch_ms_as_datetime_utc")]
    next_funding_time: Option<DateTime<Utc>>,
    #[serde(rename = "volume24h")]
    volume_24h: Option<Decimal>,
}

/// Top-level Bybit frame: either a topic-routed data envelope or an operation ack.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BybitPayload {
    Data(BybitEnvelope),
    Ack(BybitSubResponse),
}

/// Decode one Bybit payload into zero or more normalised [`MarketEvent`]s.
pub fn parse(payload: &str) -> Result<Vec<MarketEvent>, DataError> {
    let frame =
        serde_json::from_str::<BybitPayload>(payload).map_err(|error| SocketError::Deserialise {
            error,
            payload: payload.to_owned(),
        })?;

    match frame {
        BybitPayload::Ack(response) => {
            response.validate().map_err(|error| DataError::Subscription {
                exchange: ExchangeId::Bybit,
                message: error.to_string(),
            })?;
            Ok(vec![])
        }
        BybitPayload::Data(envelope) => normalise(envelope),
    }
}

fn normalise(envelope: BybitEnvelope) -> Result<Vec<MarketEvent>, DataError> {
    let time_received = Utc::now();
    let deserialise = |error: serde_json::Error, payload: &serde_json::Value| {
        DataError::Socket(SocketError::Deserialise {
            error,
            payload: payload.to_string(),
        })
    };

    if envelope.topic.starts_with("publicTrade.") {
        let trades = Vec::<BybitTrade>::deserialize(&envelope.data)
            .map_err(|error| deserialise(error, &envelope.data))?;

        return Ok(trades
            .into_iter()
            .map(|trade| MarketEvent {
                time_exchange: trade.time,
                time_received,
                exchange: ExchangeId::Bybit,
                symbol: canonical_symbol(&trade.market),
                kind: DataKind::Trade(PublicTrade {
                    id: trade.id,
                    price: trade.price,
                    amount: trade.amount,
                    side: trade.side,
                }),
            })
            .collect());
    }

    if envelope.topic.starts_with("orderbook.") {
        let book = BybitOrderBook::deserialize(&envelope.data)
            .map_err(|error| deserialise(error, &envelope.data))?;

        let kind = match envelope.message_type.as_deref() {
            Some("delta") => DepthKind::Delta,
            _ => DepthKind::Snapshot,
        };

        return Ok(vec![MarketEvent {
            time_exchange: envelope.time,
            time_received,
            exchange: ExchangeId::Bybit,
            symbol: canonical_symbol(&book.market),
            kind: DataKind::Depth(DepthUpdate {
                kind,
                bids: book.bids.into_iter().map(Level::from).collect(),
                asks: book.asks.into_iter().map(Level::from).collect(),
            }),
        }]);
    }

    if envelope.topic.starts_with("tickers.") {
        let ticker = BybitTicker::deserialize(&envelope.data)
            .map_err(|error| deserialise(error, &envelope.data))?;

        let symbol = canonical_symbol(&ticker.symbol);
        let mut events = Vec::with_capacity(3);

        if let Some(last_price) = ticker.last_price {
            events.push(MarketEvent {
                time_exchange: envelope.time,
                time_received,
                exchange: ExchangeId::Bybit,
                symbol: symbol.clone(),
                kind: DataKind::Ticker(Ticker {
                    last_price,
                    best_bid: ticker.bid1_price,
                    best_ask: ticker.ask1_price,
                    volume_24h: ticker.volume_24h,
                }),
            });
        }
        if let Some(mark_price) = ticker.mark_price {
            events.push(MarketEvent {
                time_exchange: envelope.time,
                time_received,
                exchange: ExchangeId::Bybit,
                symbol: symbol.clone(),
                kind: DataKind::MarkPrice(MarkPriceUpdate {
                    mark_price,
                    index_price: ticker.index_price,
                }),
            });
        }
        if let Some(rate) = ticker.funding_rate {
            events.push(MarketEvent {
                time_exchange: envelope.time,
                time_received,
                exchange: ExchangeId::Bybit,
                symbol,
                kind: DataKind::Funding(FundingRate {
                    rate,
                    predicted_rate: None,
                    mark_price: ticker.mark_price,
                    next_funding_time: ticker.next_funding_time,
                }),
            });
        }

        return Ok(events);
    }

    Err(DataError::Unidentifiable {
        exchange: ExchangeId::Bybit,
        payload: envelope.topic,
    })
}

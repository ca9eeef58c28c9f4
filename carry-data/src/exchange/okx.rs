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
    de::{de_opt_str_epoch_ms_as_datetime_utc, de_str_epoch_ms_as_datetime_utc},
    error::SocketError,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// [`Okx`](https://www.okx.com/docs-v5/en/#overview-websocket) V5 public stream base url.
pub const BASE_URL_OKX: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// Venue-native instrument identifier, eg/ "BTC-USDT-SWAP" for canonical "BTC/USDT:USDT".
pub fn native_symbol(symbol: &Symbol) -> String {
    format!("{}-{}-SWAP", symbol.base(), symbol.quote())
}

/// Canonical [`Symbol`] recovered from a venue-native `instId`.
pub fn canonical_symbol(native: &str) -> Symbol {
    let spot = native.strip_suffix("-SWAP").unwrap_or(native);
    match spot.split_once('-') {
        Some((base, quote)) => Symbol::new(format!("{base}/{quote}")),
        None => Symbol::new(native),
    }
}

/// Channel name for the provided canonical [`Channel`].
///
/// See docs: <https://www.okx.com/docs-v5/en/#public-data-websocket>
fn channel_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Ticker => "tickers",
        Channel::Depth5 => "books5",
        Channel::Depth20 => "books",
        Channel::Trades => "trades",
        Channel::MarkPrice => "mark-price",
        Channel::Funding => "funding-rate",
    }
}

/// Build `subscribe`/`unsubscribe` payloads for the provided symbols and channels.
///
/// ### Payload Example
/// ```json
/// {"op":"subscribe","args":[{"channel":"tickers","instId":"BTC-USDT-SWAP"}]}
/// ```
pub fn subscribe_payloads(
    symbols: &[Symbol],
    channels: &[Channel],
    subscribe: bool,
) -> Vec<String> {
    let args = symbols
        .iter()
        .cartesian_product(channels.iter())
        .map(|(symbol, channel)| {
            json!({
                "channel": channel_name(*channel),
                "instId": native_symbol(symbol),
            })
        })
        .unique_by(|arg| arg.to_string())
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

/// OKX event / subscription response message.
///
/// ### Raw Payload Examples
/// #### Subscription Success
/// ```json
/// {"event":"subscribe","arg":{"channel":"tickers","instId":"BTC-USDT-SWAP"},"connId":"a4d3ae55"}
/// ```
/// #### Subscription Failure
/// ```json
/// {"event":"error","code":"60012","msg":"Invalid request","connId":"a4d3ae55"}
/// ```
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct OkxSubResponse {
    event: String,
    #[serde(default)]
    msg: String,
}

impl Validator for OkxSubResponse {
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized,
    {
        if self.event != "error" {
            Ok(self)
        } else {
            Err(SocketError::Subscribe(format!(
                "received failure subscription response: {}",
                self.msg
            )))
        }
    }
}

/// Routing argument attached to every OKX data frame.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
struct OkxArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

/// OKX channel-routed data envelope.
#[derive(Debug, Deserialize)]
struct OkxEnvelope {
    arg: OkxArg,
    #[serde(default)]
    action: Option<String>,
    data: serde_json::Value,
}

/// ### Raw Payload Example
/// ```json
/// {"instId":"BTC-USDT-SWAP","tradeId":"130639474","px":"25100.5","sz":"0.005","side":"sell","ts":"1749354825200"}
/// ```
#[derive(Debug, Deserialize)]
struct OkxTrade {
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(rename = "px")]
    price: Decimal,
    #[serde(rename = "sz")]
    amount: Decimal,
    side: Side,
    #[serde(deserialize_with = "de_str_epoch_ms_as_datetime_utc")]
    ts: DateTime<Utc>,
}

/// OKX book levels carry `[price, size, liquidatedOrders, numOrders]`; only the first two are
/// meaningful here.
#[derive(Debug, Deserialize)]
struct OkxBookData {
    bids: Vec<Vec<Decimal>>,
    asks: Vec<Vec<Decimal>>,
    #[serde(deserialize_with = "de_str_epoch_ms_as_datetime_utc")]
    ts: DateTime<Utc>,
}

/// ### Raw Payload Example
/// ```json
/// {"instId":"BTC-USDT-SWAP","last":"25100.5","bidPx":"25100.0","askPx":"25101.0","vol24h":"120034","ts":"1749354825200"}
/// ```
#[derive(Debug, Deserialize)]
struct OkxTicker {
    last: Decimal,
    #[serde(rename = "bidPx")]
    bid_price: Option<Decimal>,
    #[serde(rename = "askPx")]
    ask_price: Option<Decimal>,
    #[serde(rename = "vol24h")]
    volume_24h: Option<Decimal>,
    #[serde(deserialize_with = "de_str_epoch_ms_as_datetime_utc")]
    ts: DateTime<Utc>,
}

/// ### Raw Payload Example
/// ```json
/// {"instId":"BTC-USDT-SWAP","fundingRate":"0.0001","nextFundingRate":"0.00012","fundingTime":"1749360000000"}
/// ```
#[derive(Debug, Deserialize)]
struct OkxFundingRate {
    #[serde(rename = "fundingRate")]
    funding_rate: Decimal,
    #[serde(rename = "nextFundingRate", default)]
    next_funding_rate: Option<Decimal>,
    #[serde(rename = "fundingTime", default, deserialize_with = "de_opt_str_epoch_ms_as_datetime_utc")]
    funding_time: Option<DateTime<Utc>>,
}

/// ### Raw Payload Example
/// ```json
/// {"instId":"BTC-USDT-SWAP","markPx":"25100.8","ts":"1749354825200"}
/// ```
#[derive(Debug, Deserialize)]
struct OkxMarkPrice {
    #[serde(rename = "markPx")]
    mark_price: Decimal,
    #[serde(deserialize_with = "de_str_epoch_ms_as_datetime_utc")]
    ts: DateTime<Utc>,
}

/// Top-level OKX frame: either a channel-routed data envelope or an event/subscription ack.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OkxPayload {
    Data(OkxEnvelope),
    Ack(OkxSubResponse),
}

/// Decode one OKX payload into zero or more normalised [`MarketEvent`]s.
pub fn parse(payload: &str) -> Result<Vec<MarketEvent>, DataError> {
    let frame =
        serde_json::from_str::<OkxPayload>(payload).map_err(|error| SocketError::Deserialise {
            error,
            payload: payload.to_owned(),
        })?;

    match frame {
        OkxPayload::Ack(response) => {
            response.validate().map_err(|error| DataError::Subscription {
                exchange: ExchangeId::Okx,
                message: error.to_string(),
            })?;
            Ok(vec![])
        }
        OkxPayload::Data(envelope) => normalise(envelope),
    }
}

fn normalise(envelope: OkxEnvelope) -> Result<Vec<MarketEvent>, DataError> {
    let time_received = Utc::now();
    let symbol = canonical_symbol(&envelope.arg.inst_id);
    let deserialise = |error: serde_json::Error, payload: &serde_json::Value| {
        DataError::Socket(SocketError::Deserialise {
            error,
            payload: payload.to_string(),
        })
    };

    match envelope.arg.channel.as_str() {
        "trades" => {
            let trades = Vec::<OkxTrade>::deserialize(&envelope.data)
                .map_err(|error| deserialise(error, &envelope.data))?;

            Ok(trades
                .into_iter()
                .map(|trade| MarketEvent {
                    time_exchange: trade.ts,
                    time_received,
                    exchange: ExchangeId::Okx,
                    symbol: symbol.clone(),
                    kind: DataKind::Trade(PublicTrade {
                        id: trade.trade_id,
                        price: trade.price,
                        amount: trade.amount,
                        side: trade.side,
                    }),
                })
                .collect())
        }
        "books5" | "books" => {
            let books = Vec::<OkxBookData>::deserialize(&envelope.data)
                .map_err(|error| deserialise(error, &envelope.data))?;

            // books5 is always a snapshot; books signals snapshot vs update via `action`
            let kind = match (envelope.arg.channel.as_str(), envelope.action.as_deref()) {
                ("books", Some("update")) => DepthKind::Delta,
                _ => DepthKind::Snapshot,
            };

            Ok(books
                .into_iter()
                .map(|book| MarketEvent {
                    time_exchange: book.ts,
                    time_received,
                    exchange: ExchangeId::Okx,
                    symbol: symbol.clone(),
                    kind: DataKind::Depth(DepthUpdate {
                        kind,
                        bids: book.bids.iter().filter_map(|level| level_from_okx(level)).collect(),
                        asks: book.asks.iter().filter_map(|level| level_from_okx(level)).collect(),
                    }),
                })
                .collect())
        }
        "tickers" => {
            let tickers = Vec::<OkxTicker>::deserialize(&envelope.data)
                .map_err(|error| deserialise(error, &envelope.data))?;

            Ok(tickers
                .into_iter()
                .map(|ticker| MarketEvent {
                    time_exchange: ticker.ts,
                    time_received,
                    exchange: ExchangeId::Okx,
                    symbol: symbol.clone(),
                    kind: DataKind::Ticker(Ticker {
                        last_price: ticker.last,
                        best_bid: ticker.bid_price,
                        best_ask: ticker.ask_price,
                        volume_24h: ticker.volume_24h,
                    }),
                })
                .collect())
        }
        "funding-rate" => {
            let rates = Vec::<OkxFundingRate>::deserialize(&envelope.data)
                .map_err(|error| deserialise(error, &envelope.data))?;

            Ok(rates
                .into_iter()
                .map(|rate| MarketEvent {
                    time_exchange: rate.funding_time.unwrap_or(time_received),
                    time_received,
                    exchange: ExchangeId::Okx,
                    symbol: symbol.clone(),
                    kind: DataKind::Funding(FundingRate {
                        rate: rate.funding_rate,
                        predicted_rate: rate.next_funding_rate,
                        mark_price: None,
                        next_funding_time: rate.funding_time,
                    }),
                })
                .collect())
        }
        "mark-price" => {
            let marks = Vec::<OkxMarkPrice>::deserialize(&envelope.data)
                .map_err(|error| deserialise(error, &envelope.data))?;

            Ok(marks
                .into_iter()
                .map(|mark| MarketEvent {
                    time_exchange: mark.ts,
                    time_received,
                    exchange: ExchangeId::Okx,
                    symbol: symbol.clone(),
                    kind: DataKind::MarkPrice(MarkPriceUpdate {
                        mark_price: mark.mark_price,
                        index_price: None,
                    }),
                })
                .collect())
        }
        _ => Err(DataError::Unidentifiable {
            exchange: ExchangeId::Okx,
            payload: envelope.arg.channel,
        }),
    }
}

fn level_from_okx(level: &[Decimal]) -> Option<Level> {
    match level {
        [price, amount, ..] => Some(Level {
            price: *price,
            amount: *amount,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_native_symbol_round_trip() {
        let symbol = Symbol::new("BTC/USDT:USDT");
        assert_eq!(native_symbol(&symbol), "BTC-USDT-SWAP");
        assert_eq!(canonical_symbol("BTC-USDT-SWAP"), symbol);
    }

    #[test]
    fn test_subscribe_payload_envelope() {
        let payloads = subscribe_payloads(
            &[Symbol::new("BTC/USDT:USDT")],
            &[Channel::Ticker, Channel::Funding],
            true,
        );
        assert_eq!(payloads.len(), 1);

        let value = serde_json::from_str::<serde_json::Value>(&payloads[0]).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "tickers");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT-SWAP");
        assert_eq!(value["args"][1]["channel"], "funding-rate");
    }

    #[test]
    fn test_parse_trades() {
        let payload = r#"{
            "arg":{"channel":"trades","instId":"BTC-USDT-SWAP"},
            "data":[
                {"instId":"BTC-USDT-SWAP","tradeId":"130639474","px":"25100.5","sz":"0.005","side":"sell","ts":"1749354825200"}
            ]
        }"#;

        let events = parse(payload).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, Symbol::new("BTC/USDT:USDT"));
        let DataKind::Trade(trade) = &events[0].kind else {
            panic!("expected Trade, got {:?}", events[0].kind);
        };
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.price, dec!(25100.5));
    }

    #[test]
    fn test_parse_books5_snapshot() {
        let payload = r#"{
            "arg":{"channel":"books5","instId":"BTC-USDT-SWAP"},
            "data":[{
                "asks":[["25101.0","2.0","0","4"]],
                "bids":[["25100.5","1.5","0","2"]],
                "ts":"1749354825200","seqId":123
            }]
        }"#;

        let events = parse(payload).unwrap();
        let DataKind::Depth(depth) = &events[0].kind else {
            panic!("expected Depth, got {:?}", events[0].kind);
        };
        assert_eq!(depth.kind, DepthKind::Snapshot);
        assert_eq!(depth.asks, vec![Level::new(dec!(25101.0), dec!(2.0))]);
        assert_eq!(depth.bids, vec![Level::new(dec!(25100.5), dec!(1.5))]);
    }

    #[test]
    fn test_parse_books_update_is_delta() {
        let payload = r#"{
            "arg":{"channel":"books","instId":"BTC-USDT-SWAP"},
            "action":"update",
            "data":[{
                "asks":[["25101.0","0","0","0"]],
                "bids":[],
                "ts":"1749354825200","seqId":124
            }]
        }"#;

        let events = parse(payload).unwrap();
        let DataKind::Depth(depth) = &events[0].kind else {
            panic!("expected Depth, got {:?}", events[0].kind);
        };
        assert_eq!(depth.kind, DepthKind::Delta);
        assert_eq!(depth.asks, vec![Level::new(dec!(25101.0), dec!(0))]);
    }

    #[test]
    fn test_parse_funding_rate() {
        let payload = r#"{
            "arg":{"channel":"funding-rate","instId":"BTC-USDT-SWAP"},
            "data":[
                {"instId":"BTC-USDT-SWAP","fundingRate":"0.0001","nextFundingRate":"0.00012","fundingTime":"1749360000000"}
            ]
        }"#;

        let events = parse(payload).unwrap();
        let DataKind::Funding(funding) = &events[0].kind else {
            panic!("expected Funding, got {:?}", events[0].kind);
        };
        assert_eq!(funding.rate, dec!(0.0001));
        assert_eq!(funding.predicted_rate, Some(dec!(0.00012)));
    }

    #[test]
    fn test_parse_ack_and_error() {
        assert!(
            parse(r#"{"event":"subscribe","arg":{"channel":"tickers","instId":"BTC-USDT-SWAP"},"connId":"a4d3ae55"}"#)
                .unwrap()
                .is_empty()
        );
        assert!(parse(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#).is_err());
    }
}

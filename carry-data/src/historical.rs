use crate::{
    error::DataError,
    event::{
        DataKind, DepthKind, DepthUpdate, FundingRate, Kline, Level, MarkPriceUpdate,
        MarketEvent, PublicTrade,
    },
};
use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Offset applied to kline open times so a final one-minute kline sorts *after* the
/// intra-minute events it summarises: `open_time + 60s - 1ms`.
pub const KLINE_TIME_SHIFT_MS: u64 = 59_999;

/// Default row limit per storage batch.
pub const DEFAULT_BATCH_LIMIT: usize = 10_000;

/// Row of the `agg_trades` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AggTradeRow {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timestamp: u64,
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub is_sell: bool,
}

/// Row of the `depth_snapshots` table. `bids`/`asks` hold JSON arrays of `[price, qty]` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DepthSnapshotRow {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timestamp: u64,
    pub bids: String,
    pub asks: String,
}

/// Row of the `funding_rates` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FundingRateRow {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub funding_time: u64,
    pub funding_rate: Decimal,
    pub mark_price: Option<Decimal>,
}

/// Row of the `mark_prices` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MarkPriceRow {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timestamp: u64,
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
}

/// Row of the `klines` table (one-minute candles).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KlineRow {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub open_time: u64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: u64,
}

/// Bounded-batch query issued against an [`EventStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreQuery<'a> {
    pub exchanges: &'a [ExchangeId],
    pub symbols: &'a [Symbol],
    /// Inclusive start, exclusive end, both epoch milliseconds.
    pub start_ms: u64,
    pub end_ms: u64,
    pub offset: usize,
    pub limit: usize,
}

/// Which event types the loader materialises.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventTypeFilter {
    pub trades: bool,
    pub depth: bool,
    pub funding: bool,
    pub mark_prices: bool,
    pub klines: bool,
}

impl Default for EventTypeFilter {
    fn default() -> Self {
        Self {
            trades: true,
            depth: true,
            funding: true,
            mark_prices: true,
            klines: true,
        }
    }
}

/// Contract of the external tabular store holding recorded market history.
///
/// Each method returns one bounded batch of rows ordered by timestamp; the loader pages with
/// `offset` until a short batch signals exhaustion.
pub trait EventStore {
    fn agg_trades(&self, query: &StoreQuery<'_>) -> Result<Vec<AggTradeRow>, DataError>;
    fn depth_snapshots(&self, query: &StoreQuery<'_>) -> Result<Vec<DepthSnapshotRow>, DataError>;
    fn funding_rates(&self, query: &StoreQuery<'_>) -> Result<Vec<FundingRateRow>, DataError>;
    fn mark_prices(&self, query: &StoreQuery<'_>) -> Result<Vec<MarkPriceRow>, DataError>;
    fn klines(&self, query: &StoreQuery<'_>) -> Result<Vec<KlineRow>, DataError>;
}

/// Load every enabled event type for the requested markets and time range, returning events
/// sorted by timestamp (stable, preserving per-batch order on ties).
pub fn load_events<Store>(
    store: &Store,
    exchanges: &[ExchangeId],
    symbols: &[Symbol],
    start_ms: u64,
    end_ms: u64,
    filter: EventTypeFilter,
    batch_limit: usize,
) -> Result<Vec<MarketEvent>, DataError>
where
    Store: EventStore,
{
    let mut events = Vec::new();

    if filter.trades {
        page(store, exchanges, symbols, start_ms, end_ms, batch_limit, &mut events, |store, query| {
            Ok(store
                .agg_trades(query)?
                .into_iter()
                .map(agg_trade_event)
                .collect())
        })?;
    }
    if filter.depth {
        page(store, exchanges, symbols, start_ms, end_ms, batch_limit, &mut events, |store, query| {
            Ok(store
                .depth_snapshots(query)?
                .into_iter()
                .map(depth_event)
                .collect())
        })?;
    }
    if filter.funding {
        page(store, exchanges, symbols, start_ms, end_ms, batch_limit, &mut events, |store, query| {
            Ok(store
                .funding_rates(query)?
                .into_iter()
                .map(funding_event)
                .collect())
        })?;
    }
    if filter.mark_prices {
        page(store, exchanges, symbols, start_ms, end_ms, batch_limit, &mut events, |store, query| {
            Ok(store
                .mark_prices(query)?
                .into_iter()
                .map(mark_price_event)
                .collect())
        })?;
    }
    if filter.klines {
        page(store, exchanges, symbols, start_ms, end_ms, batch_limit, &mut events, |store, query| {
            Ok(store.klines(query)?.into_iter().map(kline_event).collect())
        })?;
    }

    events.sort_by_key(MarketEvent::timestamp_ms);
    Ok(events)
}

fn page<Store, FnBatch>(
    store: &Store,
    exchanges: &[ExchangeId],
    symbols: &[Symbol],
    start_ms: u64,
    end_ms: u64,
    batch_limit: usize,
    events: &mut Vec<MarketEvent>,
    mut fetch: FnBatch,
) -> Result<(), DataError>
where
    Store: EventStore,
    FnBatch: FnMut(&Store, &StoreQuery<'_>) -> Result<Vec<MarketEvent>, DataError>,
{
    let mut offset = 0;
    loop {
        let query = StoreQuery {
            exchanges,
            symbols,
            start_ms,
            end_ms,
            offset,
            limit: batch_limit,
        };
        let batch = fetch(store, &query)?;
        let batch_len = batch.len();
        events.extend(batch);

        if batch_len < batch_limit {
            return Ok(());
        }
        offset += batch_len;
    }
}

fn time_from_ms(millis: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis as i64).unwrap_or_default()
}

fn agg_trade_event(row: AggTradeRow) -> MarketEvent {
    let time = time_from_ms(row.timestamp);
    MarketEvent {
        time_exchange: time,
        time_received: time,
        exchange: row.exchange,
        symbol: row.symbol,
        kind: DataKind::Trade(PublicTrade {
            id: row.trade_id.to_string(),
            price: row.price,
            amount: row.quantity,
            side: if row.is_sell { Side::Sell } else { Side::Buy },
        }),
    }
}

/// Parse one stored depth side; a malformed payload yields an empty side with a warning, never
/// an aborted load.
fn parse_depth_side(payload: &str, row: &DepthSnapshotRow, side: &str) -> Vec<Level> {
    match serde_json::from_str::<Vec<(Decimal, Decimal)>>(payload) {
        Ok(levels) => levels.into_iter().map(Level::from).collect(),
        Err(error) => {
            warn!(
                exchange = %row.exchange,
                symbol = %row.symbol,
                timestamp = row.timestamp,
                side,
                %error,
                "malformed depth payload - substituting empty side"
            );
            vec![]
        }
    }
}

fn depth_event(row: DepthSnapshotRow) -> MarketEvent {
    let time = time_from_ms(row.timestamp);
    let bids = parse_depth_side(&row.bids, &row, "bids");
    let asks = parse_depth_side(&row.asks, &row, "asks");
    MarketEvent {
        time_exchange: time,
        time_received: time,
        exchange: row.exchange,
        symbol: row.symbol,
        kind: DataKind::Depth(DepthUpdate {
            kind: DepthKind::Snapshot,
            bids,
            asks,
        }),
    }
}

fn funding_event(row: FundingRateRow) -> MarketEvent {
    let time = time_from_ms(row.funding_time);
    MarketEvent {
        time_exchange: time,
        time_received: time,
        exchange: row.exchange,
        symbol: row.symbol,
        kind: DataKind::Funding(FundingRate {
            rate: row.funding_rate,
            predicted_rate: None,
            mark_price: row.mark_price,
            next_funding_time: None,
        }),
    }
}

fn mark_price_event(row: MarkPriceRow) -> MarketEvent {
    let time = time_from_ms(row.timestamp);
    MarketEvent {
        time_exchange: time,
        time_received: time,
        exchange: row.exchange,
        symbol: row.symbol,
        kind: DataKind::MarkPrice(MarkPriceUpdate {
            mark_price: row.mark_price,
            index_price: row.index_price,
        }),
    }
}

fn kline_event(row: KlineRow) -> MarketEvent {
    // Shift so the closed kline sorts after the intra-minute events it summarises
    let time = time_from_ms(row.open_time + KLINE_TIME_SHIFT_MS);
    MarketEvent {
        time_exchange: time,
        time_received: time,
        exchange: row.exchange,
        symbol: row.symbol,
        kind: DataKind::Kline(Kline {
            open_time: time_from_ms(row.open_time),
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            quote_volume: row.quote_volume,
            trades: row.trades,
            is_final: true,
        }),
    }
}

/// In-memory [`EventStore`] used by backtests and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    pub agg_trades: Vec<AggTradeRow>,
    pub depth_snapshots: Vec<DepthSnapshotRow>,
    pub funding_rates: Vec<FundingRateRow>,
    pub mark_prices: Vec<MarkPriceRow>,
    pub klines: Vec<KlineRow>,
}

fn select<Row>(
    rows: &[Row],
    query: &StoreQuery<'_>,
    exchange: impl Fn(&Row) -> ExchangeId,
    symbol: impl Fn(&Row) -> &Symbol,
    timestamp: impl Fn(&Row) -> u64,
) -> Vec<Row>
where
    Row: Clone,
{
    rows.iter()
        .filter(|row| query.exchanges.contains(&exchange(row)))
        .filter(|row| query.symbols.contains(symbol(row)))
        .filter(|row| {
            let time = timestamp(row);
            query.start_ms <= time && time < query.end_ms
        })
        .skip(query.offset)
        .take(query.limit)
        .cloned()
        .collect()
}

impl EventStore for MemoryEventStore {
    fn agg_trades(&self, query: &StoreQuery<'_>) -> Result<Vec<AggTradeRow>, DataError> {
        Ok(select(
            &self.agg_trades,
            query,
            |row| row.exchange,
            |row| &row.symbol,
            |row| row.timestamp,
        ))
    }

    fn depth_snapshots(&self, query: &StoreQuery<'_>) -> Result<Vec<DepthSnapshotRow>, DataError> {
        Ok(select(
            &self.depth_snapshots,
            query,
            |row| row.exchange,
            |row| &row.symbol,
            |row| row.timestamp,
        ))
    }

    fn funding_rates(&self, query: &StoreQuery<'_>) -> Result<Vec<FundingRateRow>, DataError> {
        Ok(select(
            &self.funding_rates,
            query,
            |row| row.exchange,
            |row| &row.symbol,
            |row| row.funding_time,
        ))
    }

    fn mark_prices(&self, query: &StoreQuery<'_>) -> Result<Vec<MarkPriceRow>, DataError> {
        Ok(select(
            &self.mark_prices,
            query,
            |row| row.exchange,
            |row| &row.symbol,
            |row| row.timestamp,
        ))
    }

    fn klines(&self, query: &StoreQuery<'_>) -> Result<Vec<KlineRow>, DataError> {
        Ok(select(
            &self.klines,
            query,
            |row| row.exchange,
            |row| &row.symbol,
            |row| row.open_time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn symbol() -> Symbol {
        Symbol::new("BTC/USDT:USDT")
    }

    fn store() -> MemoryEventStore {
        MemoryEventStore {
            agg_trades: vec![
                AggTradeRow {
                    exchange: ExchangeId::Binance,
                    symbol: symbol(),
                    timestamp: 1_000,
                    trade_id: 1,
                    price: dec!(100),
                    quantity: dec!(1),
                    is_sell: false,
                },
                AggTradeRow {
                    exchange: ExchangeId::Binance,
                    symbol: symbol(),
                    timestamp: 61_000,
                    trade_id: 2,
                    price: dec!(101),
                    quantity: dec!(2),
                    is_sell: true,
                },
            ],
            depth_snapshots: vec![DepthSnapshotRow {
                exchange: ExchangeId::Binance,
                symbol: symbol(),
                timestamp: 500,
                bids: r#"[["99.5","1.0"]]"#.to_owned(),
                asks: "not json".to_owned(),
            }],
            funding_rates: vec![],
            mark_prices: vec![],
            klines: vec![KlineRow {
                exchange: ExchangeId::Binance,
                symbol: symbol(),
                open_time: 0,
                open: dec!(100),
                high: dec!(102),
                low: dec!(99),
                close: dec!(101),
                volume: dec!(10),
                quote_volume: dec!(1000),
                trades: 5,
            }],
        }
    }

    #[test]
    fn test_load_events_sorted_with_kline_shift() {
        let events = load_events(
            &store(),
            &[ExchangeId::Binance],
            &[symbol()],
            0,
            120_000,
            EventTypeFilter::default(),
            DEFAULT_BATCH_LIMIT,
        )
        .unwrap();

        let timestamps = events
            .iter()
            .map(MarketEvent::timestamp_ms)
            .collect::<Vec<_>>();
        assert_eq!(timestamps, vec![500, 1_000, 59_999, 61_000]);

        // The minute-0 kline sorts after the minute-0 trade but before the minute-1 trade
        let DataKind::Kline(kline) = &events[2].kind else {
            panic!("expected Kline, got {:?}", events[2].kind);
        };
        assert_eq!(kline.open_time.timestamp_millis(), 0);
        assert!(kline.is_final);
    }

    #[test]
    fn test_malformed_depth_side_yields_empty_side() {
        let events = load_events(
            &store(),
            &[ExchangeId::Binance],
            &[symbol()],
            0,
            1_000,
            EventTypeFilter {
                trades: false,
                klines: false,
                ..EventTypeFilter::default()
            },
            DEFAULT_BATCH_LIMIT,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        let DataKind::Depth(depth) = &events[0].kind else {
            panic!("expected Depth, got {:?}", events[0].kind);
        };
        assert_eq!(depth.bids, vec![Level::new(dec!(99.5), dec!(1.0))]);
        assert!(depth.asks.is_empty());
    }

    #[test]
    fn test_bounded_batches_page_through_store() {
        let events = load_events(
            &store(),
            &[ExchangeId::Binance],
            &[symbol()],
            0,
            120_000,
            EventTypeFilter {
                depth: false,
                klines: false,
                ..EventTypeFilter::default()
            },
            // Force one row per batch
            1,
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp_ms() <= events[1].timestamp_ms());
    }

    #[test]
    fn test_time_range_is_half_open() {
        let events = load_events(
            &store(),
            &[ExchangeId::Binance],
            &[symbol()],
            1_000,
            61_000,
            EventTypeFilter {
                depth: false,
                klines: false,
                ..EventTypeFilter::default()
            },
            DEFAULT_BATCH_LIMIT,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp_ms(), 1_000);
    }
}

use crate::{
    error::DataError,
    event::{DataKind, MarketEvent},
    exchange::{self, Channel},
};
use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use carry_integration::{
    channel::{TxDroppable, UnboundedTx, mpsc_unbounded},
    subscription::SubscriptionId,
    supervisor::{ConnectionInfo, SupervisorEvent, VenueSocket, VenueSocketConfig, VenueSocketHandle},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

/// Configuration of the live [`MarketDataEngine`].
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub exchanges: Vec<ExchangeId>,
    pub socket: VenueSocketConfig,
    /// Broadcast buffer capacity; slow consumers observe `Lagged` rather than blocking ingest.
    pub event_capacity: usize,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            exchanges: carry_instrument::exchange::ALL_EXCHANGES.to_vec(),
            socket: VenueSocketConfig::default(),
            event_capacity: 8_192,
        }
    }
}

/// Per-subscription bookkeeping record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub channel: Channel,
    pub active: bool,
    pub subscribed_at: DateTime<Utc>,
    pub last_data_at: Option<DateTime<Utc>>,
    pub message_count: u64,
}

/// Indexed per-kind message counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct KindCounters {
    pub trades: u64,
    pub depth: u64,
    pub tickers: u64,
    pub funding: u64,
    pub mark_prices: u64,
    pub klines: u64,
}

impl KindCounters {
    fn record(&mut self, kind: &DataKind) {
        match kind {
            DataKind::Trade(_) => self.trades += 1,
            DataKind::Depth(_) => self.depth += 1,
            DataKind::Ticker(_) => self.tickers += 1,
            DataKind::Funding(_) => self.funding += 1,
            DataKind::MarkPrice(_) => self.mark_prices += 1,
            DataKind::Kline(_) => self.klines += 1,
        }
    }
}

/// Point-in-time statistics snapshot of the [`MarketDataEngine`].
#[derive(Debug, Clone)]
pub struct MarketDataStats {
    pub messages_total: u64,
    pub messages_by_kind: KindCounters,
    pub messages_by_exchange: FnvHashMap<ExchangeId, u64>,
    /// Message rate over the interval since the previous stats sample.
    pub messages_per_sec: f64,
    pub connections: Vec<(ExchangeId, ConnectionInfo)>,
    pub avg_processing_latency_us: f64,
    pub max_processing_latency_us: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    messages_total: u64,
    messages_by_kind: KindCounters,
    messages_by_exchange: FnvHashMap<ExchangeId, u64>,
    latency_sum_us: u128,
    latency_count: u64,
    latency_max_us: u64,
    window_count: u64,
    window_started: Option<Instant>,
}

/// Live market-data engine: owns one supervised socket per venue, normalises every inbound
/// frame and fans the typed events out to consumers.
///
/// Fan-out is two-channel: a `tokio::sync::broadcast` for in-process consumers, plus an
/// optional storage sink whose failure disables the sink without interrupting fan-out.
#[derive(Debug)]
pub struct MarketDataEngine {
    config: MarketDataConfig,
    sockets: FnvHashMap<ExchangeId, VenueSocketHandle>,
    subscriptions: Arc<RwLock<IndexMap<SubscriptionId, SubscriptionRecord>>>,
    stats: Arc<RwLock<StatsInner>>,
    events_tx: tokio::sync::broadcast::Sender<MarketEvent>,
    sink: Option<UnboundedTx<MarketEvent>>,
}

impl MarketDataEngine {
    pub fn new(config: MarketDataConfig) -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(config.event_capacity);
        Self {
            config,
            sockets: FnvHashMap::default(),
            subscriptions: Arc::new(RwLock::new(IndexMap::new())),
            stats: Arc::new(RwLock::new(StatsInner::default())),
            events_tx,
            sink: None,
        }
    }

    /// Attach an external storage sink receiving every normalised event. Sink failures never
    /// interrupt fan-out.
    pub fn with_storage_sink(mut self, sink: UnboundedTx<MarketEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Spawn one supervised socket per configured venue plus the shared processing task.
    pub fn start(&mut self) {
        let (supervisor_tx, supervisor_rx) = mpsc_unbounded();

        for exchange in self.config.exchanges.clone() {
            let handle = VenueSocket::spawn(
                exchange,
                exchange::stream_url(exchange).to_owned(),
                self.config.socket,
                supervisor_tx.clone(),
            );
            self.sockets.insert(exchange, handle);
        }

        tokio::spawn(process_task(
            supervisor_rx,
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.stats),
            self.events_tx.clone(),
            self.sink.clone().map(TxDroppable::new),
        ));

        info!(exchanges = ?self.config.exchanges, "MarketDataEngine started");
    }

    /// Subscribe the provided symbols and channels on one venue, registering the intent for
    /// replay-on-reconnect and bookkeeping.
    pub fn subscribe(
        &self,
        exchange: ExchangeId,
        symbols: &[Symbol],
        channels: &[Channel],
    ) -> Result<(), DataError> {
        let handle = self.socket(exchange)?;

        for payload in exchange::subscribe_payloads(exchange, symbols, channels) {
            handle.subscribe(payload);
        }

        let mut subscriptions = self.subscriptions.write();
        for symbol in symbols {
            for channel in channels {
                subscriptions
                    .entry(subscription_id(exchange, symbol, *channel))
                    .and_modify(|record| record.active = true)
                    .or_insert_with(|| SubscriptionRecord {
                        exchange,
                        symbol: symbol.clone(),
                        channel: *channel,
                        active: true,
                        subscribed_at: Utc::now(),
                        last_data_at: None,
                        message_count: 0,
                    });
            }
        }
        Ok(())
    }

    /// Unsubscribe the provided symbols and channels on one venue and deactivate their records.
    pub fn unsubscribe(
        &self,
        exchange: ExchangeId,
        symbols: &[Symbol],
        channels: &[Channel],
    ) -> Result<(), DataError> {
        let handle = self.socket(exchange)?;

        let unsubscribes = exchange::unsubscribe_payloads(exchange, symbols, channels);
        let subscribes = exchange::subscribe_payloads(exchange, symbols, channels);
        for (payload, remove) in unsubscribes.into_iter().zip(subscribes) {
            handle.unsubscribe(payload, remove);
        }

        let mut subscriptions = self.subscriptions.write();
        for symbol in symbols {
            for channel in channels {
                if let Some(record) =
                    subscriptions.get_mut(&subscription_id(exchange, symbol, *channel))
                {
                    record.active = false;
                }
            }
        }
        Ok(())
    }

    /// New broadcast receiver of normalised events.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<MarketEvent> {
        self.events_tx.subscribe()
    }

    /// Snapshot of the subscription registry.
    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.subscriptions.read().values().cloned().collect()
    }

    /// Current statistics. The message-rate window resets on every call.
    pub fn stats(&self) -> MarketDataStats {
        let mut stats = self.stats.write();

        let messages_per_sec = match stats.window_started {
            Some(started) if started.elapsed().as_secs_f64() > 0.0 => {
                stats.window_count as f64 / started.elapsed().as_secs_f64()
            }
            _ => 0.0,
        };
        stats.window_count = 0;
        stats.window_started = Some(Instant::now());

        MarketDataStats {
            messages_total: stats.messages_total,
            messages_by_kind: stats.messages_by_kind,
            messages_by_exchange: stats.messages_by_exchange.clone(),
            messages_per_sec,
            connections: self
                .sockets
                .iter()
                .map(|(exchange, handle)| (*exchange, handle.info()))
                .collect(),
            avg_processing_latency_us: if stats.latency_count == 0 {
                0.0
            } else {
                stats.latency_sum_us as f64 / stats.latency_count as f64
            },
            max_processing_latency_us: stats.latency_max_us,
        }
    }

    /// Close every venue socket; the processing task drains and exits.
    pub fn stop(&self) {
        for handle in self.sockets.values() {
            handle.close();
        }
        info!("MarketDataEngine stopped");
    }

    fn socket(&self, exchange: ExchangeId) -> Result<&VenueSocketHandle, DataError> {
        self.sockets
            .get(&exchange)
            .ok_or(DataError::UnsupportedChannel {
                exchange,
                channel: "venue not started",
            })
    }
}

fn subscription_id(exchange: ExchangeId, symbol: &Symbol, channel: Channel) -> SubscriptionId {
    SubscriptionId::new(format!("{exchange}|{symbol}|{channel}"))
}

/// Channels on which a [`DataKind`] may arrive, used to credit subscription records.
fn channels_for_kind(kind: &DataKind) -> &'static [Channel] {
    match kind {
        DataKind::Trade(_) => &[Channel::Trades],
        DataKind::Depth(_) => &[Channel::Depth5, Channel::Depth20],
        DataKind::Ticker(_) => &[Channel::Ticker],
        DataKind::Funding(_) => &[Channel::Funding],
        DataKind::Kline(_) => &[],
        DataKind::MarkPrice(_) => &[Channel::MarkPrice],
    }
}

async fn process_task(
    mut supervisor_rx: carry_integration::channel::UnboundedRx<SupervisorEvent>,
    subscriptions: Arc<RwLock<IndexMap<SubscriptionId, SubscriptionRecord>>>,
    stats: Arc<RwLock<StatsInner>>,
    events_tx: tokio::sync::broadcast::Sender<MarketEvent>,
    mut sink: Option<TxDroppable<UnboundedTx<MarketEvent>>>,
) {
    while let Some(event) = supervisor_rx.rx.recv().await {
        match event {
            SupervisorEvent::Message { exchange, payload } => {
                let started = Instant::now();

                let events = match exchange::parse(exchange, &payload) {
                    Ok(events) => events,
                    Err(error) => {
                        // Contract errors drop the single record, never the stream
                        debug!(%exchange, %error, "dropping unparseable venue payload");
                        continue;
                    }
                };

                for event in events {
                    credit_subscription(&subscriptions, &event);

                    {
                        let mut stats = stats.write();
                        stats.messages_total += 1;
                        stats.window_count += 1;
                        stats.messages_by_kind.record(&event.kind);
                        *stats.messages_by_exchange.entry(event.exchange).or_insert(0) += 1;
                        if stats.window_started.is_none() {
                            stats.window_started = Some(started);
                        }
                    }

                    if let Some(sink) = sink.as_mut() {
                        sink.send(event.clone());
                    }
                    let _ = events_tx.send(event);
                }

                let elapsed_us = started.elapsed().as_micros();
                let mut stats = stats.write();
                stats.latency_sum_us += elapsed_us;
                stats.latency_count += 1;
                stats.latency_max_us = stats.latency_max_us.max(elapsed_us as u64);
            }
            SupervisorEvent::Connected { exchange } => {
                info!(%exchange, "venue stream connected");
            }
            SupervisorEvent::Disconnected { exchange } => {
                warn!(%exchange, "venue stream disconnected");
            }
            SupervisorEvent::Reconnecting {
                exchange,
                attempt,
                delay,
            } => {
                info!(%exchange, attempt, ?delay, "venue stream reconnecting");
            }
            SupervisorEvent::Error { exchange, error } => {
                warn!(%exchange, %error, "venue stream error");
            }
        }
    }
    debug!("MarketDataEngine processing task drained");
}

fn credit_subscription(
    subscriptions: &RwLock<IndexMap<SubscriptionId, SubscriptionRecord>>,
    event: &MarketEvent,
) {
    let mut subscriptions = subscriptions.write();
    for channel in channels_for_kind(&event.kind) {
        if let Some(record) =
            subscriptions.get_mut(&subscription_id(event.exchange, &event.symbol, *channel))
        {
            record.message_count += 1;
            record.last_data_at = Some(event.time_received);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PublicTrade, Ticker};
    use carry_instrument::Side;
    use rust_decimal_macros::dec;

    fn trade_event(exchange: ExchangeId) -> MarketEvent {
        MarketEvent {
            time_exchange: Utc::now(),
            time_received: Utc::now(),
            exchange,
            symbol: Symbol::new("BTC/USDT:USDT"),
            kind: DataKind::Trade(PublicTrade {
                id: "1".into(),
                price: dec!(100),
                amount: dec!(1),
                side: Side::Buy,
            }),
        }
    }

    #[test]
    fn test_kind_counters_record() {
        let mut counters = KindCounters::default();
        counters.record(&trade_event(ExchangeId::Binance).kind);
        counters.record(&DataKind::Ticker(Ticker {
            last_price: dec!(1),
            best_bid: None,
            best_ask: None,
            volume_24h: None,
        }));
        assert_eq!(counters.trades, 1);
        assert_eq!(counters.tickers, 1);
        assert_eq!(counters.depth, 0);
    }

    #[test]
    fn test_credit_subscription_matches_channel() {
        let subscriptions = RwLock::new(IndexMap::new());
        let symbol = Symbol::new("BTC/USDT:USDT");
        subscriptions.write().insert(
            subscription_id(ExchangeId::Binance, &symbol, Channel::Trades),
            SubscriptionRecord {
                exchange: ExchangeId::Binance,
                symbol: symbol.clone(),
                channel: Channel::Trades,
                active: true,
                subscribed_at: Utc::now(),
                last_data_at: None,
                message_count: 0,
            },
        );

        credit_subscription(&subscriptions, &trade_event(ExchangeId::Binance));
        // Event for an unregistered venue is ignored
        credit_subscription(&subscriptions, &trade_event(ExchangeId::Okx));

        let subscriptions = subscriptions.read();
        let record = subscriptions.values().next().unwrap();
        assert_eq!(record.message_count, 1);
        assert!(record.last_data_at.is_some());
    }

    #[tokio::test]
    async fn test_engine_subscribe_registers_records() {
        let mut engine = MarketDataEngine::new(MarketDataConfig {
            exchanges: vec![ExchangeId::Binance],
            ..MarketDataConfig::default()
        });
        engine.start();

        engine
            .subscribe(
                ExchangeId::Binance,
                &[Symbol::new("BTC/USDT:USDT")],
                &[Channel::Ticker, Channel::Trades],
            )
            .unwrap();

        let records = engine.subscriptions();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.active));

        // Subscribing to an unstarted venue is an error
        assert!(
            engine
                .subscribe(ExchangeId::Okx, &[Symbol::new("BTC/USDT:USDT")], &[Channel::Ticker])
                .is_err()
        );

        engine.stop();
    }
}

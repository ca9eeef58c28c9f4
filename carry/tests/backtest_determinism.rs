use carry::{
    backtest::{Backtest, BacktestConfig, BacktestSummary},
    strategy::{Action, Strategy, StrategyError, StrategyHost},
};
use carry_data::{
    event::{MarketEvent, PublicTrade},
    historical::{
        AggTradeRow, DEFAULT_BATCH_LIMIT, DepthSnapshotRow, EventTypeFilter, MemoryEventStore,
        load_events,
    },
};
use carry_execution::order::{OrderKind, OrderRequest};
use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn symbol() -> Symbol {
    Symbol::new("BTC/USDT:USDT")
}

fn store() -> MemoryEventStore {
    let depth = |timestamp: u64, bid: &str, ask: &str| DepthSnapshotRow {
        exchange: ExchangeId::Binance,
        symbol: symbol(),
        timestamp,
        bids: format!(r#"[["{bid}","10"]]"#),
        asks: format!(r#"[["{ask}","10"]]"#),
    };
    let trade = |timestamp: u64, id: u64, price: &str| AggTradeRow {
        exchange: ExchangeId::Binance,
        symbol: symbol(),
        timestamp,
        trade_id: id,
        price: price.parse().unwrap(),
        quantity: dec!(1),
        is_sell: false,
    };

    MemoryEventStore {
        depth_snapshots: vec![
            depth(500, "99.5", "100.0"),
            depth(2_500, "100.5", "101.0"),
            depth(4_500, "103.5", "104.0"),
        ],
        agg_trades: vec![
            trade(1_000, 1, "100.0"),
            trade(2_000, 2, "100.5"),
            trade(3_000, 3, "101.5"),
            trade(4_000, 4, "103.0"),
            trade(5_000, 5, "104.0"),
            trade(6_000, 6, "104.5"),
        ],
        ..MemoryEventStore::default()
    }
}

/// Buys one unit on the second trade print, sells it on the fifth.
struct RoundTrip {
    trades_seen: u32,
}

impl RoundTrip {
    fn new() -> Self {
        Self { trades_seen: 0 }
    }

    fn market(&self, side: Side) -> OrderRequest {
        OrderRequest {
            exchange: ExchangeId::Binance,
            symbol: symbol(),
            side,
            kind: OrderKind::Market,
            quantity: dec!(1),
            price: None,
            post_only: false,
            reduce_only: false,
            client_order_id: None,
            account_id: None,
            timeout: None,
        }
    }
}

impl Strategy for RoundTrip {
    fn on_trade(
        &mut self,
        _event: &MarketEvent,
        _trade: &PublicTrade,
    ) -> Result<Option<Action>, StrategyError> {
        self.trades_seen += 1;
        let side = match self.trades_seen {
            2 => Side::Buy,
            5 => Side::Sell,
            _ => return Ok(None),
        };
        Ok(Some(Action {
            orders: vec![self.market(side)],
            ..Action::default()
        }))
    }
}

fn run_once() -> BacktestSummary {
    let events = load_events(
        &store(),
        &[ExchangeId::Binance],
        &[symbol()],
        0,
        10_000,
        EventTypeFilter::default(),
        DEFAULT_BATCH_LIMIT,
    )
    .unwrap();

    let mut host = StrategyHost::default();
    host.register("round-trip", Box::new(RoundTrip::new()))
        .unwrap();

    let mut backtest = Backtest::new(BacktestConfig::default(), host);
    backtest.load(events);
    backtest.run().unwrap()
}

#[test]
fn test_identical_runs_are_bit_identical() {
    let first = run_once();
    let second = run_once();

    assert!(!first.equity_curve.is_empty());
    assert_eq!(first.equity_curve, second.equity_curve);
    assert_eq!(first.closed_trades, second.closed_trades);
    assert_eq!(first.final_equity, second.final_equity);
    assert_eq!(
        first.performance.trades.total_trades,
        second.performance.trades.total_trades
    );
}

#[test]
fn test_round_trip_realizes_expected_pnl() {
    let summary = run_once();

    // One closed trade: bought at the 100 ask, sold into the 103.5 bid
    assert_eq!(summary.closed_trades.len(), 1);
    let trade = &summary.closed_trades[0];
    assert_eq!(trade.entry_price, dec!(100.0));
    assert_eq!(trade.exit_price, dec!(103.5));
    assert_eq!(trade.pnl, dec!(3.5));

    // Equity reflects the realized gain minus taker fees on both legs
    let fees: Decimal = dec!(100.0) * dec!(0.0004) + dec!(103.5) * dec!(0.0004);
    let expected_final = dec!(10000) + dec!(3.5) - fees;
    assert!(
        (Decimal::from_f64_retain(summary.final_equity).unwrap() - expected_final).abs()
            < dec!(0.001),
        "final equity {} != expected {}",
        summary.final_equity,
        expected_final
    );
}

#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Carry-Strategy
//! Cross-exchange funding-rate arbitrage for the Carry perpetual-futures trading ecosystem.
//!
//! The closed loop: the [`FundingCalculator`](funding::FundingCalculator) predicts per-venue
//! funding, the [`ArbitrageDetector`](detector::ArbitrageDetector) scores pairwise spreads,
//! the [`PositionSizer`](sizer::PositionSizer) turns an opportunity into a bounded notional,
//! the [`InventoryManager`](inventory::InventoryManager) tracks the legs, and the
//! [`ArbitrageStrategy`](arbitrage::ArbitrageStrategy) binds them into a signal generator
//! shared by backtest and live modes.

/// Per-venue funding history, EMA + regression ensemble prediction and spread queries.
pub mod funding;

/// Per-venue inventory, imbalance tracking and rebalance action generation.
pub mod inventory;

/// Fractional-Kelly position sizing with volatility, drawdown and concentration caps.
pub mod sizer;

/// Pairwise spread discovery, risk scoring and opportunity lifecycle.
pub mod detector;

/// The arbitrage strategy `tick()` loop producing ordered [`TradeSignal`](arbitrage::TradeSignal)s.
pub mod arbitrage;

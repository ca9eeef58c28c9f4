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

//! # Carry
//! Perpetual-futures funding-rate arbitrage platform built on the Carry ecosystem crates.
//!
//! Unifies three functions over one data model:
//! - **Backtesting**: a deterministic event-time replay through the
//!   [`backtest`](crate::backtest) event queue, matching engine and simulated broker.
//! - **Live trading**: the [`engine`](crate::engine) wiring market data, the arbitrage
//!   strategy, the risk manager and the order executor.
//! - **Statistics**: the [`statistic`](crate::statistic) summary over equity curves and
//!   closed trades.

/// Event-driven backtesting: event queue, matching engine, simulated broker and runner.
pub mod backtest;

/// Performance statistics over equity curves and closed trades.
pub mod statistic;

/// Strategy host: registration, dispatch, action merging and error isolation.
pub mod strategy;

/// Live trading engine orchestrating data, strategy, risk and execution.
pub mod engine;

/// System configuration loading and validation.
pub mod config;

/// Logging initialisation utilities.
pub mod logging;

use chrono::{DateTime, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};

/// A value at a point in time.
#[derive(
    Debug, Copy, Clone, PartialEq, PartialOrd, Default, Deserialize, Serialize, Constructor,
)]
pub struct Timed<T> {
    pub value: T,
    pub time: DateTime<Utc>,
}

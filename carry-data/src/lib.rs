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

//! # Carry-Data
//! Normalised market-data layer for the Carry perpetual-futures trading ecosystem.
//!
//! - **Normalised events**: every venue message becomes a [`MarketEvent`](event::MarketEvent)
//!   carrying a [`DataKind`](event::DataKind) variant.
//! - **Order books**: sorted L2 [`OrderBook`](books::OrderBook)s with slippage and
//!   fillable-quantity queries.
//! - **Venue decoding**: stateless message decoders and subscription builders for Binance
//!   USDT-M futures, Bybit V5 linear and OKX V5.
//! - **Historical loading**: the [`EventStore`](historical::EventStore) contract streaming
//!   sorted events into the backtester.
//! - **Live fan-out**: the [`MarketDataEngine`](engine::MarketDataEngine) publishing typed
//!   events to consumers.

/// All [`Error`](std::error::Error)s generated in Carry-Data.
pub mod error;

/// Normalised Carry [`MarketEvent`](event::MarketEvent) types.
pub mod event;

/// Local L2 [`OrderBook`](books::OrderBook) maintenance, plus slippage and fill queries.
pub mod books;

/// Venue-specific message decoding and subscription payload building.
pub mod exchange;

/// Historical event storage contract used to seed backtests.
pub mod historical;

/// Live market-data engine: subscription control, normalisation, fan-out and stats.
pub mod engine;

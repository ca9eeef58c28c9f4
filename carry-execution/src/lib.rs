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

//! # Carry-Execution
//! Order model, venue-adapter contract and the order executor for the Carry perpetual-futures
//! trading ecosystem.
//!
//! The [`OrderExecutor`](executor::OrderExecutor) enforces the live execution discipline:
//! per-account serialized submission behind a latch, monotonic nonces, self-trade protection,
//! timeout-cancel polling and classified retries.

/// Order, position and account data model shared by live execution and the backtester.
pub mod order;

/// All [`Error`](std::error::Error)s generated in Carry-Execution, including the venue API
/// error-code taxonomy.
pub mod error;

/// [`VenueAdapter`](client::VenueAdapter) contract consumed by the executor, plus the
/// scriptable [`MockVenue`](client::MockVenue) test double.
pub mod client;

/// The [`OrderExecutor`](executor::OrderExecutor) protocol implementation.
pub mod executor;

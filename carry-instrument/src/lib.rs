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

//! # Carry-Instrument
//! Core identifiers shared across the Carry perpetual-futures trading ecosystem:
//! venue ids, canonical symbols, and trade/position sides.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Defines the [`ExchangeId`](exchange::ExchangeId) enum covering all supported venues, with
/// per-venue static metadata (fee schedule, venue risk coefficient).
pub mod exchange;

/// Canonical `BASE/QUOTE:SETTLE` [`Symbol`](symbol::Symbol) new type and parsing utilities.
pub mod symbol;

/// [`Side`] of a trade or order - Buy or Sell.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[serde(alias = "BUY", alias = "Buy", alias = "b")]
    Buy,
    #[serde(alias = "SELL", alias = "Sell", alias = "s")]
    Sell,
}

impl Side {
    /// [`Side`] taking the other side of the market.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Side::Buy => "buy",
                Side::Sell => "sell",
            }
        )
    }
}

/// Direction of an open perpetual position.
///
/// A flat position is [`PositionSide::None`], and a `Position` with zero quantity must always
/// carry [`PositionSide::None`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
    #[default]
    None,
}

impl PositionSide {
    /// The [`Side`] of an order that would increase a position held in this direction.
    ///
    /// Flat positions have no increasing side.
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            PositionSide::Long => Some(Side::Buy),
            PositionSide::Short => Some(Side::Sell),
            PositionSide::None => None,
        }
    }

    /// The [`Side`] of an order that would reduce a position held in this direction.
    pub fn exit_side(&self) -> Option<Side> {
        self.entry_side().map(|side| side.opposite())
    }

    /// Signed multiplier for P&L arithmetic: `+1` long, `-1` short, `0` flat.
    pub fn sign(&self) -> i8 {
        match self {
            PositionSide::Long => 1,
            PositionSide::Short => -1,
            PositionSide::None => 0,
        }
    }
}

impl Display for PositionSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PositionSide::Long => "long",
                PositionSide::Short => "short",
                PositionSide::None => "none",
            }
        )
    }
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

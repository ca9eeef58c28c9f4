use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unique identifier for a supported derivatives venue.
///
/// Carry trades USDT-margined perpetual futures on three venues, each with a distinct public
/// stream protocol and fee schedule.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeId {
    Binance,
    Bybit,
    Okx,
}

/// All venues, in the canonical iteration order used for pairwise spread discovery.
pub const ALL_EXCHANGES: [ExchangeId; 3] = [ExchangeId::Binance, ExchangeId::Bybit, ExchangeId::Okx];

impl ExchangeId {
    /// Return the &str representation of this [`ExchangeId`].
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bybit => "bybit",
            ExchangeId::Okx => "okx",
        }
    }

    /// Default maker fee rate for USDT-margined perpetuals on this venue.
    pub fn maker_fee(&self) -> Decimal {
        match self {
            ExchangeId::Binance => Decimal::new(2, 4),  // 0.02%
            ExchangeId::Bybit => Decimal::new(1, 4),    // 0.01%
            ExchangeId::Okx => Decimal::new(2, 4),      // 0.02%
        }
    }

    /// Default taker fee rate for USDT-margined perpetuals on this venue.
    pub fn taker_fee(&self) -> Decimal {
        match self {
            ExchangeId::Binance => Decimal::new(4, 4),  // 0.04%
            ExchangeId::Bybit => Decimal::new(6, 4),    // 0.06%
            ExchangeId::Okx => Decimal::new(5, 4),      // 0.05%
        }
    }

    /// Venue risk coefficient used when scoring arbitrage opportunities.
    ///
    /// Reflects counterparty/operational risk weighting, not market risk.
    pub fn risk_coefficient(&self) -> f64 {
        match self {
            ExchangeId::Binance => 0.1,
            ExchangeId::Bybit => 0.2,
            ExchangeId::Okx => 0.15,
        }
    }
}

/// Error returned when parsing an unrecognised venue name.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unrecognised exchange: {0}")]
pub struct ParseExchangeError(pub String);

impl FromStr for ExchangeId {
    type Err = ParseExchangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "binance" => Ok(ExchangeId::Binance),
            "bybit" => Ok(ExchangeId::Bybit),
            "okx" => Ok(ExchangeId::Okx),
            other => Err(ParseExchangeError(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exchange_id_round_trip() {
        for exchange in ALL_EXCHANGES {
            assert_eq!(
                exchange.as_str().parse::<ExchangeId>().unwrap(),
                exchange,
                "{exchange} failed"
            );
        }
    }

    #[test]
    fn test_fee_schedule() {
        assert_eq!(ExchangeId::Binance.taker_fee(), dec!(0.0004));
        assert_eq!(ExchangeId::Binance.maker_fee(), dec!(0.0002));
        assert_eq!(ExchangeId::Bybit.maker_fee(), dec!(0.0001));
        assert_eq!(ExchangeId::Okx.taker_fee(), dec!(0.0005));
    }

    #[test]
    fn test_exchange_id_serde_snake_case() {
        assert_eq!(
            serde_json::from_str::<ExchangeId>(r#""binance""#).unwrap(),
            ExchangeId::Binance
        );
        assert_eq!(
            serde_json::to_string(&ExchangeId::Okx).unwrap(),
            r#""okx""#
        );
    }
}

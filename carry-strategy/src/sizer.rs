use crate::detector::ArbitrageOpportunity;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, prelude::FromPrimitive};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration of the [`PositionSizer`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SizerConfig {
    /// Conservatism multiplier on the Kelly-optimal fraction (quarter-Kelly by default).
    pub kelly_fraction: f64,
    /// Assumed worst-case loss per round trip from slippage and fees.
    pub assumed_worst_loss: f64,
    /// Reference volatility for the volatility adjustment.
    pub base_volatility: f64,
    /// Drawdown at which sizing reaches zero.
    pub target_max_drawdown: f64,
    /// Per-pair notional cap as a fraction of equity.
    pub max_position_per_pair: f64,
    /// Per-exchange notional cap as a fraction of equity.
    pub max_position_per_exchange: f64,
    /// Total-portfolio notional cap as a fraction of equity.
    pub max_total_position: f64,
    pub default_leverage: Decimal,
    pub min_notional: Decimal,
    pub max_daily_trades: u32,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            kelly_fraction: 0.25,
            assumed_worst_loss: 0.002,
            base_volatility: 0.02,
            target_max_drawdown: 0.10,
            max_position_per_pair: 0.20,
            max_position_per_exchange: 0.50,
            max_total_position: 1.0,
            default_leverage: Decimal::from(3u32),
            min_notional: Decimal::from(10u32),
            max_daily_trades: 100,
        }
    }
}

/// Portfolio context consumed by one sizing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingInputs {
    pub equity: Decimal,
    pub mark_price: Decimal,
    pub current_volatility: f64,
    pub current_drawdown: f64,
    pub available_margin: Decimal,
    /// Notional already deployed on this symbol pair.
    pub pair_notional: Decimal,
    /// Largest per-venue notional already deployed (either leg's venue).
    pub exchange_notional: Decimal,
    pub total_notional: Decimal,
}

/// Output of one sizing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSizeResult {
    pub suggested_notional: Decimal,
    pub suggested_quantity: Decimal,
    pub max_notional: Decimal,
    pub min_notional: Decimal,
    pub leverage: Decimal,
    pub required_margin: Decimal,
    pub adjustment_reason: Option<String>,
}

/// Fractional-Kelly position sizer with volatility, drawdown and concentration limits.
#[derive(Debug)]
pub struct PositionSizer {
    config: SizerConfig,
    daily_trades: u32,
    current_date: NaiveDate,
}

impl PositionSizer {
    pub fn new(config: SizerConfig) -> Self {
        Self {
            config,
            daily_trades: 0,
            current_date: Utc::now().date_naive(),
        }
    }

    /// Size a new entry for the provided opportunity.
    pub fn calculate(
        &self,
        opportunity: &ArbitrageOpportunity,
        inputs: &SizingInputs,
    ) -> PositionSizeResult {
        let mut reasons: Vec<&str> = Vec::new();

        // 1-3. Fractional Kelly from the opportunity's risk profile
        let win_prob = (1.0 - opportunity.risk_score / 100.0).max(0.5);
        let odds = (opportunity.expected_return / self.config.assumed_worst_loss).max(f64::EPSILON);
        let kelly = ((win_prob * odds - (1.0 - win_prob)) / odds).max(0.0);
        let mut fraction = kelly * self.config.kelly_fraction;

        // 4. Volatility adjustment
        if inputs.current_volatility > f64::EPSILON {
            let volatility_multiplier =
                (self.config.base_volatility / inputs.current_volatility).clamp(0.5, 2.0);
            if volatility_multiplier < 1.0 {
                reasons.push("volatility");
            }
            fraction *= volatility_multiplier;
        }

        // 5. Drawdown adjustment
        let drawdown_multiplier =
            (1.0 - inputs.current_drawdown / self.config.target_max_drawdown).max(0.0);
        if drawdown_multiplier < 1.0 {
            reasons.push("drawdown");
        }
        fraction *= drawdown_multiplier;

        // Opportunity's own suggested size caps the fraction of the budget used
        fraction *= opportunity.suggested_size;

        let mut notional = inputs.equity
            * Decimal::from_f64(fraction).unwrap_or(Decimal::ZERO);

        // 6. Concentration and margin caps
        let pair_cap = cap(inputs.equity, self.config.max_position_per_pair)
            - inputs.pair_notional;
        let exchange_cap = cap(inputs.equity, self.config.max_position_per_exchange)
            - inputs.exchange_notional;
        let total_cap = cap(inputs.equity, self.config.max_total_position)
            - inputs.total_notional;
        let margin_cap = inputs.available_margin * self.config.default_leverage;

        let max_notional = pair_cap
            .min(exchange_cap)
            .min(total_cap)
            .min(margin_cap)
            .max(Decimal::ZERO);
        if notional > max_notional {
            reasons.push("concentration_cap");
            notional = max_notional;
        }

        if notional < self.config.min_notional {
            reasons.push("below_min_notional");
            notional = Decimal::ZERO;
        }

        let suggested_quantity = if inputs.mark_price.is_zero() {
            Decimal::ZERO
        } else {
            notional / inputs.mark_price
        };

        debug!(
            symbol = %opportunity.symbol,
            %notional,
            fraction,
            "position sized"
        );

        PositionSizeResult {
            suggested_notional: notional,
            suggested_quantity,
            max_notional,
            min_notional: self.config.min_notional,
            leverage: self.config.default_leverage,
            required_margin: if self.config.default_leverage.is_zero() {
                notional
            } else {
                notional / self.config.default_leverage
            },
            adjustment_reason: (!reasons.is_empty()).then(|| reasons.join("+")),
        }
    }

    /// Whether portfolio-level risk limits are violated (drawdown beyond target).
    pub fn check_risk_limits(&self, current_drawdown: f64) -> bool {
        current_drawdown >= self.config.target_max_drawdown
    }

    /// Whether the daily trade budget still allows a new entry. Resets on date change.
    pub fn can_open_position(&mut self, now: DateTime<Utc>) -> bool {
        self.roll_date(now);
        self.daily_trades < self.config.max_daily_trades
    }

    /// Count one executed entry against the daily budget.
    pub fn record_trade(&mut self, now: DateTime<Utc>) {
        self.roll_date(now);
        self.daily_trades += 1;
    }

    fn roll_date(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.current_date {
            self.current_date = today;
            self.daily_trades = 0;
        }
    }
}

fn cap(equity: Decimal, fraction: f64) -> Decimal {
    equity * Decimal::from_f64(fraction).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn opportunity(risk_score: f64, expected_return: f64) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            id: 1,
            symbol: Symbol::new("BTC/USDT:USDT"),
            long_exchange: ExchangeId::Okx,
            short_exchange: ExchangeId::Binance,
            long_annualized: -0.05,
            short_annualized: 0.20,
            spread_annualized: 0.25,
            expected_return,
            risk_score,
            suggested_size: 1.0,
            detected_at: Utc::now(),
            valid_until: Utc::now() + ChronoDuration::minutes(30),
        }
    }

    fn inputs(equity: Decimal) -> SizingInputs {
        SizingInputs {
            equity,
            mark_price: dec!(100),
            current_volatility: 0.02,
            current_drawdown: 0.0,
            available_margin: equity,
            pair_notional: dec!(0),
            exchange_notional: dec!(0),
            total_notional: dec!(0),
        }
    }

    #[test]
    fn test_healthy_opportunity_sizes_nonzero_within_pair_cap() {
        let sizer = PositionSizer::new(SizerConfig::default());
        let result = sizer.calculate(&opportunity(40.0, 0.24), &inputs(dec!(10000)));

        assert!(result.suggested_notional > dec!(0));
        // Bounded by max_position_per_pair * equity
        assert!(result.suggested_notional <= dec!(2000));
        assert_eq!(
            result.suggested_quantity,
            result.suggested_notional / dec!(100)
        );
        assert_eq!(
            result.required_margin,
            result.suggested_notional / dec!(3)
        );
    }

    #[test]
    fn test_high_volatility_halves_size() {
        let sizer = PositionSizer::new(SizerConfig::default());
        let calm = sizer.calculate(&opportunity(40.0, 0.24), &inputs(dec!(10000)));

        let mut volatile_inputs = inputs(dec!(10000));
        volatile_inputs.current_volatility = 0.08; // multiplier clamps at 0.5
        let volatile = sizer.calculate(&opportunity(40.0, 0.24), &volatile_inputs);

        let halved = calm.suggested_notional / dec!(2);
        assert!(
            (volatile.suggested_notional - halved).abs() < dec!(0.01),
            "expected ~{halved}, got {}",
            volatile.suggested_notional
        );
        assert!(
            volatile
                .adjustment_reason
                .as_deref()
                .unwrap_or_default()
                .contains("volatility")
        );
    }

    #[test]
    fn test_drawdown_at_target_zeroes_size() {
        let sizer = PositionSizer::new(SizerConfig::default());
        let mut drawdown_inputs = inputs(dec!(10000));
        drawdown_inputs.current_drawdown = 0.10;

        let result = sizer.calculate(&opportunity(40.0, 0.24), &drawdown_inputs);
        assert_eq!(result.suggested_notional, dec!(0));
        assert!(sizer.check_risk_limits(0.10));
        assert!(!sizer.check_risk_limits(0.05));
    }

    #[test]
    fn test_existing_pair_notional_shrinks_cap() {
        let sizer = PositionSizer::new(SizerConfig::default());
        let mut crowded = inputs(dec!(10000));
        crowded.pair_notional = dec!(1900);

        let result = sizer.calculate(&opportunity(40.0, 0.24), &crowded);
        // Pair cap is 2000; only 100 of headroom remains
        assert!(result.max_notional <= dec!(100));
        assert!(result.suggested_notional <= dec!(100));
    }

    #[test]
    fn test_tiny_size_floors_to_zero() {
        let sizer = PositionSizer::new(SizerConfig::default());
        let result = sizer.calculate(&opportunity(40.0, 0.24), &inputs(dec!(20)));

        assert_eq!(result.suggested_notional, dec!(0));
        assert!(
            result
                .adjustment_reason
                .unwrap_or_default()
                .contains("below_min_notional")
        );
    }

    #[test]
    fn test_daily_trade_budget_resets_on_date_change() {
        let mut sizer = PositionSizer::new(SizerConfig {
            max_daily_trades: 2,
            ..SizerConfig::default()
        });
        let now = Utc::now();

        assert!(sizer.can_open_position(now));
        sizer.record_trade(now);
        sizer.record_trade(now);
        assert!(!sizer.can_open_position(now));

        let tomorrow = now + ChronoDuration::days(1);
        assert!(sizer.can_open_position(tomorrow));
    }
}

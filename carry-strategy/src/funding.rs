use carry_data::event::FundingRate;
use carry_instrument::{exchange::{ALL_EXCHANGES, ExchangeId}, symbol::Symbol};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Funding settles three times per day on all supported venues.
pub const FUNDINGS_PER_DAY: f64 = 3.0;

/// Scale a per-period funding rate to a yearly basis.
pub fn annualize(rate: f64) -> f64 {
    rate * FUNDINGS_PER_DAY * 365.0
}

/// Configuration of the [`FundingCalculator`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FundingConfig {
    /// Ring-buffer capacity of per-market funding history.
    pub max_history: usize,
    /// EMA window; `alpha = 2 / (window + 1)`.
    pub ema_window: usize,
    /// Number of most-recent points fed to the linear-regression predictor.
    pub linear_window: usize,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            max_history: 90,
            ema_window: 12,
            linear_window: 6,
        }
    }
}

/// One recorded funding observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundingPoint {
    pub time: DateTime<Utc>,
    pub rate: f64,
}

/// Prediction for the next funding period of one market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundingPrediction {
    /// Predicted per-period rate.
    pub rate: f64,
    /// Prediction confidence in `[0.1, 0.9]`.
    pub confidence: f64,
    /// Predicted rate scaled to a yearly basis.
    pub annualized: f64,
}

/// Per-market funding state.
#[derive(Debug, Clone, Default)]
struct MarketFunding {
    history: VecDeque<FundingPoint>,
    ema: Option<f64>,
    current_rate: f64,
    venue_predicted: Option<f64>,
    mark_price: Option<Decimal>,
    next_funding_time: Option<DateTime<Utc>>,
}

/// Per-venue funding history and ensemble rate prediction.
///
/// Funding rates are rolling statistics, so arithmetic here is `f64`; cash flows derived from
/// them stay decimal in the inventory ledger.
#[derive(Debug, Default)]
pub struct FundingCalculator {
    config: FundingConfig,
    markets: FnvHashMap<(ExchangeId, Symbol), MarketFunding>,
}

impl FundingCalculator {
    pub fn new(config: FundingConfig) -> Self {
        Self {
            config,
            markets: FnvHashMap::default(),
        }
    }

    /// Fold a normalised funding record into the per-market state.
    pub fn update(
        &mut self,
        exchange: ExchangeId,
        symbol: &Symbol,
        funding: &FundingRate,
        time: DateTime<Utc>,
    ) {
        let rate = funding.rate.to_f64().unwrap_or(0.0);
        let market = self
            .markets
            .entry((exchange, symbol.clone()))
            .or_default();

        market.current_rate = rate;
        market.venue_predicted = funding.predicted_rate.and_then(|rate| rate.to_f64());
        market.mark_price = funding.mark_price.or(market.mark_price);
        market.next_funding_time = funding.next_funding_time.or(market.next_funding_time);

        market.history.push_back(FundingPoint { time, rate });
        while market.history.len() > self.config.max_history {
            market.history.pop_front();
        }

        let alpha = 2.0 / (self.config.ema_window as f64 + 1.0);
        market.ema = Some(match market.ema {
            Some(previous) => alpha * rate + (1.0 - alpha) * previous,
            None => rate,
        });
    }

    /// Predict the next funding rate for one market.
    ///
    /// With fewer than 3 observations the venue-provided prediction is used at confidence
    /// 0.3; otherwise the ensemble `0.4*EMA + 0.3*linear + 0.3*most_recent` with confidence
    /// `clamp(1 - |stdev/mean|, 0.1, 0.9)`.
    pub fn predict(&self, exchange: ExchangeId, symbol: &Symbol) -> Option<FundingPrediction> {
        let market = self.markets.get(&(exchange, symbol.clone()))?;

        if market.history.len() < 3 {
            let rate = market.venue_predicted.unwrap_or(market.current_rate);
            return Some(FundingPrediction {
                rate,
                confidence: 0.3,
                annualized: annualize(rate),
            });
        }

        let rates = market.history.iter().map(|point| point.rate).collect::<Vec<_>>();
        let recent = *rates.last().unwrap_or(&0.0);
        let ema = market.ema.unwrap_or(recent);
        let linear = linear_prediction(&rates, self.config.linear_window).unwrap_or(recent);

        let rate = 0.4 * ema + 0.3 * linear + 0.3 * recent;

        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        let variance =
            rates.iter().map(|rate| (rate - mean).powi(2)).sum::<f64>() / rates.len() as f64;
        let stdev = variance.sqrt();
        let confidence = if mean.abs() < f64::EPSILON {
            0.1
        } else {
            (1.0 - (stdev / mean).abs()).clamp(0.1, 0.9)
        };

        Some(FundingPrediction {
            rate,
            confidence,
            annualized: annualize(rate),
        })
    }

    /// Venue currently predicted to pay the highest annualized rate for `symbol`.
    pub fn highest_rate_exchange(&self, symbol: &Symbol) -> Option<(ExchangeId, FundingPrediction)> {
        self.predictions(symbol)
            .max_by(|a, b| a.1.annualized.total_cmp(&b.1.annualized))
    }

    /// Venue currently predicted to pay the lowest annualized rate for `symbol`.
    pub fn lowest_rate_exchange(&self, symbol: &Symbol) -> Option<(ExchangeId, FundingPrediction)> {
        self.predictions(symbol)
            .min_by(|a, b| a.1.annualized.total_cmp(&b.1.annualized))
    }

    /// Widest predicted annualized spread across venue pairs for `symbol`.
    pub fn max_spread(&self, symbol: &Symbol) -> Option<f64> {
        let highest = self.highest_rate_exchange(symbol)?;
        let lowest = self.lowest_rate_exchange(symbol)?;
        (highest.0 != lowest.0).then(|| highest.1.annualized - lowest.1.annualized)
    }

    /// Predicted annualized spread `exchange_a - exchange_b` for `symbol`.
    pub fn calculate_spread(
        &self,
        symbol: &Symbol,
        exchange_a: ExchangeId,
        exchange_b: ExchangeId,
    ) -> Option<f64> {
        let a = self.predict(exchange_a, symbol)?;
        let b = self.predict(exchange_b, symbol)?;
        Some(a.annualized - b.annualized)
    }

    /// Latest observed (not predicted) per-period rate.
    pub fn current_rate(&self, exchange: ExchangeId, symbol: &Symbol) -> Option<f64> {
        self.markets
            .get(&(exchange, symbol.clone()))
            .map(|market| market.current_rate)
    }

    fn predictions<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> impl Iterator<Item = (ExchangeId, FundingPrediction)> + 'a {
        ALL_EXCHANGES
            .into_iter()
            .filter_map(move |exchange| Some((exchange, self.predict(exchange, symbol)?)))
    }
}

/// Least-squares extrapolation one step beyond the last `window` points.
fn linear_prediction(rates: &[f64], window: usize) -> Option<f64> {
    let window = window.min(rates.len());
    if window < 2 {
        return None;
    }
    let points = &rates[rates.len() - window..];
    let n = points.len() as f64;

    let x_mean = (n - 1.0) / 2.0;
    let y_mean = points.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (index, y) in points.iter().enumerate() {
        let dx = index as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }
    if denominator.abs() < f64::EPSILON {
        return None;
    }
    let slope = numerator / denominator;
    let intercept = y_mean - slope * x_mean;
    Some(slope * n + intercept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    fn symbol() -> Symbol {
        Symbol::new("BTC/USDT:USDT")
    }

    fn funding(rate: Decimal, predicted: Option<Decimal>) -> FundingRate {
        FundingRate {
            rate,
            predicted_rate: predicted,
            mark_price: None,
            next_funding_time: None,
        }
    }

    #[test]
    fn test_annualize_assumes_three_fundings_per_day() {
        assert_relative_eq!(annualize(0.0001), 0.1095, epsilon = 1e-9);
    }

    #[test]
    fn test_short_history_uses_venue_prediction_at_low_confidence() {
        let mut calculator = FundingCalculator::new(FundingConfig::default());
        calculator.update(
            ExchangeId::Binance,
            &symbol(),
            &funding(dec!(0.0001), Some(dec!(0.0002))),
            Utc::now(),
        );

        let prediction = calculator.predict(ExchangeId::Binance, &symbol()).unwrap();
        assert_relative_eq!(prediction.rate, 0.0002, epsilon = 1e-12);
        assert_relative_eq!(prediction.confidence, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_history_predicts_the_constant_with_high_confidence() {
        let mut calculator = FundingCalculator::new(FundingConfig::default());
        for _ in 0..10 {
            calculator.update(
                ExchangeId::Binance,
                &symbol(),
                &funding(dec!(0.0001), None),
                Utc::now(),
            );
        }

        let prediction = calculator.predict(ExchangeId::Binance, &symbol()).unwrap();
        // EMA, regression and recent all equal the constant
        assert_relative_eq!(prediction.rate, 0.0001, epsilon = 1e-12);
        // Zero dispersion => maximum confidence
        assert_relative_eq!(prediction.confidence, 0.9, epsilon = 1e-12);
        assert_relative_eq!(prediction.annualized, annualize(0.0001), epsilon = 1e-12);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = FundingConfig {
            max_history: 5,
            ..FundingConfig::default()
        };
        let mut calculator = FundingCalculator::new(config);
        for index in 0..20 {
            calculator.update(
                ExchangeId::Binance,
                &symbol(),
                &funding(Decimal::new(index, 6), None),
                Utc::now(),
            );
        }
        let market = calculator
            .markets
            .get(&(ExchangeId::Binance, symbol()))
            .unwrap();
        assert_eq!(market.history.len(), 5);
    }

    #[test]
    fn test_spread_queries() {
        let mut calculator = FundingCalculator::new(FundingConfig::default());
        for _ in 0..5 {
            calculator.update(
                ExchangeId::Binance,
                &symbol(),
                &funding(dec!(0.000183), None), // ~ +20% annualized
                Utc::now(),
            );
            calculator.update(
                ExchangeId::Okx,
                &symbol(),
                &funding(dec!(-0.0000457), None), // ~ -5% annualized
                Utc::now(),
            );
        }

        let (highest, _) = calculator.highest_rate_exchange(&symbol()).unwrap();
        let (lowest, _) = calculator.lowest_rate_exchange(&symbol()).unwrap();
        assert_eq!(highest, ExchangeId::Binance);
        assert_eq!(lowest, ExchangeId::Okx);

        let spread = calculator.max_spread(&symbol()).unwrap();
        assert_relative_eq!(spread, annualize(0.000183 + 0.0000457), epsilon = 1e-9);

        let directional = calculator
            .calculate_spread(&symbol(), ExchangeId::Okx, ExchangeId::Binance)
            .unwrap();
        assert!(directional < 0.0);
    }

    #[test]
    fn test_linear_prediction_extrapolates_trend() {
        // Perfect linear ramp: next value continues it
        let rates = vec![0.0, 1.0, 2.0, 3.0];
        assert_relative_eq!(linear_prediction(&rates, 4).unwrap(), 4.0, epsilon = 1e-9);
        assert!(linear_prediction(&[1.0], 4).is_none());
    }
}

use crate::funding::FundingCalculator;
use carry_instrument::{
    exchange::{ALL_EXCHANGES, ExchangeId},
    symbol::Symbol,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};
use tracing::debug;

/// Weights of the four risk-score components.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RiskWeights {
    pub stability: f64,
    pub confidence: f64,
    pub exchange: f64,
    pub liquidity: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            stability: 0.3,
            confidence: 0.3,
            exchange: 0.2,
            liquidity: 0.2,
        }
    }
}

/// Configuration of the [`ArbitrageDetector`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DetectorConfig {
    /// Minimum annualized spread worth acting on.
    pub min_spread_annualized: f64,
    /// Minimum combined prediction confidence `sqrt(long * short)`.
    pub min_confidence: f64,
    /// Opportunities scoring above this are rejected.
    pub max_risk_score: f64,
    /// Opportunity lifetime after detection.
    pub opportunity_ttl: Duration,
    /// Spread-history points retained per venue pair.
    pub history_cap: usize,
    pub weights: RiskWeights,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_spread_annualized: 0.15,
            min_confidence: 0.5,
            max_risk_score: 70.0,
            opportunity_ttl: Duration::from_secs(1800),
            history_cap: 100,
            weights: RiskWeights::default(),
        }
    }
}

/// A transient, scored advice to long one venue and short another on the same symbol.
///
/// Identity is `hash(symbol, long_exchange, short_exchange)`; opportunities are re-detected
/// each tick and expire past `valid_until`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ArbitrageOpportunity {
    pub id: u64,
    pub symbol: Symbol,
    /// Venue to go long (the lower funding rate).
    pub long_exchange: ExchangeId,
    /// Venue to go short (the higher funding rate).
    pub short_exchange: ExchangeId,
    pub long_annualized: f64,
    pub short_annualized: f64,
    pub spread_annualized: f64,
    pub expected_return: f64,
    /// Composite risk score in `[0, 100]`.
    pub risk_score: f64,
    /// Fraction of the sizing budget to deploy, in `[0.1, 1.0]`.
    pub suggested_size: f64,
    pub detected_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl ArbitrageOpportunity {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }
}

/// Rolling statistics over one venue pair's spread history.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpreadStats {
    pub mean: f64,
    pub stdev: f64,
    /// Least-squares slope per observation.
    pub trend: f64,
}

/// Pairwise funding-spread discovery and risk scoring.
#[derive(Debug, Default)]
pub struct ArbitrageDetector {
    config: DetectorConfig,
    spread_history: FnvHashMap<(Symbol, ExchangeId, ExchangeId), VecDeque<f64>>,
}

impl ArbitrageDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            spread_history: FnvHashMap::default(),
        }
    }

    /// Enumerate venue pairs for `symbol` and return the valid opportunities, best expected
    /// return first.
    pub fn detect(
        &mut self,
        symbol: &Symbol,
        funding: &FundingCalculator,
        now: DateTime<Utc>,
    ) -> Vec<ArbitrageOpportunity> {
        let mut opportunities = Vec::new();

        for (a, b) in ALL_EXCHANGES.into_iter().tuple_combinations() {
            let (Some(prediction_a), Some(prediction_b)) =
                (funding.predict(a, symbol), funding.predict(b, symbol))
            else {
                continue;
            };

            // Long the lower-funding venue, short the higher
            let (long_exchange, long_prediction, short_exchange, short_prediction) =
                if prediction_a.annualized <= prediction_b.annualized {
                    (a, prediction_a, b, prediction_b)
                } else {
                    (b, prediction_b, a, prediction_a)
                };

            let spread = short_prediction.annualized - long_prediction.annualized;
            let combined_confidence =
                (long_prediction.confidence * short_prediction.confidence).sqrt();

            let stats = self.record_spread(symbol, long_exchange, short_exchange, spread);

            if spread < self.config.min_spread_annualized
                || combined_confidence < self.config.min_confidence
            {
                continue;
            }

            let risk_score = self.risk_score(
                spread,
                combined_confidence,
                long_exchange,
                short_exchange,
                &stats,
            );
            if risk_score > self.config.max_risk_score {
                debug!(%symbol, risk_score, "opportunity rejected by risk score");
                continue;
            }

            let expected_return = spread - 0.001 - 0.02 * risk_score / 100.0;
            let suggested_size = suggested_size(
                spread,
                self.config.min_spread_annualized,
                risk_score,
                combined_confidence,
            );

            opportunities.push(ArbitrageOpportunity {
                id: opportunity_id(symbol, long_exchange, short_exchange),
                symbol: symbol.clone(),
                long_exchange,
                short_exchange,
                long_annualized: long_prediction.annualized,
                short_annualized: short_prediction.annualized,
                spread_annualized: spread,
                expected_return,
                risk_score,
                suggested_size,
                detected_at: now,
                valid_until: now
                    + ChronoDuration::from_std(self.config.opportunity_ttl)
                        .unwrap_or_else(|_| ChronoDuration::minutes(30)),
            });
        }

        opportunities.sort_by(|a, b| b.expected_return.total_cmp(&a.expected_return));
        opportunities
    }

    /// Spread statistics for one directional venue pair.
    pub fn spread_stats(
        &self,
        symbol: &Symbol,
        long_exchange: ExchangeId,
        short_exchange: ExchangeId,
    ) -> Option<SpreadStats> {
        self.spread_history
            .get(&(symbol.clone(), long_exchange, short_exchange))
            .map(|history| compute_stats(history))
    }

    fn record_spread(
        &mut self,
        symbol: &Symbol,
        long_exchange: ExchangeId,
        short_exchange: ExchangeId,
        spread: f64,
    ) -> SpreadStats {
        let history = self
            .spread_history
            .entry((symbol.clone(), long_exchange, short_exchange))
            .or_default();
        history.push_back(spread);
        while history.len() > self.config.history_cap {
            history.pop_front();
        }
        compute_stats(history)
    }

    /// Weighted composite of stability, confidence, venue and liquidity risk, in `[0, 100]`.
    fn risk_score(
        &self,
        spread: f64,
        confidence: f64,
        long_exchange: ExchangeId,
        short_exchange: ExchangeId,
        stats: &SpreadStats,
    ) -> f64 {
        // Dispersion relative to the live spread: a spread that moves as much as its own
        // magnitude is maximally unstable
        let stability_risk = if spread.abs() < f64::EPSILON {
            100.0
        } else {
            ((stats.stdev / spread.abs()) * 100.0).min(100.0)
        };

        let confidence_risk = (1.0 - confidence) * 100.0;

        let exchange_risk = (long_exchange.risk_coefficient()
            + short_exchange.risk_coefficient())
            / 2.0
            * 100.0;

        // Extreme spreads tend to exist precisely where depth is thin
        let liquidity_risk = if spread <= 0.30 {
            20.0
        } else if spread <= 0.50 {
            50.0
        } else {
            80.0
        };

        let weights = &self.config.weights;
        (weights.stability * stability_risk
            + weights.confidence * confidence_risk
            + weights.exchange * exchange_risk
            + weights.liquidity * liquidity_risk)
            .clamp(0.0, 100.0)
    }
}

fn suggested_size(spread: f64, min_spread: f64, risk_score: f64, confidence: f64) -> f64 {
    let spread_multiplier = (spread / (2.0 * min_spread)).min(1.0);
    let risk_multiplier = 1.0 - risk_score / 200.0;
    (spread_multiplier * risk_multiplier * confidence).clamp(0.1, 1.0)
}

/// Stable identity for a `(symbol, long, short)` combination.
fn opportunity_id(symbol: &Symbol, long_exchange: ExchangeId, short_exchange: ExchangeId) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    long_exchange.hash(&mut hasher);
    short_exchange.hash(&mut hasher);
    hasher.finish()
}

fn compute_stats(history: &VecDeque<f64>) -> SpreadStats {
    if history.is_empty() {
        return SpreadStats::default();
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

    let x_mean = (n - 1.0) / 2.0;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (index, y) in history.iter().enumerate() {
        let dx = index as f64 - x_mean;
        numerator += dx * (y - mean);
        denominator += dx * dx;
    }

    SpreadStats {
        mean,
        stdev: variance.sqrt(),
        trend: if denominator.abs() < f64::EPSILON {
            0.0
        } else {
            numerator / denominator
        },
    }
}

use crate::{Timed, backtest::broker::ClosedTrade};
use chrono::TimeDelta;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Trading-day convention used to annualize return dispersion.
pub const TRADING_DAYS: f64 = 252.0;

/// Calendar-day convention used to annualize compound growth.
pub const CALENDAR_DAYS: f64 = 365.0;

/// Default risk-free rate.
pub const DEFAULT_RISK_FREE: f64 = 0.02;

/// Peak-to-trough equity decline statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct DrawdownSummary {
    /// Largest drawdown as a positive fraction.
    pub max_drawdown: f64,
    /// Longest time spent below a previous peak, in days.
    pub max_duration_days: f64,
}

/// Closed-trade statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct TradeSummary {
    pub total_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_holding_period_secs: f64,
}

/// Full performance summary over an equity curve and its closed trades.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct PerformanceSummary {
    pub total_return: f64,
    pub annualized_return: f64,
    /// Annualized sample standard deviation of per-period returns.
    pub volatility: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub drawdown: DrawdownSummary,
    pub trades: TradeSummary,
}

/// Summarise an equity curve and closed-trade log.
pub fn summarize(
    equity_curve: &[Timed<f64>],
    trades: &[ClosedTrade],
    risk_free: f64,
) -> PerformanceSummary {
    let trade_summary = summarize_trades(trades);
    if equity_curve.len() < 2 {
        return PerformanceSummary {
            trades: trade_summary,
            ..PerformanceSummary::default()
        };
    }

    let first = &equity_curve[0];
    let last = &equity_curve[equity_curve.len() - 1];

    let returns = period_returns(equity_curve);
    let total_return = if first.value != 0.0 {
        last.value / first.value - 1.0
    } else {
        0.0
    };

    let elapsed_days = (last.time - first.time).num_seconds().max(0) as f64 / 86_400.0;
    let annualized_return = if elapsed_days > 0.0 {
        (1.0 + total_return).powf(CALENDAR_DAYS / elapsed_days) - 1.0
    } else {
        0.0
    };

    let volatility = sample_stdev(&returns) * TRADING_DAYS.sqrt();
    let sharpe = ratio(annualized_return - risk_free, volatility);

    let downside = downside_deviation(&returns) * TRADING_DAYS.sqrt();
    let sortino = ratio(annualized_return - risk_free, downside);

    let drawdown = summarize_drawdown(equity_curve);
    let calmar = ratio(annualized_return, drawdown.max_drawdown);

    PerformanceSummary {
        total_return,
        annualized_return,
        volatility,
        sharpe,
        sortino,
        calmar,
        drawdown,
        trades: trade_summary,
    }
}

/// Per-period returns between consecutive equity points.
pub fn period_returns(equity_curve: &[Timed<f64>]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .filter(|window| window[0].value != 0.0)
        .map(|window| window[1].value / window[0].value - 1.0)
        .collect()
}

/// Running-peak drawdown sweep: tracks the deepest dip and the longest time below a peak.
pub fn summarize_drawdown(equity_curve: &[Timed<f64>]) -> DrawdownSummary {
    let Some(first) = equity_curve.first() else {
        return DrawdownSummary::default();
    };

    let mut peak = first.value;
    let mut peak_time = first.time;
    let mut max_drawdown = 0.0f64;
    let mut max_duration = TimeDelta::zero();

    for point in &equity_curve[1..] {
        if point.value > peak {
            peak = point.value;
            peak_time = point.time;
            continue;
        }
        if peak > 0.0 {
            let drawdown = (peak - point.value) / peak;
            max_drawdown = max_drawdown.max(drawdown);
        }
        let duration = point.time - peak_time;
        if duration > max_duration {
            max_duration = duration;
        }
    }

    DrawdownSummary {
        max_drawdown,
        max_duration_days: max_duration.num_seconds() as f64 / 86_400.0,
    }
}

fn summarize_trades(trades: &[ClosedTrade]) -> TradeSummary {
    if trades.is_empty() {
        return TradeSummary::default();
    }

    let pnls = trades
        .iter()
        .map(|trade| trade.pnl.to_f64().unwrap_or(0.0))
        .collect::<Vec<_>>();

    let wins = pnls.iter().filter(|pnl| **pnl > 0.0).collect::<Vec<_>>();
    let losses = pnls.iter().filter(|pnl| **pnl < 0.0).collect::<Vec<_>>();

    let gross_win: f64 = wins.iter().copied().sum();
    let gross_loss: f64 = losses.iter().copied().sum();

    let mut max_consecutive_wins = 0usize;
    let mut max_consecutive_losses = 0usize;
    let mut streak_wins = 0usize;
    let mut streak_losses = 0usize;
    for pnl in &pnls {
        if *pnl > 0.0 {
            streak_wins += 1;
            streak_losses = 0;
        } else if *pnl < 0.0 {
            streak_losses += 1;
            streak_wins = 0;
        } else {
            streak_wins = 0;
            streak_losses = 0;
        }
        max_consecutive_wins = max_consecutive_wins.max(streak_wins);
        max_consecutive_losses = max_consecutive_losses.max(streak_losses);
    }

    let total_holding_secs: f64 = trades
        .iter()
        .map(|trade| (trade.exit_time_ms.saturating_sub(trade.entry_time_ms)) as f64 / 1_000.0)
        .sum();

    TradeSummary {
        total_trades: trades.len(),
        win_rate: wins.len() as f64 / trades.len() as f64,
        avg_win: if wins.is_empty() {
            0.0
        } else {
            gross_win / wins.len() as f64
        },
        avg_loss: if losses.is_empty() {
            0.0
        } else {
            (gross_loss / losses.len() as f64).abs()
        },
        profit_factor: ratio(gross_win, gross_loss.abs()),
        max_consecutive_wins,
        max_consecutive_losses,
        avg_holding_period_secs: total_holding_secs / trades.len() as f64,
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Downside deviation: dispersion of negative returns only (n - 1 denominator).
pub fn downside_deviation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let downside_sq: f64 = values.iter().map(|x| x.min(0.0).powi(2)).sum();
    (downside_sq / (n - 1.0)).sqrt()
}

/// Ratio with the zero-denominator convention of the dispersion metrics: infinite when the
/// denominator vanishes.
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        if numerator == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use carry_instrument::{PositionSide, exchange::ExchangeId, symbol::Symbol};
    use chrono::{DateTime, TimeDelta, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn curve(values: &[f64]) -> Vec<Timed<f64>> {
        let base = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(day, value)| Timed::new(*value, base + TimeDelta::days(day as i64)))
            .collect()
    }

    fn trade(pnl: Decimal, holding_secs: u64) -> ClosedTrade {
        ClosedTrade {
            id: 1,
            exchange: ExchangeId::Binance,
            symbol: Symbol::new("BTC/USDT:USDT"),
            side: PositionSide::Long,
            quantity: dec!(1),
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            entry_time_ms: 0,
            exit_time_ms: holding_secs * 1_000,
            pnl,
            pnl_percent: pnl / dec!(100),
            commission: dec!(0.04),
            net_pnl: pnl - dec!(0.04),
        }
    }

    #[test]
    fn test_drawdown_peak_trough_and_duration() {
        // Peak 110 at day 1; trough 88 at day 3; recovery above peak at day 5
        let curve = curve(&[100.0, 110.0, 99.0, 88.0, 95.0, 115.0, 112.0]);
        let drawdown = summarize_drawdown(&curve);

        // (110 - 88) / 110 = 0.2
        assert_relative_eq!(drawdown.max_drawdown, 0.2, epsilon = 1e-12);
        // Below the 110 peak from day 1 until day 4 (recovered at day 5); the later dip from
        // 115 lasts one day
        assert_relative_eq!(drawdown.max_duration_days, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_summary_total_and_annualized_return() {
        // 10% over 4 days
        let summary = summarize(&curve(&[100.0, 102.0, 101.0, 104.0, 110.0]), &[], 0.02);

        assert_relative_eq!(summary.total_return, 0.10, epsilon = 1e-12);
        let expected_annualized = 1.10f64.powf(365.0 / 4.0) - 1.0;
        assert_relative_eq!(
            summary.annualized_return,
            expected_annualized,
            epsilon = 1e-9
        );
        assert!(summary.volatility > 0.0);
        assert!(summary.sharpe.is_finite());
        assert!(summary.sortino >= summary.sharpe, "downside dev <= total dev");
    }

    #[test]
    fn test_flat_curve_has_infinite_sharpe_convention() {
        let summary = summarize(&curve(&[100.0, 100.0, 100.0]), &[], 0.02);
        assert_eq!(summary.volatility, 0.0);
        assert!(summary.sharpe.is_infinite());
    }

    #[test]
    fn test_trade_summary() {
        let trades = vec![
            trade(dec!(10), 60),
            trade(dec!(5), 120),
            trade(dec!(-4), 60),
            trade(dec!(-6), 60),
            trade(dec!(8), 300),
        ];
        let summary = summarize_trades(&trades);

        assert_eq!(summary.total_trades, 5);
        assert_relative_eq!(summary.win_rate, 0.6, epsilon = 1e-12);
        assert_relative_eq!(summary.avg_win, 23.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(summary.avg_loss, 5.0, epsilon = 1e-12);
        assert_relative_eq!(summary.profit_factor, 2.3, epsilon = 1e-12);
        assert_eq!(summary.max_consecutive_wins, 2);
        assert_eq!(summary.max_consecutive_losses, 2);
        assert_relative_eq!(summary.avg_holding_period_secs, 120.0, epsilon = 1e-12);
    }

    #[test]
    fn test_short_curve_yields_trade_stats_only() {
        let summary = summarize(&curve(&[100.0]), &[trade(dec!(1), 1)], 0.02);
        assert_eq!(summary.total_return, 0.0);
        assert_eq!(summary.trades.total_trades, 1);
    }
}

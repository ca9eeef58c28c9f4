use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

/// Process-wide risk state. Single-writer: mutated only by the
/// [`RiskManager`](crate::RiskManager); readers receive cloned snapshots.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RiskState {
    pub enabled: bool,
    pub strategies_paused: bool,
    pub pause_reason: Option<String>,
    pub daily_start_equity: Decimal,
    pub current_equity: Decimal,
    pub daily_peak_equity: Decimal,
    pub daily_pnl: Decimal,
    /// `1 - current_equity / daily_peak_equity`, floored at zero.
    pub daily_drawdown: f64,
    /// `total_equity / total_notional` across venues; `None` with no open notional.
    pub total_margin_ratio: Option<Decimal>,
    pub last_trigger_time: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub current_date: NaiveDate,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            strategies_paused: false,
            pause_reason: None,
            daily_start_equity: Decimal::ZERO,
            current_equity: Decimal::ZERO,
            daily_peak_equity: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            daily_drawdown: 0.0,
            total_margin_ratio: None,
            last_trigger_time: None,
            trigger_count: 0,
            current_date: now.date_naive(),
        }
    }

    /// Fold a fresh equity observation into the daily accounting.
    pub fn observe_equity(&mut self, equity: Decimal) {
        if self.daily_start_equity.is_zero() {
            self.daily_start_equity = equity;
        }
        self.current_equity = equity;
        if equity > self.daily_peak_equity {
            self.daily_peak_equity = equity;
        }
        self.daily_pnl = equity - self.daily_start_equity;
        self.daily_drawdown = if self.daily_peak_equity > Decimal::ZERO {
            (Decimal::ONE - equity / self.daily_peak_equity)
                .max(Decimal::ZERO)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
    }

    /// Start a new trading day: snapshot the opening equity and reset the peak.
    pub fn roll_date(&mut self, date: NaiveDate) {
        self.current_date = date;
        self.daily_start_equity = self.current_equity;
        self.daily_peak_equity = self.current_equity;
        self.daily_pnl = Decimal::ZERO;
        self.daily_drawdown = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_observe_equity_tracks_peak_and_drawdown() {
        let mut state = RiskState::new(Utc::now());

        state.observe_equity(dec!(10000));
        assert_eq!(state.daily_start_equity, dec!(10000));
        assert_eq!(state.daily_peak_equity, dec!(10000));
        assert_eq!(state.daily_drawdown, 0.0);

        state.observe_equity(dec!(10500));
        assert_eq!(state.daily_peak_equity, dec!(10500));
        assert_eq!(state.daily_pnl, dec!(500));

        state.observe_equity(dec!(9450));
        // 1 - 9450/10500 = 0.1
        assert!((state.daily_drawdown - 0.1).abs() < 1e-9);
        assert_eq!(state.daily_peak_equity, dec!(10500));
    }

    #[test]
    fn test_roll_date_resets_daily_accounting() {
        let mut state = RiskState::new(Utc::now());
        state.observe_equity(dec!(10000));
        state.observe_equity(dec!(9000));

        let tomorrow = state.current_date.succ_opt().unwrap();
        state.roll_date(tomorrow);

        assert_eq!(state.current_date, tomorrow);
        assert_eq!(state.daily_start_equity, dec!(9000));
        assert_eq!(state.daily_peak_equity, dec!(9000));
        assert_eq!(state.daily_pnl, dec!(0));
        assert_eq!(state.daily_drawdown, 0.0);
    }
}

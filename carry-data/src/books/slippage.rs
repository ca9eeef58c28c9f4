use crate::{books::OrderBook, event::Level};
use carry_instrument::Side;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

/// Default maximum tolerated slippage: 1% of the reference price.
pub fn default_max_slippage() -> Decimal {
    Decimal::new(1, 2)
}

/// Slippage model answering "at what average price does `quantity` execute against this book".
///
/// The analytic modes (fixed, linear, sqrt) always fill in full; only [`SlippageModel::Dynamic`]
/// walks the real ladder and can report an unfillable remainder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SlippageModel {
    /// Constant basis-point premium on the reference price.
    Fixed { bps: Decimal },
    /// Impact grows linearly with quantity: `coefficient * quantity`, capped.
    Linear {
        coefficient: Decimal,
        max_slippage: Decimal,
    },
    /// Square-root market-impact model: `coefficient * sqrt(quantity)`, capped.
    Sqrt {
        coefficient: Decimal,
        max_slippage: Decimal,
    },
    /// Walk the opposite ladder level-by-level and return the volume-weighted average price.
    ///
    /// Levels priced beyond `reference * (1 ± max_slippage)` are out of reach; quantity that
    /// only those levels could absorb is reported as unfilled.
    Dynamic { max_slippage: Decimal },
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self::Dynamic {
            max_slippage: default_max_slippage(),
        }
    }
}

/// Execution estimate produced by a [`SlippageModel`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SlippageQuote {
    /// Volume-weighted average execution price of the filled quantity.
    pub average_price: Decimal,
    pub filled_quantity: Decimal,
    pub unfilled_quantity: Decimal,
    /// Per-level fills, for the dynamic model; analytic models report one synthetic fill.
    pub fills: Vec<Level>,
}

impl SlippageModel {
    /// Estimate the execution of `quantity` on `side` against `book`.
    ///
    /// `reference_price` overrides the default reference (the best opposite level).
    /// Returns `None` if no reference price can be established (empty book and no override).
    pub fn quote(
        &self,
        book: &OrderBook,
        side: Side,
        quantity: Decimal,
        reference_price: Option<Decimal>,
    ) -> Option<SlippageQuote> {
        let opposite_best = match side {
            Side::Buy => book.best_ask().map(|level| level.price),
            Side::Sell => book.best_bid().map(|level| level.price),
        };
        let reference = reference_price.or(opposite_best)?;

        match self {
            SlippageModel::Fixed { bps } => {
                let fraction = *bps / Decimal::from(10_000u32);
                Some(analytic_quote(side, quantity, reference, fraction))
            }
            SlippageModel::Linear {
                coefficient,
                max_slippage,
            } => {
                let fraction = (*coefficient * quantity).min(*max_slippage);
                Some(analytic_quote(side, quantity, reference, fraction))
            }
            SlippageModel::Sqrt {
                coefficient,
                max_slippage,
            } => {
                let root = quantity.sqrt().unwrap_or(Decimal::ZERO);
                let fraction = (*coefficient * root).min(*max_slippage);
                Some(analytic_quote(side, quantity, reference, fraction))
            }
            SlippageModel::Dynamic { max_slippage } => {
                Some(dynamic_quote(book, side, quantity, reference, *max_slippage))
            }
        }
    }
}

fn analytic_quote(
    side: Side,
    quantity: Decimal,
    reference: Decimal,
    fraction: Decimal,
) -> SlippageQuote {
    let average_price = match side {
        Side::Buy => reference * (Decimal::ONE + fraction),
        Side::Sell => reference * (Decimal::ONE - fraction),
    };
    SlippageQuote {
        average_price,
        filled_quantity: quantity,
        unfilled_quantity: Decimal::ZERO,
        fills: vec![Level {
            price: average_price,
            amount: quantity,
        }],
    }
}

fn dynamic_quote(
    book: &OrderBook,
    side: Side,
    quantity: Decimal,
    reference: Decimal,
    max_slippage: Decimal,
) -> SlippageQuote {
    let cap_price = match side {
        Side::Buy => reference * (Decimal::ONE + max_slippage),
        Side::Sell => reference * (Decimal::ONE - max_slippage),
    };
    let within_cap = |price: Decimal| match side {
        Side::Buy => price <= cap_price,
        Side::Sell => price >= cap_price,
    };

    let opposite = match side {
        Side::Buy => book.asks().levels(),
        Side::Sell => book.bids().levels(),
    };

    let mut remaining = quantity;
    let mut notional = Decimal::ZERO;
    let mut fills = Vec::new();

    for level in opposite {
        if remaining.is_zero() || !within_cap(level.price) {
            break;
        }
        let take = level.amount.min(remaining);
        notional += level.price * take;
        remaining -= take;
        fills.push(Level {
            price: level.price,
            amount: take,
        });
    }

    let filled = quantity - remaining;
    let average_price = if filled.is_zero() {
        // Nothing reachable within the cap; clamp the quoted price to the cap
        cap_price
    } else {
        notional / filled
    };

    SlippageQuote {
        average_price,
        filled_quantity: filled,
        unfilled_quantity: remaining,
        fills,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        OrderBook::new(
            vec![Level::new(dec!(99), dec!(4))],
            vec![
                Level::new(dec!(100), dec!(1)),
                Level::new(dec!(101), dec!(2)),
            ],
        )
    }

    #[test]
    fn test_dynamic_vwap_walks_ladder() {
        let quote = SlippageModel::default()
            .quote(&book(), Side::Buy, dec!(2.5), None)
            .unwrap();

        // (1 * 100 + 1.5 * 101) / 2.5 = 100.6
        assert_eq!(quote.average_price, dec!(100.6));
        assert_eq!(quote.filled_quantity, dec!(2.5));
        assert_eq!(quote.unfilled_quantity, dec!(0));
        assert_eq!(
            quote.fills,
            vec![
                Level::new(dec!(100), dec!(1)),
                Level::new(dec!(101), dec!(1.5)),
            ]
        );
    }

    #[test]
    fn test_dynamic_reports_unfilled_beyond_book() {
        let quote = SlippageModel::default()
            .quote(&book(), Side::Buy, dec!(5), None)
            .unwrap();

        assert_eq!(quote.filled_quantity, dec!(3));
        assert_eq!(quote.unfilled_quantity, dec!(2));
    }

    #[test]
    fn test_dynamic_cap_excludes_deep_levels() {
        // Second ask level at 102 breaches the 1% cap on a 100 reference
        let book = OrderBook::new(
            vec![Level::new(dec!(99), dec!(4))],
            vec![
                Level::new(dec!(100), dec!(1)),
                Level::new(dec!(102), dec!(2)),
            ],
        );

        let quote = SlippageModel::default()
            .quote(&book, Side::Buy, dec!(3), None)
            .unwrap();

        assert_eq!(quote.filled_quantity, dec!(1));
        assert_eq!(quote.unfilled_quantity, dec!(2));
        assert_eq!(quote.average_price, dec!(100));
    }

    #[test]
    fn test_dynamic_empty_reach_clamps_price_to_cap() {
        let book = OrderBook::new(
            vec![],
            vec![Level::new(dec!(102), dec!(2))],
        );

        // Explicit reference 100; the only ask is beyond the 1% cap
        let quote = SlippageModel::default()
            .quote(&book, Side::Buy, dec!(1), Some(dec!(100)))
            .unwrap();

        assert_eq!(quote.filled_quantity, dec!(0));
        assert_eq!(quote.unfilled_quantity, dec!(1));
        assert_eq!(quote.average_price, dec!(101));
    }

    #[test]
    fn test_analytic_modes() {
        struct TestCase {
            model: SlippageModel,
            side: Side,
            quantity: Decimal,
            expected_price: Decimal,
        }

        let tests = vec![
            TestCase {
                // TC0: fixed 10bps buy on a 100 ask
                model: SlippageModel::Fixed { bps: dec!(10) },
                side: Side::Buy,
                quantity: dec!(1),
                expected_price: dec!(100.1),
            },
            TestCase {
                // TC1: fixed 10bps sell on a 99 bid
                model: SlippageModel::Fixed { bps: dec!(10) },
                side: Side::Sell,
                quantity: dec!(1),
                expected_price: dec!(98.901),
            },
            TestCase {
                // TC2: linear coef 0.001 * qty 4 = 0.4%
                model: SlippageModel::Linear {
                    coefficient: dec!(0.001),
                    max_slippage: dec!(0.01),
                },
                side: Side::Buy,
                quantity: dec!(4),
                expected_price: dec!(100.4),
            },
            TestCase {
                // TC3: linear capped at max_slippage
                model: SlippageModel::Linear {
                    coefficient: dec!(0.001),
                    max_slippage: dec!(0.01),
                },
                side: Side::Buy,
                quantity: dec!(100),
                expected_price: dec!(101),
            },
            TestCase {
                // TC4: sqrt coef 0.002 * sqrt(4) = 0.4%
                model: SlippageModel::Sqrt {
                    coefficient: dec!(0.002),
                    max_slippage: dec!(0.01),
                },
                side: Side::Buy,
                quantity: dec!(4),
                expected_price: dec!(100.4),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let quote = test
                .model
                .quote(&book(), test.side, test.quantity, None)
                .unwrap();
            assert_eq!(quote.average_price, test.expected_price, "TC{index} failed");
            assert_eq!(quote.filled_quantity, test.quantity, "TC{index} failed");
            assert_eq!(quote.unfilled_quantity, dec!(0), "TC{index} failed");
        }
    }
}

use crate::event::{DepthKind, DepthUpdate, Level};
use carry_instrument::Side;
use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// Provides an [`OrderBookMap`](map::OrderBookMap) collection of books keyed by
/// `(ExchangeId, Symbol)`.
pub mod map;
pub use map::OrderBookMap;

/// Slippage models answering "at what average price does a quantity execute against this book".
pub mod slippage;

/// Normalised Carry L2 [`OrderBook`] snapshot.
///
/// Exclusively owned by its maintaining component: the market-data engine for live books, the
/// matching engine for backtest books.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct OrderBook {
    bids: OrderBookSide<Bids>,
    asks: OrderBookSide<Asks>,
    last_update_time: Option<DateTime<Utc>>,
}

impl OrderBook {
    /// Construct a new sorted [`OrderBook`].
    ///
    /// Note that the passed bid and ask levels do not need to be pre-sorted.
    pub fn new<IterBids, IterAsks, L>(bids: IterBids, asks: IterAsks) -> Self
    where
        IterBids: IntoIterator<Item = L>,
        IterAsks: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        Self {
            bids: OrderBookSide::bids(bids),
            asks: OrderBookSide::asks(asks),
            last_update_time: None,
        }
    }

    /// Apply a normalised [`DepthUpdate`], replacing (snapshot) or upserting (delta) levels.
    pub fn apply(&mut self, update: &DepthUpdate, time: DateTime<Utc>) {
        match update.kind {
            DepthKind::Snapshot => self.apply_snapshot(&update.bids, &update.asks, time),
            DepthKind::Delta => self.apply_delta(&update.bids, &update.asks, time),
        }
    }

    /// Replace both sides with the provided snapshot levels.
    pub fn apply_snapshot(&mut self, bids: &[Level], asks: &[Level], time: DateTime<Utc>) {
        self.bids = OrderBookSide::bids(bids.iter().copied());
        self.asks = OrderBookSide::asks(asks.iter().copied());
        self.last_update_time = Some(time);
    }

    /// Upsert the provided levels into both sides; a zero amount deletes the level.
    pub fn apply_delta(&mut self, bids: &[Level], asks: &[Level], time: DateTime<Utc>) {
        self.bids.upsert(bids);
        self.asks.upsert(asks);
        self.last_update_time = Some(time);
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.last_update_time
    }

    /// Return a reference to this [`OrderBook`]s bids.
    pub fn bids(&self) -> &OrderBookSide<Bids> {
        &self.bids
    }

    /// Return a reference to this [`OrderBook`]s asks.
    pub fn asks(&self) -> &OrderBookSide<Asks> {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.best()
    }

    /// Calculate the mid-price by taking the average of the best bid and ask prices.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.bids.best(), self.asks.best()) {
            (Some(best_bid), Some(best_ask)) => {
                Some((best_bid.price + best_ask.price) / Decimal::TWO)
            }
            (Some(best_bid), None) => Some(best_bid.price),
            (None, Some(best_ask)) => Some(best_ask.price),
            (None, None) => None,
        }
    }

    /// `best_ask - best_bid`, requiring both sides to be non-empty.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.bids.best(), self.asks.best()) {
            (Some(best_bid), Some(best_ask)) => Some(best_ask.price - best_bid.price),
            _ => None,
        }
    }

    /// Spread as a fraction of the mid-price.
    pub fn spread_percent(&self) -> Option<Decimal> {
        let spread = self.spread()?;
        let mid = self.mid_price()?;
        (!mid.is_zero()).then(|| spread / mid)
    }

    /// Would a limit order at this price execute immediately against the opposite side?
    ///
    /// Buy crosses when `limit_price >= best_ask`; sell crosses when `limit_price <= best_bid`.
    pub fn can_fill_immediately(&self, side: Side, limit_price: Decimal) -> bool {
        match side {
            Side::Buy => self
                .asks
                .best()
                .is_some_and(|best_ask| limit_price >= best_ask.price),
            Side::Sell => self
                .bids
                .best()
                .is_some_and(|best_bid| limit_price <= best_bid.price),
        }
    }

    /// Walk the opposite side accumulating quantity while the level price satisfies
    /// `limit_price`, capped at `max_quantity`.
    pub fn fillable_quantity(
        &self,
        side: Side,
        limit_price: Decimal,
        max_quantity: Decimal,
    ) -> Decimal {
        let satisfies = |level: &Level| match side {
            Side::Buy => level.price <= limit_price,
            Side::Sell => level.price >= limit_price,
        };

        let opposite = match side {
            Side::Buy => self.asks.levels(),
            Side::Sell => self.bids.levels(),
        };

        let mut fillable = Decimal::ZERO;
        for level in opposite {
            if !satisfies(level) || fillable >= max_quantity {
                break;
            }
            fillable = (fillable + level.amount).min(max_quantity);
        }
        fillable
    }
}

/// Normalised Carry [`Level`]s for one `Side` of the [`OrderBook`].
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct OrderBookSide<Side> {
    #[serde(skip_serializing)]
    side: Side,
    levels: Vec<Level>,
}

/// Unit type to tag an [`OrderBookSide`] as the bid side (ie/ buyers) of an [`OrderBook`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Display)]
pub struct Bids;

/// Unit type to tag an [`OrderBookSide`] as the ask side (ie/ sellers) of an [`OrderBook`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Display)]
pub struct Asks;

impl OrderBookSide<Bids> {
    /// Construct a new [`OrderBookSide<Bids>`] sorted price-descending.
    pub fn bids<Iter, L>(levels: Iter) -> Self
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        let mut levels = levels.into_iter().map(L::into).collect::<Vec<_>>();
        levels.sort_unstable_by(|a, b| a.price.cmp(&b.price).reverse());

        Self { side: Bids, levels }
    }

    /// Upsert bid [`Level`]s into this [`OrderBookSide<Bids>`].
    pub fn upsert<L>(&mut self, levels: &[L])
    where
        L: Into<Level> + Copy,
    {
        levels.iter().for_each(|upsert| {
            let upsert: Level = (*upsert).into();
            self.upsert_single(upsert, |existing| {
                existing.price.cmp(&upsert.price).reverse()
            })
        })
    }
}

impl OrderBookSide<Asks> {
    /// Construct a new [`OrderBookSide<Asks>`] sorted price-ascending.
    pub fn asks<Iter, L>(levels: Iter) -> Self
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        let mut levels = levels.into_iter().map(L::into).collect::<Vec<_>>();
        levels.sort_unstable_by(|a, b| a.price.cmp(&b.price));

        Self { side: Asks, levels }
    }

    /// Upsert ask [`Level`]s into this [`OrderBookSide<Asks>`].
    pub fn upsert<L>(&mut self, levels: &[L])
    where
        L: Into<Level> + Copy,
    {
        levels.iter().for_each(|upsert| {
            let upsert: Level = (*upsert).into();
            self.upsert_single(upsert, |existing| existing.price.cmp(&upsert.price))
        })
    }
}

impl<Side> OrderBookSide<Side>
where
    Side: std::fmt::Display + std::fmt::Debug,
{
    /// Get the best [`Level`] on this [`OrderBookSide`].
    pub fn best(&self) -> Option<&Level> {
        self.levels.first()
    }

    /// Return a reference to the [`OrderBookSide`] levels.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Upsert a single [`Level`] into this [`OrderBookSide`].
    ///
    /// ### Upsert Scenarios
    /// #### 1 Level Already Exists
    /// 1a) New value is 0, remove the level
    /// 1b) New value is > 0, replace the level
    ///
    /// #### 2 Level Does Not Exist
    /// 2a) New value is 0, log debug and continue
    /// 2b) New value is > 0, insert new level
    fn upsert_single<FnOrd>(&mut self, new_level: Level, fn_ord: FnOrd)
    where
        FnOrd: Fn(&Level) -> Ordering,
    {
        match (self.levels.binary_search_by(fn_ord), new_level.amount) {
            (Ok(index), new_amount) => {
                if new_amount.is_zero() {
                    let _removed = self.levels.remove(index);
                } else {
                    self.levels[index].amount = new_amount;
                }
            }
            (Err(index), new_amount) => {
                if new_amount.is_zero() {
                    debug!(
                        ?new_level,
                        side = %self.side,
                        "received upsert Level with zero amount (to remove) that was not found"
                    );
                } else {
                    self.levels.insert(index, new_level);
                }
            }
        }
    }
}

impl Default for OrderBookSide<Bids> {
    fn default() -> Self {
        Self {
            side: Bids,
            levels: vec![],
        }
    }
}

impl Default for OrderBookSide<Asks> {
    fn default() -> Self {
        Self {
            side: Asks,
            levels: vec![],
        }
    }
}

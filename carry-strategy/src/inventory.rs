use carry_instrument::{PositionSide, Side, exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration of the [`InventoryManager`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InventoryConfig {
    /// Imbalance ratio beyond which a rebalance is considered.
    pub rebalance_threshold: f64,
    /// Minimum interval between rebalances of one symbol.
    pub rebalance_cooldown: Duration,
    /// Upper bound on the reduced quantity, as a fraction of total quantity.
    pub max_rebalance_ratio: Decimal,
    /// Rebalances below this notional are skipped.
    pub min_rebalance_size: Decimal,
    /// `total_notional / equity` ceiling for opening new inventory.
    pub max_inventory_ratio: f64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            rebalance_threshold: 0.20,
            rebalance_cooldown: Duration::from_secs(300),
            max_rebalance_ratio: Decimal::new(25, 2), // 0.25
            min_rebalance_size: Decimal::from(10u32),
            max_inventory_ratio: 0.30,
        }
    }
}

/// One venue's leg of a symbol's inventory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ExchangeInventory {
    pub side: PositionSide,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub funding_paid: Decimal,
    pub funding_received: Decimal,
    /// `funding_paid - funding_received`.
    pub net_funding: Decimal,
    pub leverage: Decimal,
    pub margin: Decimal,
}

/// Cross-venue aggregate for one symbol, rebuilt on every update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TotalInventory {
    pub exchanges: FnvHashMap<ExchangeId, ExchangeInventory>,
    /// `sum(sign * quantity)` across venues.
    pub net_position: Decimal,
    pub total_notional: Decimal,
    /// `|net_position| / sum(quantity)`.
    pub imbalance_ratio: f64,
    pub needs_rebalance: bool,
}

/// A single inventory-reduction instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceAction {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    /// Order side that reduces the held leg (opposite to the held side).
    pub side: Side,
    pub quantity: Decimal,
    pub reason: String,
    pub priority: u8,
}

/// Per-symbol, per-venue inventory ledger for the arbitrage legs.
#[derive(Debug, Default)]
pub struct InventoryManager {
    config: InventoryConfig,
    inventories: FnvHashMap<Symbol, FnvHashMap<ExchangeId, ExchangeInventory>>,
    last_rebalance: FnvHashMap<Symbol, DateTime<Utc>>,
}

impl InventoryManager {
    pub fn new(config: InventoryConfig) -> Self {
        Self {
            config,
            inventories: FnvHashMap::default(),
            last_rebalance: FnvHashMap::default(),
        }
    }

    /// Upsert one venue leg. A zero quantity flattens the leg but keeps its funding and
    /// realized-P&L accumulators.
    pub fn update_position(
        &mut self,
        exchange: ExchangeId,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        leverage: Decimal,
    ) {
        let leg = self
            .inventories
            .entry(symbol.clone())
            .or_default()
            .entry(exchange)
            .or_default();

        leg.side = if quantity.is_zero() {
            PositionSide::None
        } else {
            side
        };
        leg.quantity = quantity;
        leg.entry_price = entry_price;
        leg.notional = quantity * entry_price;
        leg.leverage = leverage;
        leg.margin = if leverage.is_zero() {
            leg.notional
        } else {
            leg.notional / leverage
        };
    }

    pub fn record_realized_pnl(&mut self, exchange: ExchangeId, symbol: &Symbol, pnl: Decimal) {
        let leg = self
            .inventories
            .entry(symbol.clone())
            .or_default()
            .entry(exchange)
            .or_default();
        leg.realized_pnl += pnl;
    }

    pub fn update_unrealized_pnl(
        &mut self,
        exchange: ExchangeId,
        symbol: &Symbol,
        unrealized: Decimal,
    ) {
        if let Some(leg) = self
            .inventories
            .get_mut(symbol)
            .and_then(|legs| legs.get_mut(&exchange))
        {
            leg.unrealized_pnl = unrealized;
        }
    }

    /// Record a funding cash flow: positive fees are paid, negative received.
    pub fn record_funding_fee(&mut self, exchange: ExchangeId, symbol: &Symbol, fee: Decimal) {
        let leg = self
            .inventories
            .entry(symbol.clone())
            .or_default()
            .entry(exchange)
            .or_default();

        if fee >= Decimal::ZERO {
            leg.funding_paid += fee;
        } else {
            leg.funding_received += -fee;
        }
        leg.net_funding = leg.funding_paid - leg.funding_received;
    }

    /// Rebuild the cross-venue aggregate for one symbol.
    pub fn total_inventory(&self, symbol: &Symbol) -> TotalInventory {
        let Some(legs) = self.inventories.get(symbol) else {
            return TotalInventory::default();
        };

        let mut net_position = Decimal::ZERO;
        let mut total_quantity = Decimal::ZERO;
        let mut total_notional = Decimal::ZERO;
        for leg in legs.values() {
            net_position += Decimal::from(leg.side.sign()) * leg.quantity;
            total_quantity += leg.quantity;
            total_notional += leg.notional;
        }

        let imbalance_ratio = if total_quantity.is_zero() {
            0.0
        } else {
            (net_position.abs() / total_quantity).to_f64().unwrap_or(0.0)
        };

        TotalInventory {
            exchanges: legs.clone(),
            net_position,
            total_notional,
            imbalance_ratio,
            needs_rebalance: imbalance_ratio > self.config.rebalance_threshold,
        }
    }

    /// Whether the symbol's imbalance warrants a rebalance now (threshold AND cooldown).
    pub fn needs_rebalance(&self, symbol: &Symbol, now: DateTime<Utc>) -> bool {
        let total = self.total_inventory(symbol);
        if !total.needs_rebalance {
            return false;
        }
        let cooldown = ChronoDuration::from_std(self.config.rebalance_cooldown)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        match self.last_rebalance.get(symbol) {
            Some(last) => now.signed_duration_since(*last) >= cooldown,
            None => true,
        }
    }

    /// Produce the reduction that brings the legs back towards balance.
    ///
    /// The over-weight side's largest leg is reduced by
    /// `min(|net_position| / 2, max_rebalance_ratio * total_quantity)`; reductions below the
    /// minimum notional are skipped. Records the rebalance time.
    pub fn generate_rebalance_actions(
        &mut self,
        symbol: &Symbol,
        now: DateTime<Utc>,
    ) -> Vec<RebalanceAction> {
        let total = self.total_inventory(symbol);
        if total.net_position.is_zero() {
            return vec![];
        }

        let heavy_side = if total.net_position > Decimal::ZERO {
            PositionSide::Long
        } else {
            PositionSide::Short
        };

        // Largest leg on the over-weight side
        let Some((exchange, leg)) = total
            .exchanges
            .iter()
            .filter(|(_, leg)| leg.side == heavy_side)
            .max_by_key(|(_, leg)| leg.quantity)
        else {
            return vec![];
        };

        let total_quantity: Decimal = total.exchanges.values().map(|leg| leg.quantity).sum();
        let reduce_quantity = (total.net_position.abs() / Decimal::TWO)
            .min(self.config.max_rebalance_ratio * total_quantity)
            .min(leg.quantity);

        // Quantity-weighted average entry across the over-weight legs prices the reduction
        let heavy_legs = total
            .exchanges
            .values()
            .filter(|leg| leg.side == heavy_side)
            .collect::<Vec<_>>();
        let heavy_quantity: Decimal = heavy_legs.iter().map(|leg| leg.quantity).sum();
        let weighted_entry = if heavy_quantity.is_zero() {
            leg.entry_price
        } else {
            heavy_legs
                .iter()
                .map(|leg| leg.entry_price * leg.quantity)
                .sum::<Decimal>()
                / heavy_quantity
        };

        if reduce_quantity * weighted_entry < self.config.min_rebalance_size {
            debug!(%symbol, %reduce_quantity, "rebalance below minimum notional - skipped");
            return vec![];
        }

        self.last_rebalance.insert(symbol.clone(), now);

        let Some(side) = heavy_side.exit_side() else {
            return vec![];
        };

        vec![RebalanceAction {
            exchange: *exchange,
            symbol: symbol.clone(),
            side,
            quantity: reduce_quantity,
            reason: format!(
                "imbalance {:.1}% exceeds threshold",
                total.imbalance_ratio * 100.0
            ),
            priority: 8,
        }]
    }

    /// Inventory-ratio gate for opening new positions on this symbol.
    pub fn can_open_position(&self, symbol: &Symbol, equity: Decimal) -> bool {
        if equity <= Decimal::ZERO {
            return false;
        }
        let total = self.total_inventory(symbol);
        (total.total_notional / equity).to_f64().unwrap_or(f64::MAX)
            < self.config.max_inventory_ratio
    }

    /// Symbols currently carrying any non-flat leg.
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.inventories
            .iter()
            .filter(|(_, legs)| legs.values().any(|leg| !leg.quantity.is_zero()))
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn symbol() -> Symbol {
        Symbol::new("BTC/USDT:USDT")
    }

    fn balanced_manager() -> InventoryManager {
        let mut manager = InventoryManager::new(InventoryConfig::default());
        manager.update_position(
            ExchangeId::Okx,
            &symbol(),
            PositionSide::Long,
            dec!(1),
            dec!(100),
            dec!(3),
        );
        manager.update_position(
            ExchangeId::Binance,
            &symbol(),
            PositionSide::Short,
            dec!(1),
            dec!(100),
            dec!(3),
        );
        manager
    }

    #[test]
    fn test_balanced_inventory_has_zero_imbalance() {
        let manager = balanced_manager();
        let total = manager.total_inventory(&symbol());

        assert_eq!(total.net_position, dec!(0));
        assert_eq!(total.total_notional, dec!(200));
        assert_eq!(total.imbalance_ratio, 0.0);
        assert!(!total.needs_rebalance);
    }

    #[test]
    fn test_imbalance_triggers_rebalance_after_cooldown() {
        let mut manager = balanced_manager();
        // Long leg grows to 2: net +1 of total 3 => 33% > 20%
        manager.update_position(
            ExchangeId::Okx,
            &symbol(),
            PositionSide::Long,
            dec!(2),
            dec!(100),
            dec!(3),
        );

        let now = Utc::now();
        assert!(manager.needs_rebalance(&symbol(), now));

        let actions = manager.generate_rebalance_actions(&symbol(), now);
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.exchange, ExchangeId::Okx);
        assert_eq!(action.side, Side::Sell);
        // min(|1|/2, 0.25 * 3) = 0.5
        assert_eq!(action.quantity, dec!(0.5));
        assert_eq!(action.priority, 8);

        // Cooldown: an immediate re-check must not rebalance again
        assert!(!manager.needs_rebalance(&symbol(), now));
        assert!(manager.needs_rebalance(&symbol(), now + ChronoDuration::seconds(301)));
    }

    #[test]
    fn test_small_rebalance_is_skipped() {
        let mut manager = InventoryManager::new(InventoryConfig::default());
        // Tiny long-only imbalance: 0.01 @ 100 => reduce notional 0.5 < 10
        manager.update_position(
            ExchangeId::Okx,
            &symbol(),
            PositionSide::Long,
            dec!(0.01),
            dec!(100),
            dec!(3),
        );

        let actions = manager.generate_rebalance_actions(&symbol(), Utc::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn test_funding_fee_ledger() {
        let mut manager = balanced_manager();
        manager.record_funding_fee(ExchangeId::Binance, &symbol(), dec!(1.5));
        manager.record_funding_fee(ExchangeId::Binance, &symbol(), dec!(-0.5));

        let total = manager.total_inventory(&symbol());
        let leg = &total.exchanges[&ExchangeId::Binance];
        assert_eq!(leg.funding_paid, dec!(1.5));
        assert_eq!(leg.funding_received, dec!(0.5));
        assert_eq!(leg.net_funding, dec!(1.0));
    }

    #[test]
    fn test_can_open_position_inventory_ratio() {
        let manager = balanced_manager();
        // 200 notional: allowed with 1000 equity (20% < 30%)
        assert!(manager.can_open_position(&symbol(), dec!(1000)));
        // Denied with 500 equity (40% >= 30%)
        assert!(!manager.can_open_position(&symbol(), dec!(500)));
        assert!(!manager.can_open_position(&symbol(), dec!(0)));
    }
}

use crate::backtest::BacktestEvent;
use std::{cmp::Ordering, collections::BinaryHeap};

/// Time-ordered event stream driving a backtest.
///
/// Delivery contract: strictly non-decreasing timestamps; equal timestamps resolve by stable
/// insertion order. Synthesized events (fills, liquidations, funding-at-tick) may be pushed
/// mid-replay at any timestamp at or after the current clock.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Entry>,
    sequence: u64,
    current_time: u64,
}

#[derive(Debug)]
struct Entry {
    timestamp: u64,
    sequence: u64,
    event: BacktestEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse for earliest-first, with the sequence number as
        // the stable tiebreak
        (self.timestamp, self.sequence)
            .cmp(&(other.timestamp, other.sequence))
            .reverse()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the queue from an already-sorted batch, preserving batch order on ties.
    pub fn extend<Iter>(&mut self, events: Iter)
    where
        Iter: IntoIterator<Item = BacktestEvent>,
    {
        for event in events {
            self.push(event);
        }
    }

    /// Insert an event. Timestamps before the current clock are clamped to it so replay
    /// never travels backwards.
    pub fn push(&mut self, event: BacktestEvent) {
        let timestamp = event.timestamp_ms().max(self.current_time);
        self.sequence += 1;
        self.heap.push(Entry {
            timestamp,
            sequence: self.sequence,
            event,
        });
    }

    /// Remove and return the earliest event, advancing the clock.
    pub fn pop(&mut self) -> Option<BacktestEvent> {
        let entry = self.heap.pop()?;
        self.current_time = entry.timestamp;
        Some(entry.event)
    }

    /// Current replay clock in epoch milliseconds.
    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::OrderFillEvent;
    use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
    use rust_decimal_macros::dec;

    fn fill_at(timestamp: u64, order_id: u64) -> BacktestEvent {
        BacktestEvent::OrderFilled(OrderFillEvent {
            timestamp,
            exchange: ExchangeId::Binance,
            symbol: Symbol::new("BTC/USDT:USDT"),
            order_id,
            fill_price: dec!(100),
            fill_quantity: dec!(1),
            fee: dec!(0.04),
            is_maker: false,
        })
    }

    #[test]
    fn test_non_decreasing_delivery_with_stable_ties() {
        let mut queue = EventQueue::new();
        queue.push(fill_at(200, 1));
        queue.push(fill_at(100, 2));
        queue.push(fill_at(200, 3));
        queue.push(fill_at(100, 4));

        let order_ids = std::iter::from_fn(|| queue.pop())
            .map(|event| match event {
                BacktestEvent::OrderFilled(fill) => fill.order_id,
                _ => unreachable!(),
            })
            .collect::<Vec<_>>();

        // Sorted by timestamp; insertion order preserved within equal timestamps
        assert_eq!(order_ids, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_push_before_clock_is_clamped() {
        let mut queue = EventQueue::new();
        queue.push(fill_at(100, 1));
        queue.push(fill_at(200, 2));
        assert!(queue.pop().is_some());
        assert_eq!(queue.current_time(), 100);

        // A synthesized event stamped in the past is delivered at the current clock, before
        // later-stamped events
        queue.push(fill_at(50, 3));
        match queue.pop().unwrap() {
            BacktestEvent::OrderFilled(fill) => assert_eq!(fill.order_id, 3),
            _ => unreachable!(),
        }
        assert_eq!(queue.current_time(), 100);
    }
}

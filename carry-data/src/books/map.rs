use crate::books::OrderBook;
use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use fnv::FnvHashMap;

/// Collection of local [`OrderBook`]s keyed by `(ExchangeId, Symbol)`.
///
/// One book exists per market; missing books are created lazily on first update.
#[derive(Debug, Default)]
pub struct OrderBookMap {
    books: FnvHashMap<(ExchangeId, Symbol), OrderBook>,
}

impl OrderBookMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, exchange: ExchangeId, symbol: &Symbol) -> Option<&OrderBook> {
        self.books.get(&(exchange, symbol.clone()))
    }

    pub fn find_or_create(&mut self, exchange: ExchangeId, symbol: &Symbol) -> &mut OrderBook {
        self.books
            .entry((exchange, symbol.clone()))
            .or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(ExchangeId, Symbol), &OrderBook)> {
        self.books.iter()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

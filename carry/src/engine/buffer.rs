use carry_data::event::MarketEvent;
use std::collections::VecDeque;
use tracing::warn;

/// Default inbound frame buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Bounded buffer between market-data fan-out and the strategy loop.
///
/// Back-pressure policy: when full, the oldest *droppable* event (depth, ticker) is evicted
/// first; funding and other critical events are never dropped - if only critical events
/// remain, a droppable newcomer is discarded and a critical newcomer is accepted over
/// capacity.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<MarketEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1_024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: MarketEvent) {
        if self.events.len() < self.capacity {
            self.events.push_back(event);
            return;
        }

        if let Some(index) = self.events.iter().position(|queued| queued.kind.is_droppable()) {
            self.events.remove(index);
            self.dropped += 1;
            self.events.push_back(event);
        } else if event.kind.is_droppable() {
            self.dropped += 1;
            if self.dropped % 1_000 == 0 {
                warn!(dropped = self.dropped, "event buffer saturated - dropping depth updates");
            }
        } else {
            // Never lose critical events: exceed capacity instead
            self.events.push_back(event);
        }
    }

    pub fn pop(&mut self) -> Option<MarketEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

//! Deduplication and staged delivery between the transport and the
//! aggregators. A client connects live and fetches the historical backlog
//! separately; without this staging, events could be applied out of order
//! or twice. `prepend` slots the backlog ahead of anything that arrived
//! live, and the single `flush` applies the whole consistent sequence and
//! switches to immediate forwarding.

use std::collections::VecDeque;

use shared::{domain::EventId, event::RoomEvent};
use tracing::{trace, warn};

use crate::{aggregate::EventConsumer, cache::FifoCache, config::OverflowPolicy, error::BufferError};

pub struct EventBuffer {
    seen: FifoCache<EventId, ()>,
    pending: VecDeque<RoomEvent>,
    consumers: Vec<Box<dyn EventConsumer>>,
    overflow: OverflowPolicy,
    autoflush: bool,
    dropped: usize,
}

impl EventBuffer {
    pub fn new(
        capacity: usize,
        overflow: OverflowPolicy,
        consumers: Vec<Box<dyn EventConsumer>>,
    ) -> Self {
        Self {
            seen: FifoCache::new(capacity),
            pending: VecDeque::new(),
            consumers,
            overflow,
            autoflush: false,
            dropped: 0,
        }
    }

    /// Accepts one raw event. Duplicates (by id) are dropped silently. In
    /// autoflush mode the event reaches every consumer before `put`
    /// returns; before the first flush it is buffered instead.
    pub fn put(&mut self, event: RoomEvent) {
        if self.seen.has(&event.id) {
            trace!(event_id = %event.id, "dropping duplicate event");
            return;
        }
        self.seen.set(event.id.clone(), ());
        if self.autoflush {
            self.dispatch(&event);
            return;
        }
        if self.pending.len() == self.seen.capacity() {
            // Best-effort buffer, not a durability guarantee.
            self.pending.pop_front();
            self.dropped += 1;
            warn!(
                dropped = self.dropped,
                "pending event buffer overflowed before flush"
            );
        }
        self.pending.push_back(event);
    }

    /// Splices a historical batch ahead of everything buffered so far,
    /// preserving its relative order. Only meaningful before the first
    /// flush; already-seen ids are skipped.
    pub fn prepend(&mut self, events: Vec<RoomEvent>) {
        for event in events.into_iter().rev() {
            if self.seen.has(&event.id) {
                trace!(event_id = %event.id, "skipping already-buffered historical event");
                continue;
            }
            self.seen.set(event.id.clone(), ());
            self.pending.push_front(event);
        }
        while self.pending.len() > self.seen.capacity() {
            self.pending.pop_front();
            self.dropped += 1;
            warn!("pending event buffer overflowed during prepend");
        }
    }

    /// Applies everything pending in arrival order and switches the buffer
    /// into autoflush mode permanently. Under [`OverflowPolicy::Strict`] a
    /// gapped stream (events dropped pre-flush) fails instead.
    pub fn flush(&mut self) -> Result<(), BufferError> {
        if self.overflow == OverflowPolicy::Strict && self.dropped > 0 {
            return Err(BufferError::Overflowed {
                dropped: self.dropped,
            });
        }
        while let Some(event) = self.pending.pop_front() {
            self.dispatch(&event);
        }
        self.autoflush = true;
        Ok(())
    }

    pub fn is_autoflush(&self) -> bool {
        self.autoflush
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(&mut self, event: &RoomEvent) {
        for consumer in &mut self.consumers {
            consumer.put(event);
        }
    }
}

#[cfg(test)]
#[path = "tests/buffer_tests.rs"]
mod tests;

//! Stateful aggregators deriving room state from the deduplicated event
//! stream. Each aggregator is the writer half over shared state; a
//! cloneable view handle exposes read-only snapshots to consumers, and
//! state changes are additionally published as [`crate::RoomUpdate`]s.

pub mod media;
pub mod messages;
pub mod peers;
pub mod recording;

pub use media::{Media, MediaAggregator, MediaView};
pub use messages::{ChatMessage, MessageAggregator, MessageSetter, MessagesView};
pub use peers::{Peer, PeerAggregator, PeersView};
pub use recording::{RecordingAggregator, RecordingView};

use shared::event::RoomEvent;

/// The seam shared by the live path and replay: the buffer and the replay
/// scheduler both drive consumers through `put`, run-to-completion on the
/// dispatching task. Duplicate ids never reach `put`; dedup happens
/// upstream.
pub trait EventConsumer: Send {
    fn put(&mut self, event: &RoomEvent);

    /// Bulk historical ingestion, applied once before any `put`. Only
    /// aggregators that distinguish backlog from live traffic override
    /// this.
    fn prepare(&mut self, _events: &[RoomEvent]) {}

    /// Clears derived state so the stream can be re-applied from scratch
    /// (room re-join, replay seek).
    fn reset(&mut self) {}
}

#[cfg(test)]
#[path = "tests/aggregate_tests.rs"]
mod tests;

//! Room event synchronization and replay engine.
//!
//! A room session is a stream of small, immutable, server-timestamped
//! events (presence, chat, recording status, track metadata). This crate
//! owns everything between the wire and the derived room state:
//!
//! - [`transport::RoomTransport`] multiplexes correlated request/response
//!   exchanges and unsolicited server pushes over one websocket.
//! - [`buffer::EventBuffer`] deduplicates the raw event stream and fans it
//!   out to the registered aggregators, either immediately or as a batch
//!   released by a single flush after the historical backfill.
//! - The aggregators in [`aggregate`] fold the deduplicated stream into
//!   peers, chat messages, media tracks, and the recording flag.
//! - [`replay::Replay`] re-drives the same aggregators from a stored event
//!   slice under a virtual playhead with play/pause/stop/seek.
//!
//! The engine drives exactly one room connection at a time and rebuilds
//! aggregator state from a fresh backfill on every connect. Collaborators
//! (the paginated event log, the profile repository) are injected, never
//! ambient.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{EventId, RecordingId, UserId},
    event::{EventLookup, RoomEvent},
};

pub mod aggregate;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod replay;
pub mod session;
pub mod transport;

pub use aggregate::EventConsumer;
pub use buffer::EventBuffer;
pub use cache::{FifoCache, LruCache};
pub use config::{EngineConfig, OverflowPolicy};
pub use error::{BufferError, ReplayError, SessionError, TransportError};
pub use replay::Replay;
pub use session::{RoomDeps, RoomSession};
pub use transport::{RoomTransport, TransportSignal};

/// Display metadata attached to peers and messages. Owned by an external
/// repository; the aggregators only hold a copy looked up by user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub handle: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Synchronous profile lookup. Implementations typically back this with a
/// debounced batched fetch and a small bounded cache; a miss is not an
/// error, the profile is simply absent from derived state.
pub trait ProfileRepo: Send + Sync {
    fn profile(&self, user_id: &UserId) -> Option<Profile>;
}

/// A repository that knows nobody.
pub struct NullProfileRepo;

impl ProfileRepo for NullProfileRepo {
    fn profile(&self, _user_id: &UserId) -> Option<Profile> {
        None
    }
}

/// Paginated historical event fetch, ordered by `(created_at, id)` and
/// honoring `limit`. Backs both the live-connect backfill and replay
/// loading.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn fetch(&self, lookup: EventLookup, limit: usize) -> Result<Vec<RoomEvent>>;
}

pub struct MissingEventLog;

#[async_trait]
impl EventLog for MissingEventLog {
    async fn fetch(&self, lookup: EventLookup, _limit: usize) -> Result<Vec<RoomEvent>> {
        Err(anyhow!("event log unavailable for room {}", lookup.room_id))
    }
}

/// Change notifications published by the aggregators and the replay
/// scheduler, consumed by whatever binds derived state to a UI.
#[derive(Debug, Clone)]
pub enum RoomUpdate {
    PeerJoined {
        peer_id: UserId,
    },
    PeerLeft {
        peer_id: UserId,
    },
    /// A message entered the log. The id is empty for a speculative local
    /// entry that has not been acknowledged yet.
    MessageAdded {
        id: EventId,
    },
    /// A speculative local message received its authoritative id.
    MessageAccepted {
        id: EventId,
    },
    /// A media track became visible (metadata and start marker both seen).
    MediaAdded {
        record_id: RecordingId,
    },
    MediaLive {
        record_id: RecordingId,
    },
    RecordingChanged {
        started: bool,
    },
    /// The live connection closed; `normal` distinguishes a user-initiated
    /// close from a failure, for the caller's reconnect policy.
    Disconnected {
        normal: bool,
    },
    /// The virtual playhead reached the end of the recording.
    ReplayFinished,
}

use std::time::Duration;

use serde::Deserialize;

/// What the event buffer does when live events overflow the pending queue
/// before the first flush (i.e. while the backfill is still in flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest pending event and keep going. Matches the behavior
    /// of rooms that tolerate a lossy pre-flush window.
    #[default]
    DropOldest,
    /// Still bound memory by dropping, but fail the flush so the caller
    /// can restart the backfill instead of applying a gapped stream.
    Strict,
}

/// Engine settings. Every field has a working default; hosts deserialize
/// this from their own config file and override what they need.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// How long a correlated request may wait for its response.
    pub request_timeout_ms: u64,
    /// Capacity of the dedup cache and of the pre-flush pending queue.
    pub event_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Maximum retained chat messages; oldest evicted beyond this.
    pub max_messages: usize,
    /// Peer roster bound; least-recently-touched peers evicted beyond it.
    pub max_peers: usize,
    /// Base URL of the storage server that serves track manifests.
    pub storage_base_url: String,
    /// Page size for event-log fetches (backfill and replay loading).
    pub fetch_limit: usize,
    /// How far before the recording start the replay backlog begins, so
    /// pre-roll context (already-joined peers) is available.
    pub replay_pre_roll_secs: u64,
    /// Fixed lookahead added to every replay timer arm.
    pub replay_lookahead_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            event_capacity: 512,
            overflow: OverflowPolicy::DropOldest,
            max_messages: 300,
            max_peers: 3_000,
            storage_base_url: "http://localhost:9000".into(),
            fetch_limit: 500,
            replay_pre_roll_secs: 600,
            replay_lookahead_ms: 10,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn replay_pre_roll(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.replay_pre_roll_secs as i64)
    }

    pub fn replay_lookahead(&self) -> Duration {
        Duration::from_millis(self.replay_lookahead_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.overflow, OverflowPolicy::DropOldest);
        assert!(config.event_capacity > 0);
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let raw = r#"{ "request_timeout_ms": 2500, "overflow": "strict" }"#;
        let config: EngineConfig = serde_json::from_str(raw).expect("config");
        assert_eq!(config.request_timeout_ms, 2_500);
        assert_eq!(config.overflow, OverflowPolicy::Strict);
        assert_eq!(config.max_messages, EngineConfig::default().max_messages);
    }
}

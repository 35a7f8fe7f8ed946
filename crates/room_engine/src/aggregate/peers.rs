use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use shared::{
    domain::{SessionId, UserId},
    event::{EventPayload, PeerStatus, RoomEvent},
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{cache::LruCache, EventConsumer, Profile, ProfileRepo, RoomUpdate};

/// A participant with at least one live session. A user holding several
/// tabs or devices is one peer with several session ids; the peer exists
/// exactly as long as its session set is non-empty.
#[derive(Debug, Clone)]
pub struct Peer {
    pub user_id: UserId,
    pub sessions: HashSet<SessionId>,
    pub profile: Option<Profile>,
}

type PeerMap = LruCache<UserId, Peer>;

pub struct PeerAggregator {
    inner: Arc<Mutex<PeerMap>>,
    profiles: Arc<dyn ProfileRepo>,
    updates: broadcast::Sender<RoomUpdate>,
}

impl PeerAggregator {
    pub fn new(
        capacity: usize,
        profiles: Arc<dyn ProfileRepo>,
        updates: broadcast::Sender<RoomUpdate>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
            profiles,
            updates,
        }
    }

    pub fn view(&self) -> PeersView {
        PeersView {
            inner: Arc::clone(&self.inner),
        }
    }

    fn joined(&self, peer_id: &UserId, session_id: &SessionId) {
        let mut peers = self.inner.lock().unwrap();
        let mut evicted = None;
        if let Some(peer) = peers.get_mut(peer_id) {
            if !peer.sessions.insert(session_id.clone()) {
                return;
            }
        } else {
            let mut sessions = HashSet::new();
            sessions.insert(session_id.clone());
            evicted = peers.set(
                peer_id.clone(),
                Peer {
                    user_id: peer_id.clone(),
                    sessions,
                    profile: self.profiles.profile(peer_id),
                },
            );
        }
        drop(peers);
        // An eviction at capacity leaves the roster like a leave does;
        // observers hear about it the same way.
        if let Some((evicted_id, _)) = evicted {
            let _ = self.updates.send(RoomUpdate::PeerLeft {
                peer_id: evicted_id,
            });
        }
        let _ = self.updates.send(RoomUpdate::PeerJoined {
            peer_id: peer_id.clone(),
        });
    }

    fn left(&self, peer_id: &UserId, session_id: &SessionId) {
        let mut peers = self.inner.lock().unwrap();
        let Some(peer) = peers.get_mut(peer_id) else {
            return;
        };
        if !peer.sessions.remove(session_id) {
            return;
        }
        if peer.sessions.is_empty() {
            peers.delete(peer_id);
            drop(peers);
            let _ = self.updates.send(RoomUpdate::PeerLeft {
                peer_id: peer_id.clone(),
            });
        }
    }
}

impl Clone for PeerAggregator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            profiles: Arc::clone(&self.profiles),
            updates: self.updates.clone(),
        }
    }
}

impl EventConsumer for PeerAggregator {
    fn put(&mut self, event: &RoomEvent) {
        let EventPayload::PeerState(state) = &event.payload else {
            return;
        };
        match state.status {
            PeerStatus::Joined => self.joined(&state.peer_id, &state.session_id),
            PeerStatus::Left => self.left(&state.peer_id, &state.session_id),
            PeerStatus::Unknown => {
                debug!(peer_id = %state.peer_id, "ignoring unknown peer status");
            }
        }
    }

    fn reset(&mut self) {
        self.inner.lock().unwrap().clear();
    }
}

#[derive(Clone)]
pub struct PeersView {
    inner: Arc<Mutex<PeerMap>>,
}

impl PeersView {
    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, peer_id: &UserId) -> Option<Peer> {
        self.inner.lock().unwrap().peek(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &UserId) -> bool {
        self.inner.lock().unwrap().has(peer_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use shared::{
    domain::{EventId, UserId},
    event::{EventPayload, RoomEvent},
};
use tokio::sync::broadcast;

use crate::{EventConsumer, Profile, ProfileRepo, RoomUpdate};

/// A chat entry in the room log. A locally authored message starts with an
/// empty id and `accepted = false`; both are settled exactly once when the
/// server assigns the authoritative id.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: EventId,
    pub from_id: UserId,
    pub text: String,
    pub accepted: bool,
    pub profile: Option<Profile>,
}

struct Stored {
    message: ChatMessage,
    /// Correlates a speculative entry with its pending [`MessageSetter`].
    local: Option<u64>,
}

struct MessageLog {
    entries: VecDeque<Stored>,
    next_local: u64,
    max_entries: usize,
}

impl MessageLog {
    fn push(&mut self, stored: Stored) {
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(stored);
    }
}

pub struct MessageAggregator {
    inner: Arc<Mutex<MessageLog>>,
    profiles: Arc<dyn ProfileRepo>,
    updates: broadcast::Sender<RoomUpdate>,
}

impl MessageAggregator {
    pub fn new(
        max_entries: usize,
        profiles: Arc<dyn ProfileRepo>,
        updates: broadcast::Sender<RoomUpdate>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MessageLog {
                entries: VecDeque::new(),
                next_local: 1,
                max_entries,
            })),
            profiles,
            updates,
        }
    }

    pub fn view(&self) -> MessagesView {
        MessagesView {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Inserts a speculative local entry and returns the setter that will
    /// assign its authoritative id once the server acknowledges the send.
    pub fn add_message(&self, from_id: UserId, text: impl Into<String>) -> MessageSetter {
        let mut log = self.inner.lock().unwrap();
        let local = log.next_local;
        log.next_local += 1;
        log.push(Stored {
            message: ChatMessage {
                id: EventId::default(),
                from_id: from_id.clone(),
                text: text.into(),
                accepted: false,
                profile: self.profiles.profile(&from_id),
            },
            local: Some(local),
        });
        drop(log);
        let _ = self.updates.send(RoomUpdate::MessageAdded {
            id: EventId::default(),
        });
        MessageSetter {
            inner: Arc::clone(&self.inner),
            updates: self.updates.clone(),
            local,
        }
    }
}

impl Clone for MessageAggregator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            profiles: Arc::clone(&self.profiles),
            updates: self.updates.clone(),
        }
    }
}

impl EventConsumer for MessageAggregator {
    fn put(&mut self, event: &RoomEvent) {
        let EventPayload::Message(body) = &event.payload else {
            return;
        };
        let mut log = self.inner.lock().unwrap();
        if let Some(stored) = log
            .entries
            .iter_mut()
            .find(|stored| stored.message.id == event.id)
        {
            // Update-only merge; never a second entry for a known id.
            stored.message.from_id = body.from_id.clone();
            stored.message.text = body.text.clone();
            stored.message.accepted = true;
        } else {
            log.push(Stored {
                message: ChatMessage {
                    id: event.id.clone(),
                    from_id: body.from_id.clone(),
                    text: body.text.clone(),
                    accepted: true,
                    profile: self.profiles.profile(&body.from_id),
                },
                local: None,
            });
        }
        drop(log);
        let _ = self.updates.send(RoomUpdate::MessageAdded {
            id: event.id.clone(),
        });
    }

    fn reset(&mut self) {
        let mut log = self.inner.lock().unwrap();
        log.entries.clear();
    }
}

/// One-shot handle assigning the authoritative id to a speculative entry.
/// Consumed on use, so the id is set at most once.
pub struct MessageSetter {
    inner: Arc<Mutex<MessageLog>>,
    updates: broadcast::Sender<RoomUpdate>,
    local: u64,
}

impl MessageSetter {
    pub fn set(self, id: EventId) {
        let mut log = self.inner.lock().unwrap();
        // The matching event may have raced the acknowledgment through the
        // live stream; in that case the entry for this id already exists
        // and the speculative one is dropped instead of duplicated.
        let already_known = log.entries.iter().any(|stored| stored.message.id == id);
        let Some(pos) = log
            .entries
            .iter()
            .position(|stored| stored.local == Some(self.local))
        else {
            return;
        };
        if already_known {
            log.entries.remove(pos);
        } else if let Some(stored) = log.entries.get_mut(pos) {
            stored.message.id = id.clone();
            stored.message.accepted = true;
            stored.local = None;
        }
        drop(log);
        let _ = self.updates.send(RoomUpdate::MessageAccepted { id });
    }
}

#[derive(Clone)]
pub struct MessagesView {
    inner: Arc<Mutex<MessageLog>>,
}

impl MessagesView {
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|stored| stored.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }
}

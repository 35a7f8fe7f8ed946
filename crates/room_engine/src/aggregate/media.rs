use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shared::{
    domain::{RecordingId, RoomId},
    event::{EventPayload, RoomEvent, TrackKind, TrackRecord, TrackSource},
};
use tokio::sync::broadcast;

use crate::{EventConsumer, RoomUpdate};

/// A recorded media track, visible only once both its descriptive
/// metadata and its recording-start marker have been observed.
#[derive(Debug, Clone)]
pub struct Media {
    pub record_id: RecordingId,
    pub kind: TrackKind,
    pub source: TrackSource,
    /// Offset from the recording start, milliseconds.
    pub started_at: i64,
    pub manifest_url: String,
    pub is_live: bool,
}

#[derive(Default)]
struct Slot {
    meta: Option<TrackRecord>,
    started_at: Option<i64>,
    is_live: bool,
}

impl Slot {
    fn complete(&self) -> bool {
        self.meta.is_some() && self.started_at.is_some()
    }
}

pub struct MediaAggregator {
    inner: Arc<Mutex<HashMap<RecordingId, Slot>>>,
    room_id: RoomId,
    storage_base_url: String,
    updates: broadcast::Sender<RoomUpdate>,
}

impl MediaAggregator {
    pub fn new(
        room_id: RoomId,
        storage_base_url: impl Into<String>,
        updates: broadcast::Sender<RoomUpdate>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            room_id,
            storage_base_url: storage_base_url.into(),
            updates,
        }
    }

    pub fn view(&self) -> MediaView {
        MediaView {
            inner: Arc::clone(&self.inner),
            room_id: self.room_id.clone(),
            storage_base_url: self.storage_base_url.clone(),
        }
    }

    fn apply(&self, event: &RoomEvent, live: bool) {
        match &event.payload {
            EventPayload::TrackRecord(batch) => {
                let mut slots = self.inner.lock().unwrap();
                for record in &batch.records {
                    let slot = slots.entry(record.record_id.clone()).or_default();
                    let was_complete = slot.complete();
                    slot.meta = Some(record.clone());
                    if slot.complete() && !was_complete {
                        let record_id = record.record_id.clone();
                        let _ = self.updates.send(RoomUpdate::MediaAdded { record_id });
                    }
                }
            }
            EventPayload::TrackRecording(batch) => {
                let mut slots = self.inner.lock().unwrap();
                for start in &batch.records {
                    let slot = slots.entry(start.record_id.clone()).or_default();
                    let was_complete = slot.complete();
                    slot.started_at = Some(start.started_at);
                    if live {
                        slot.is_live = true;
                        let _ = self.updates.send(RoomUpdate::MediaLive {
                            record_id: start.record_id.clone(),
                        });
                    }
                    if slot.complete() && !was_complete {
                        let _ = self.updates.send(RoomUpdate::MediaAdded {
                            record_id: start.record_id.clone(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

impl Clone for MediaAggregator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            room_id: self.room_id.clone(),
            storage_base_url: self.storage_base_url.clone(),
            updates: self.updates.clone(),
        }
    }
}

impl EventConsumer for MediaAggregator {
    fn put(&mut self, event: &RoomEvent) {
        self.apply(event, true);
    }

    /// Historical ingestion: metadata and start offsets are recorded, but
    /// nothing in the backlog is live.
    fn prepare(&mut self, events: &[RoomEvent]) {
        for event in events {
            self.apply(event, false);
        }
    }

    /// Clears only the live flags. Metadata and start offsets survive a
    /// leave/rejoin so tracks re-display instantly.
    fn reset(&mut self) {
        let mut slots = self.inner.lock().unwrap();
        for slot in slots.values_mut() {
            slot.is_live = false;
        }
    }
}

#[derive(Clone)]
pub struct MediaView {
    inner: Arc<Mutex<HashMap<RecordingId, Slot>>>,
    room_id: RoomId,
    storage_base_url: String,
}

impl MediaView {
    /// Completed tracks only; partial knowledge stays internal.
    pub fn snapshot(&self) -> Vec<Media> {
        let slots = self.inner.lock().unwrap();
        let mut media: Vec<Media> = slots
            .iter()
            .filter_map(|(record_id, slot)| self.materialize(record_id, slot))
            .collect();
        media.sort_by_key(|m| m.started_at);
        media
    }

    pub fn get(&self, record_id: &RecordingId) -> Option<Media> {
        let slots = self.inner.lock().unwrap();
        slots
            .get(record_id)
            .and_then(|slot| self.materialize(record_id, slot))
    }

    fn materialize(&self, record_id: &RecordingId, slot: &Slot) -> Option<Media> {
        let meta = slot.meta.as_ref()?;
        let started_at = slot.started_at?;
        Some(Media {
            record_id: record_id.clone(),
            kind: meta.kind,
            source: meta.source,
            started_at,
            manifest_url: manifest_url(&self.storage_base_url, &self.room_id, record_id),
            is_live: slot.is_live,
        })
    }
}

/// Addressing scheme of the external storage server; must stay stable for
/// manifest interoperability.
pub fn manifest_url(storage_base_url: &str, room_id: &RoomId, record_id: &RecordingId) -> String {
    format!(
        "{}/confa-tracks-public/{}/{}/manifest",
        storage_base_url.trim_end_matches('/'),
        room_id,
        record_id
    )
}

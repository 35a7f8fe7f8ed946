use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use shared::event::{EventPayload, RecordingStatus, RoomEvent};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{EventConsumer, RoomUpdate};

/// Two-state machine (`Stopped -> Started -> Stopped -> ...`) driven by
/// recording-status events. Duplicate and unknown statuses are ignored.
pub struct RecordingAggregator {
    started: Arc<AtomicBool>,
    updates: broadcast::Sender<RoomUpdate>,
}

impl RecordingAggregator {
    pub fn new(updates: broadcast::Sender<RoomUpdate>) -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
            updates,
        }
    }

    pub fn view(&self) -> RecordingView {
        RecordingView {
            started: Arc::clone(&self.started),
        }
    }
}

impl Clone for RecordingAggregator {
    fn clone(&self) -> Self {
        Self {
            started: Arc::clone(&self.started),
            updates: self.updates.clone(),
        }
    }
}

impl EventConsumer for RecordingAggregator {
    fn put(&mut self, event: &RoomEvent) {
        let EventPayload::Recording(recording) = &event.payload else {
            return;
        };
        let target = match recording.status {
            RecordingStatus::Started => true,
            RecordingStatus::Stopped => false,
            RecordingStatus::Unknown => {
                debug!("ignoring unknown recording status");
                return;
            }
        };
        if self.started.swap(target, Ordering::SeqCst) != target {
            let _ = self
                .updates
                .send(RoomUpdate::RecordingChanged { started: target });
        }
    }

    fn reset(&mut self) {
        self.started.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct RecordingView {
    started: Arc<AtomicBool>,
}

impl RecordingView {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

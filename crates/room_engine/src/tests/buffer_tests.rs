use std::sync::{Arc, Mutex};

use chrono::DateTime;
use shared::{
    domain::{EventId, RoomId, UserId},
    event::{EventMessage, EventPayload, RoomEvent},
};

use super::*;
use crate::config::OverflowPolicy;

#[derive(Clone, Default)]
struct RecordingConsumer {
    applied: Arc<Mutex<Vec<String>>>,
}

impl RecordingConsumer {
    fn ids(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

impl EventConsumer for RecordingConsumer {
    fn put(&mut self, event: &RoomEvent) {
        self.applied.lock().unwrap().push(event.id.0.clone());
    }
}

fn event(id: &str, at_ms: i64) -> RoomEvent {
    RoomEvent {
        id: EventId::from(id),
        room_id: RoomId::from("room-1"),
        owner_id: Some(UserId::from("user-a")),
        created_at: DateTime::from_timestamp_millis(at_ms).expect("timestamp"),
        payload: EventPayload::Message(EventMessage {
            from_id: UserId::from("user-a"),
            text: format!("msg {id}"),
        }),
    }
}

fn buffer_with_consumer(
    capacity: usize,
    overflow: OverflowPolicy,
) -> (EventBuffer, RecordingConsumer) {
    let consumer = RecordingConsumer::default();
    let buffer = EventBuffer::new(capacity, overflow, vec![Box::new(consumer.clone())]);
    (buffer, consumer)
}

#[test]
fn duplicates_are_fanned_out_exactly_once_in_first_seen_order() {
    let (mut buffer, consumer) = buffer_with_consumer(16, OverflowPolicy::DropOldest);
    for id in ["a", "b", "a", "c", "b", "a", "d"] {
        buffer.put(event(id, 0));
    }
    buffer.flush().expect("flush");
    assert_eq!(consumer.ids(), vec!["a", "b", "c", "d"]);
}

#[test]
fn nothing_reaches_consumers_before_flush() {
    let (mut buffer, consumer) = buffer_with_consumer(16, OverflowPolicy::DropOldest);
    buffer.put(event("a", 0));
    buffer.put(event("b", 1));
    assert!(consumer.ids().is_empty());
    assert_eq!(buffer.pending_len(), 2);
}

#[test]
fn flush_switches_to_autoflush_permanently() {
    let (mut buffer, consumer) = buffer_with_consumer(16, OverflowPolicy::DropOldest);
    buffer.put(event("a", 0));
    buffer.flush().expect("flush");
    assert!(buffer.is_autoflush());

    buffer.put(event("b", 1));
    assert_eq!(consumer.ids(), vec!["a", "b"]);
    assert_eq!(buffer.pending_len(), 0);
}

#[test]
fn prepend_slots_history_ahead_of_live_events() {
    let (mut buffer, consumer) = buffer_with_consumer(16, OverflowPolicy::DropOldest);
    buffer.put(event("live-1", 100));
    buffer.put(event("live-2", 101));
    buffer.prepend(vec![event("old-1", 1), event("old-2", 2)]);
    buffer.flush().expect("flush");
    assert_eq!(consumer.ids(), vec!["old-1", "old-2", "live-1", "live-2"]);
}

#[test]
fn prepend_skips_events_already_seen_live() {
    let (mut buffer, consumer) = buffer_with_consumer(16, OverflowPolicy::DropOldest);
    buffer.put(event("x", 100));
    buffer.prepend(vec![event("old", 1), event("x", 100)]);
    buffer.flush().expect("flush");
    assert_eq!(consumer.ids(), vec!["old", "x"]);
}

#[test]
fn overflow_drops_oldest_by_default() {
    let (mut buffer, consumer) = buffer_with_consumer(2, OverflowPolicy::DropOldest);
    buffer.put(event("a", 0));
    buffer.put(event("b", 1));
    buffer.put(event("c", 2));
    buffer.flush().expect("flush");
    assert_eq!(consumer.ids(), vec!["b", "c"]);
}

#[test]
fn strict_overflow_fails_the_flush() {
    let (mut buffer, consumer) = buffer_with_consumer(2, OverflowPolicy::Strict);
    buffer.put(event("a", 0));
    buffer.put(event("b", 1));
    buffer.put(event("c", 2));
    let err = buffer.flush().expect_err("gapped stream must not flush");
    assert!(matches!(err, BufferError::Overflowed { dropped: 1 }));
    assert!(consumer.ids().is_empty());
    assert!(!buffer.is_autoflush());
}

#[test]
fn duplicate_after_flush_is_still_dropped() {
    let (mut buffer, consumer) = buffer_with_consumer(16, OverflowPolicy::DropOldest);
    buffer.put(event("a", 0));
    buffer.flush().expect("flush");
    buffer.put(event("a", 0));
    assert_eq!(consumer.ids(), vec!["a"]);
}

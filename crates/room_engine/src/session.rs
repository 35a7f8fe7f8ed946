//! Live-path glue: one connected room. Wires the transport into the
//! buffer/deduplicator, runs the initial backfill (prepend + single
//! flush), and exposes the derived-state views and the chat send path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use shared::{
    domain::{EventId, RoomId, UserId},
    event::{EventLookup, RoomEvent},
    protocol::{MessageSend, ReactionSend, WirePayload},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::{
    aggregate::{
        EventConsumer, MediaAggregator, MediaView, MessageAggregator, MessagesView,
        PeerAggregator, PeersView, RecordingAggregator, RecordingView,
    },
    buffer::EventBuffer,
    config::EngineConfig,
    error::SessionError,
    transport::{RoomCloseCode, RoomTransport, TransportSignal},
    EventLog, ProfileRepo, RoomUpdate,
};

/// Collaborators the engine does not own: the paginated event log and the
/// profile repository.
#[derive(Clone)]
pub struct RoomDeps {
    pub event_log: Arc<dyn EventLog>,
    pub profiles: Arc<dyn ProfileRepo>,
}

pub struct RoomSession {
    transport: Arc<RoomTransport>,
    messages_agg: MessageAggregator,
    peers: PeersView,
    messages: MessagesView,
    media: MediaView,
    recording: RecordingView,
    updates: broadcast::Sender<RoomUpdate>,
    buffer: Arc<Mutex<EventBuffer>>,
    room_id: RoomId,
    user_id: UserId,
}

impl RoomSession {
    /// Connects to the room and brings derived state up to date: live
    /// events start buffering immediately, the historical backlog is
    /// prepended, and one flush applies the whole consistent sequence
    /// before live forwarding takes over. State is always rebuilt from
    /// scratch here; nothing survives a reconnect.
    pub async fn connect(
        config: &EngineConfig,
        deps: RoomDeps,
        room_id: RoomId,
        user_id: UserId,
        server_url: &str,
        token: &str,
    ) -> Result<Self, SessionError> {
        let (updates, _) = broadcast::channel(256);

        let peers_agg =
            PeerAggregator::new(config.max_peers, Arc::clone(&deps.profiles), updates.clone());
        let messages_agg = MessageAggregator::new(
            config.max_messages,
            Arc::clone(&deps.profiles),
            updates.clone(),
        );
        let media_agg = MediaAggregator::new(
            room_id.clone(),
            config.storage_base_url.clone(),
            updates.clone(),
        );
        let recording_agg = RecordingAggregator::new(updates.clone());

        let peers = peers_agg.view();
        let messages = messages_agg.view();
        let media = media_agg.view();
        let recording = recording_agg.view();

        // Fan-out order is registration order.
        let consumers: Vec<Box<dyn EventConsumer>> = vec![
            Box::new(peers_agg),
            Box::new(messages_agg.clone()),
            Box::new(media_agg),
            Box::new(recording_agg),
        ];
        let buffer = Arc::new(Mutex::new(EventBuffer::new(
            config.event_capacity,
            config.overflow,
            consumers,
        )));

        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(
            RoomTransport::connect(
                server_url,
                &room_id,
                token,
                config.request_timeout(),
                signals_tx,
            )
            .await?,
        );

        let dispatch_buffer = Arc::clone(&buffer);
        let dispatch_updates = updates.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals_rx.recv().await {
                match signal {
                    TransportSignal::Event(event) => {
                        dispatch_buffer.lock().unwrap().put(event);
                    }
                    TransportSignal::Closed { normal } => {
                        if !normal {
                            warn!("room connection lost");
                        }
                        let _ = dispatch_updates.send(RoomUpdate::Disconnected { normal });
                        break;
                    }
                }
            }
        });

        // Backfill after the live stream is flowing, so nothing falls in
        // the gap between snapshot and subscription.
        let history = fetch_backlog(deps.event_log.as_ref(), &room_id, config.fetch_limit)
            .await
            .map_err(SessionError::Backfill)?;
        info!(room_id = %room_id, events = history.len(), "room backfill fetched");
        {
            let mut buffer = buffer.lock().unwrap();
            buffer.prepend(history);
            buffer.flush()?;
        }

        Ok(Self {
            transport,
            messages_agg,
            peers,
            messages,
            media,
            recording,
            updates,
            buffer,
            room_id,
            user_id,
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Authors a chat message. The entry appears immediately as a
    /// speculative message; once the server acknowledges the send, its
    /// authoritative id is assigned in place and the duplicate event
    /// arriving over the stream merges instead of re-inserting. On timeout
    /// the entry stays unaccepted; retrying is the caller's decision.
    pub async fn send_message(&self, text: &str) -> Result<EventId, SessionError> {
        let setter = self.messages_agg.add_message(self.user_id.clone(), text);
        let response = self
            .transport
            .send(WirePayload::Message(MessageSend {
                from_id: self.user_id.clone(),
                text: text.to_owned(),
            }))
            .await?;
        match response {
            WirePayload::MessageAck(ack) => {
                let id = ack.event.id.clone();
                setter.set(id.clone());
                // The authoritative event also feeds the stream directly;
                // dedup makes the pushed copy a no-op.
                self.buffer.lock().unwrap().put(ack.event);
                Ok(id)
            }
            WirePayload::Error(err) => Err(SessionError::Rejected(err)),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }

    /// Ephemeral reaction; best-effort, no response defined.
    pub async fn send_reaction(&self, reaction: &str) -> Result<(), SessionError> {
        self.transport
            .notify(WirePayload::Reaction(ReactionSend {
                from_id: self.user_id.clone(),
                reaction: reaction.to_owned(),
            }))
            .await?;
        Ok(())
    }

    pub fn peers(&self) -> &PeersView {
        &self.peers
    }

    pub fn messages(&self) -> &MessagesView {
        &self.messages
    }

    pub fn media(&self) -> &MediaView {
        &self.media
    }

    pub fn recording(&self) -> &RecordingView {
        &self.recording
    }

    pub fn updates(&self) -> broadcast::Receiver<RoomUpdate> {
        self.updates.subscribe()
    }

    /// User-initiated close; the disconnect signal carries `normal: true`
    /// so reconnect logic stays quiet.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.transport.close(RoomCloseCode::Normal).await?;
        Ok(())
    }
}

/// Pages through the room's full history, advancing the lower bound by the
/// last timestamp of each page until the log serves a short page. Pages
/// overlap at the boundary timestamp; duplicates are dropped by id.
async fn fetch_backlog(
    event_log: &dyn EventLog,
    room_id: &RoomId,
    limit: usize,
) -> anyhow::Result<Vec<RoomEvent>> {
    let mut events: Vec<RoomEvent> = Vec::new();
    let mut seen = HashSet::new();
    let mut since: Option<DateTime<Utc>> = None;
    loop {
        let page = event_log
            .fetch(
                EventLookup {
                    room_id: room_id.clone(),
                    since,
                },
                limit,
            )
            .await?;
        let page_len = page.len();
        let Some(last) = page.last() else {
            break;
        };
        let next_since = last.created_at;
        for event in page {
            if seen.insert(event.id.clone()) {
                events.push(event);
            }
        }
        // A window that stops advancing means the log cannot page further;
        // bail rather than spin.
        if page_len < limit || since.is_some_and(|s| next_since <= s) {
            break;
        }
        since = Some(next_since);
    }
    events.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });
    Ok(events)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

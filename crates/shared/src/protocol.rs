use serde::{Deserialize, Serialize};

use crate::{
    domain::{RoomId, UserId},
    error::ApiError,
    event::RoomEvent,
};

/// Envelope for every frame exchanged over a room connection. A frame with
/// a `request_id` expects a reply; a frame with a `response_id` is that
/// reply; a frame with neither is an unsolicited push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<WirePayload>,
}

impl WireMessage {
    pub fn request(request_id: u64, payload: WirePayload) -> Self {
        Self {
            request_id: Some(request_id),
            response_id: None,
            payload: Some(payload),
        }
    }

    pub fn push(payload: WirePayload) -> Self {
        Self {
            request_id: None,
            response_id: None,
            payload: Some(payload),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WirePayload {
    /// Server push: a room event.
    Event(RoomEvent),
    /// Client request: author a chat message.
    Message(MessageSend),
    /// Server response to [`WirePayload::Message`]: the authoritative
    /// event created for the send.
    MessageAck(MessageAck),
    /// Client notification: an ephemeral reaction. No reply is defined.
    Reaction(ReactionSend),
    /// Client request: ask for the current room state snapshot.
    State(StateQuery),
    /// Server response to [`WirePayload::State`].
    StateSnapshot(StateSnapshot),
    /// Server response: the request was rejected.
    Error(ApiError),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSend {
    pub from_id: UserId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    pub event: RoomEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSend {
    pub from_id: UserId,
    pub reaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateQuery {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub room_id: RoomId,
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

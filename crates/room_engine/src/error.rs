use shared::error::ApiError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid room server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to connect room socket: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("not connected to a room")]
    Disconnected,
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: u64, timeout_ms: u64 },
    #[error("connection lost before a response arrived")]
    ConnectionLost,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to send frame: {0}")]
    Send(#[source] tungstenite::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    /// Events were dropped before the first flush under the strict
    /// overflow policy; the stream has a gap and must be re-synced.
    #[error("{dropped} event(s) dropped before flush")]
    Overflowed { dropped: usize },
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("recording has not finished yet")]
    RecordingNotFinished,
    #[error("failed to fetch recording events: {0}")]
    Fetch(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("failed to backfill room history: {0}")]
    Backfill(#[source] anyhow::Error),
    #[error("server rejected the request: {0}")]
    Rejected(ApiError),
    #[error("unexpected response payload")]
    UnexpectedResponse,
}

//! One bidirectional websocket per room, carrying caller-initiated
//! request/response exchanges and unsolicited server pushes on the same
//! channel. Responses are correlated to requests by id; everything else is
//! forwarded to the registered signal channel.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::RoomId,
    event::RoomEvent,
    protocol::{WireMessage, WirePayload},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::TransportError;

pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as RoomCloseCode;

/// Everything the transport surfaces to its owner besides request
/// responses: server pushes and the close signal for reconnect policy.
#[derive(Debug)]
pub enum TransportSignal {
    Event(RoomEvent),
    Closed { normal: bool },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<WirePayload>>>>;

pub struct RoomTransport {
    writer: Mutex<WsSink>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl RoomTransport {
    /// Opens the room connection. Resolves once the websocket handshake
    /// completes, or fails if the underlying connection errors first.
    /// Pushes and the close signal are delivered on `signals`.
    pub async fn connect(
        server_url: &str,
        room_id: &RoomId,
        token: &str,
        request_timeout: Duration,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<Self, TransportError> {
        let url = room_socket_url(server_url, room_id, token)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(TransportError::Connect)?;
        info!(room_id = %room_id, "room socket connected");
        let (writer, mut reader) = stream.split();

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            let mut closed_normally = false;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        dispatch_frame(&text, &reader_pending, &signals);
                    }
                    Ok(Message::Close(close)) => {
                        closed_normally = close
                            .as_ref()
                            .map(|frame| frame.code == CloseCode::Normal)
                            .unwrap_or(false);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("room socket receive failed: {err}");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Wake every in-flight request with a closed channel.
            reader_pending.lock().unwrap().clear();
            let _ = signals.send(TransportSignal::Closed {
                normal: closed_normally,
            });
        });

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            connected,
            next_request_id: AtomicU64::new(1),
            request_timeout,
            reader,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends a correlated request and waits for its response. Exactly one
    /// of {matching response, timeout} resolves the caller; a timed-out
    /// request is purged and never retried here.
    pub async fn send(&self, payload: WirePayload) -> Result<WirePayload, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);

        let frame = serde_json::to_string(&WireMessage::request(request_id, payload))?;
        if let Err(err) = self.write(Message::Text(frame)).await {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(err);
        }
        trace!(request_id, "request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(TransportError::Timeout {
                    request_id,
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget: no request id, no response expected.
    pub async fn notify(&self, payload: WirePayload) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let frame = serde_json::to_string(&WireMessage::push(payload))?;
        self.write(Message::Text(frame)).await
    }

    /// Closes the connection. `RoomCloseCode::Normal` marks a
    /// user-initiated close for the owner's reconnect logic.
    pub async fn close(&self, code: RoomCloseCode) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            })))
            .await
            .map_err(TransportError::Send)
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(message).await.map_err(|err| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::Send(err)
        })
    }
}

impl Drop for RoomTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn dispatch_frame(
    text: &str,
    pending: &PendingMap,
    signals: &mpsc::UnboundedSender<TransportSignal>,
) {
    let frame: WireMessage = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropping malformed frame: {err}");
            return;
        }
    };
    if let Some(response_id) = frame.response_id {
        let waiter = pending.lock().unwrap().remove(&response_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame.payload.unwrap_or(WirePayload::Unknown));
            }
            // Already resolved or timed out; a late response is a no-op.
            None => debug!(response_id, "response for unknown request"),
        }
        return;
    }
    match frame.payload {
        Some(WirePayload::Event(event)) => {
            let _ = signals.send(TransportSignal::Event(event));
        }
        Some(other) => {
            debug!("ignoring non-event push: {other:?}");
        }
        None => {}
    }
}

fn room_socket_url(server_url: &str, room_id: &RoomId, token: &str) -> Result<Url, TransportError> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_url.to_owned()
    };
    let mut url = Url::parse(&ws_base)?;
    url.set_path(&format!("/rooms/{}/events", room_id));
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

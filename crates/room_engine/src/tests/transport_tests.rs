use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{EventId, RoomId, UserId},
    event::{EventMessage, EventPayload, RoomEvent},
    protocol::{MessageAck, MessageSend, StateQuery, StateSnapshot, WireMessage, WirePayload},
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::*;

/// One-connection websocket server; hands inbound text frames to `script`
/// together with a sender for outbound frames.
async fn spawn_server<F>(script: F) -> String
where
    F: Fn(WireMessage, mpsc::UnboundedSender<WireMessage>) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = accept_async(stream).await.expect("handshake");
        let (mut writer, mut reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let message = serde_json::from_str(&text).expect("frame");
                        script(message, out_tx.clone());
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                outbound = out_rx.recv() => match outbound {
                    Some(message) => {
                        let text = serde_json::to_string(&message).expect("encode");
                        if writer.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    format!("ws://{addr}")
}

fn sample_event(id: &str) -> RoomEvent {
    RoomEvent {
        id: EventId::from(id),
        room_id: RoomId::from("room-1"),
        owner_id: Some(UserId::from("user-a")),
        created_at: Utc::now(),
        payload: EventPayload::Message(EventMessage {
            from_id: UserId::from("user-a"),
            text: "hi".into(),
        }),
    }
}

fn state_query() -> WirePayload {
    WirePayload::State(StateQuery {
        room_id: RoomId::from("room-1"),
    })
}

fn snapshot_response(request_id: u64) -> WireMessage {
    WireMessage {
        request_id: None,
        response_id: Some(request_id),
        payload: Some(WirePayload::StateSnapshot(StateSnapshot {
            room_id: RoomId::from("room-1"),
            events: vec![],
        })),
    }
}

async fn connect(
    url: &str,
    timeout: Duration,
) -> (RoomTransport, mpsc::UnboundedReceiver<TransportSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = RoomTransport::connect(url, &RoomId::from("room-1"), "token", timeout, tx)
        .await
        .expect("connect");
    (transport, rx)
}

#[tokio::test]
async fn concurrent_requests_resolve_out_of_order_by_id() {
    let url = spawn_server(|message, out| {
        let request_id = message.request_id.expect("request");
        // Answer the first request only after the second arrived, so the
        // responses come back in reverse order.
        if request_id == 2 {
            out.send(snapshot_response(2)).expect("respond");
            out.send(WireMessage {
                request_id: None,
                response_id: Some(1),
                payload: Some(WirePayload::MessageAck(MessageAck {
                    event: sample_event("m1"),
                })),
            })
            .expect("respond");
        }
    })
    .await;
    let (transport, _signals) = connect(&url, Duration::from_secs(5)).await;

    let first = transport.send(WirePayload::Message(MessageSend {
        from_id: UserId::from("user-a"),
        text: "hello".into(),
    }));
    let second = transport.send(state_query());
    let (first, second) = tokio::join!(first, second);

    match first.expect("first response") {
        WirePayload::MessageAck(ack) => assert_eq!(ack.event.id.as_str(), "m1"),
        other => panic!("wrong payload for request 1: {other:?}"),
    }
    assert!(matches!(
        second.expect("second response"),
        WirePayload::StateSnapshot(_)
    ));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let url = spawn_server(|_message, _out| {}).await;
    let (transport, _signals) = connect(&url, Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let err = transport
        .send(state_query())
        .await
        .expect_err("no response was scripted");
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn pushes_are_forwarded_to_the_signal_channel() {
    let url = spawn_server(|message, out| {
        // Reply to any request with a push first, then the response.
        let request_id = message.request_id.expect("request");
        out.send(WireMessage::push(WirePayload::Event(sample_event("ev-7"))))
            .expect("push");
        out.send(snapshot_response(request_id)).expect("respond");
    })
    .await;
    let (transport, mut signals) = connect(&url, Duration::from_secs(5)).await;

    transport.send(state_query()).await.expect("response");
    match signals.recv().await.expect("signal") {
        TransportSignal::Event(event) => assert_eq!(event.id.as_str(), "ev-7"),
        other => panic!("unexpected signal: {other:?}"),
    }
}

#[tokio::test]
async fn responses_are_not_forwarded_as_events() {
    let url = spawn_server(|message, out| {
        if let Some(request_id) = message.request_id {
            out.send(snapshot_response(request_id)).expect("respond");
        }
    })
    .await;
    let (transport, mut signals) = connect(&url, Duration::from_secs(5)).await;

    transport.send(state_query()).await.expect("response");
    transport.close(RoomCloseCode::Normal).await.expect("close");
    // The only signal must be the close, never the response payload.
    match signals.recv().await.expect("signal") {
        TransportSignal::Closed { .. } => {}
        other => panic!("response leaked to signal channel: {other:?}"),
    }
}

#[tokio::test]
async fn notify_carries_no_request_id() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let url = spawn_server(move |message, _out| {
        seen_tx.send(message).expect("record");
    })
    .await;
    let (transport, _signals) = connect(&url, Duration::from_secs(5)).await;

    transport.notify(state_query()).await.expect("notify");
    let frame = seen_rx.recv().await.expect("frame");
    assert!(frame.request_id.is_none());
    assert!(frame.response_id.is_none());
}

#[tokio::test]
async fn request_ids_start_at_one_and_increment() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let url = spawn_server(move |message, out| {
        let request_id = message.request_id.expect("request");
        seen_tx.send(request_id).expect("record");
        out.send(snapshot_response(request_id)).expect("respond");
    })
    .await;
    let (transport, _signals) = connect(&url, Duration::from_secs(5)).await;

    transport.send(state_query()).await.expect("first");
    transport.send(state_query()).await.expect("second");
    assert_eq!(seen_rx.recv().await, Some(1));
    assert_eq!(seen_rx.recv().await, Some(2));
}

#[tokio::test]
async fn send_after_close_fails_fast() {
    let url = spawn_server(|_message, _out| {}).await;
    let (transport, _signals) = connect(&url, Duration::from_secs(5)).await;

    transport.close(RoomCloseCode::Normal).await.expect("close");
    let err = transport
        .send(state_query())
        .await
        .expect_err("disconnected transport must refuse");
    assert!(matches!(err, TransportError::Disconnected));
}

#[tokio::test]
async fn stray_response_for_unknown_request_is_ignored() {
    let url = spawn_server(|message, out| {
        let request_id = message.request_id.expect("request");
        out.send(snapshot_response(9_999)).expect("stray");
        out.send(snapshot_response(request_id)).expect("respond");
    })
    .await;
    let (transport, _signals) = connect(&url, Duration::from_secs(5)).await;

    // The stray response must not break correlation for the real one.
    assert!(transport.send(state_query()).await.is_ok());
}

#[test]
fn socket_url_carries_room_and_token() {
    let url =
        room_socket_url("https://confa.example.com", &RoomId::from("room-1"), "tok").expect("url");
    assert_eq!(
        url.as_str(),
        "wss://confa.example.com/rooms/room-1/events?token=tok"
    );
}

#[test]
fn plain_ws_urls_pass_through() {
    let url = room_socket_url("ws://127.0.0.1:9001", &RoomId::from("r"), "t").expect("url");
    assert!(url.as_str().starts_with("ws://127.0.0.1:9001/rooms/r/"));
}

#[tokio::test]
async fn connect_to_a_dead_endpoint_fails() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = RoomTransport::connect(
        "ws://127.0.0.1:1",
        &RoomId::from("room-1"),
        "token",
        Duration::from_secs(1),
        tx,
    )
    .await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
}

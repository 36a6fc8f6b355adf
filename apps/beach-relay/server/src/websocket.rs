use std::{sync::Arc, time::Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use beach_relay_core::{
    protocol::{decode_frame, encode_frame, ClientFrame, Notification, Request, ServerFrame},
    ErrorCode, ErrorPayload, RoomId,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    app::AppState,
    coordinator::{CoordinatorError, PeerSession},
};

pub async fn ws_room_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let room_id = RoomId::from(room_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id))
}

pub async fn ws_default_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, RoomId::default()))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, room_id: RoomId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let (mut session, mut events) = state.coordinator.connect(room_id);
    let peer_id = session.peer_id().clone();
    info!(peer_id = %peer_id, room_id = %session.room_id(), "signaling connection opened");
    counter!("beach_relay_connections_total", 1);
    gauge!("beach_relay_connections_active", state.connection_opened() as f64);

    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(peer_id = %writer_peer, "writer task finished");
    });

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&mut session, &text, &out_tx).await;
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_text(&mut session, text, &out_tx).await,
                    Err(_) => warn!(peer_id = %peer_id, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        peer_id = %peer_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(peer_id = %peer_id, error = %err, "error receiving message");
                    break;
                }
                None => break,
            },
            Some(event) = events.recv() => {
                if let Some(notification) = session.handle_room_event(event) {
                    send_notification(&out_tx, notification);
                }
            }
        }
    }

    session.close();
    drop(out_tx);
    let _ = writer.await;
    gauge!("beach_relay_connections_active", state.connection_closed() as f64);
    info!(peer_id = %peer_id, "signaling connection closed");
}

/// Answers one client frame with exactly one response, followed by any
/// notifications the request produced.
async fn handle_text(session: &mut PeerSession, text: &str, out: &mpsc::UnboundedSender<Message>) {
    let frame: ClientFrame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            counter!("beach_relay_invalid_frames_total", 1);
            warn!(peer_id = %session.peer_id(), error = %err, "rejecting malformed frame");
            if let Some(id) = request_id(text) {
                send_frame(
                    out,
                    &ServerFrame::error(id, ErrorPayload::new(ErrorCode::InvalidRequest, err.to_string())),
                );
            }
            return;
        }
    };

    let ClientFrame::Request { id, method, data } = frame;
    let started = Instant::now();
    let outcome = match Request::decode(method, data) {
        Ok(request) => session.handle(request).await,
        Err(err) => Err(CoordinatorError::InvalidRequest(err.to_string())),
    };
    histogram!(
        "beach_relay_request_duration_ms",
        started.elapsed().as_secs_f64() * 1000.0,
        "method" => method.as_str()
    );

    match outcome {
        Ok(reply) => {
            counter!(
                "beach_relay_requests_total",
                1,
                "method" => method.as_str(),
                "outcome" => "ok"
            );
            send_frame(out, &ServerFrame::ok(id, reply.data));
            for notification in reply.notifications {
                send_notification(out, notification);
            }
        }
        Err(err) => {
            counter!(
                "beach_relay_requests_total",
                1,
                "method" => method.as_str(),
                "outcome" => err.metric_label()
            );
            debug!(
                peer_id = %session.peer_id(),
                method = method.as_str(),
                error = %err,
                "request rejected"
            );
            send_frame(out, &ServerFrame::error(id, err.to_payload()));
        }
    }
}

/// Best effort recovery of the correlation id from a frame that failed to
/// decode, so the caller still gets its acknowledgement.
fn request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text).ok()?.get("id")?.as_u64()
}

fn send_notification(out: &mpsc::UnboundedSender<Message>, notification: Notification) {
    match notification.into_frame() {
        Ok(frame) => send_frame(out, &frame),
        Err(err) => warn!(error = %err, "failed to encode notification"),
    }
}

fn send_frame(out: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match encode_frame(frame) {
        Ok(text) => {
            let _ = out.send(Message::Text(text));
        }
        Err(err) => warn!(error = %err, "failed to encode server frame"),
    }
}

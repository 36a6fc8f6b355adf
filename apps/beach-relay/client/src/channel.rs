//! Request/acknowledgement channel over a websocket.
//!
//! Each request carries a fresh id and suspends until the matching response
//! frame arrives, the per-request timeout elapses, or the socket goes away.
//! Notifications and the final disconnect are surfaced as [`ChannelEvent`]s.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use beach_relay_core::protocol::{
    decode_frame, encode_frame, AckResult, ClientFrame, Notification, ServerFrame, SignalRequest,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{ChannelError, RequestError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Notification(Notification),
    /// The socket is gone; emitted exactly once, after which no other event
    /// follows.
    Disconnected { reason: String },
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

type PendingMap = HashMap<u64, oneshot::Sender<AckResult>>;

struct Shared {
    /// `None` once the channel has closed; new requests fail immediately.
    pending: Mutex<Option<PendingMap>>,
}

impl Shared {
    fn register(&self, id: u64, sender: oneshot::Sender<AckResult>) -> Result<(), ChannelError> {
        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id, sender);
                Ok(())
            }
            None => Err(ChannelError::Closed),
        }
    }

    fn forget(&self, id: u64) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&id);
        }
    }

    fn complete(&self, id: u64, result: AckResult) {
        let sender = self
            .pending
            .lock()
            .as_mut()
            .and_then(|pending| pending.remove(&id));
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!(request_id = id, "dropping acknowledgement for unknown request"),
        }
    }

    /// Fails every in-flight request by dropping its completion sender.
    fn close(&self) -> usize {
        self.pending
            .lock()
            .take()
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().is_none()
    }
}

pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl SignalingChannel {
    pub async fn connect(
        url: &str,
        config: ChannelConfig,
    ) -> Result<(Self, ChannelEvents), ChannelError> {
        let (stream, _response) = tokio::time::timeout(config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ChannelError::ConnectTimeout {
                url: url.to_string(),
                timeout: config.connect_timeout,
            })?
            .map_err(|err| ChannelError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        debug!(url, "signaling channel connected");
        Ok(Self::from_stream(stream, config))
    }

    /// Wraps an already established websocket.
    pub fn from_stream<S>(stream: WebSocketStream<S>, config: ChannelConfig) -> (Self, ChannelEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Some(HashMap::new())),
        });

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(source, Arc::clone(&shared), events_tx));

        let channel = Self {
            outbound,
            shared,
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout,
        };
        (channel, events_rx)
    }

    pub async fn request<R: SignalRequest>(&self, request: &R) -> Result<R::Response, RequestError> {
        let method = R::METHOD.as_str();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = ClientFrame::request(id, request)
            .and_then(|frame| encode_frame(&frame))
            .map_err(|err| ChannelError::Encode {
                method,
                reason: err.to_string(),
            })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.register(id, ack_tx)?;
        if self.outbound.send(Message::Text(text.into())).is_err() {
            self.shared.forget(id);
            return Err(ChannelError::Closed.into());
        }
        debug!(request_id = id, method, "request sent");

        let ack = match tokio::time::timeout(self.request_timeout, ack_rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(ChannelError::Closed.into()),
            Err(_) => {
                self.shared.forget(id);
                warn!(request_id = id, method, "request timed out");
                return Err(ChannelError::TimedOut {
                    method,
                    timeout: self.request_timeout,
                }
                .into());
            }
        };

        match ack {
            AckResult::Ok(data) => serde_json::from_value(data).map_err(|err| {
                ChannelError::Decode {
                    method,
                    reason: err.to_string(),
                }
                .into()
            }),
            AckResult::Error(payload) => Err(RequestError::Rejected(payload)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Fails in-flight requests and starts the websocket close handshake.
    pub fn close(&self) {
        let abandoned = self.shared.close();
        if abandoned > 0 {
            debug!(abandoned, "closing channel with requests in flight");
        }
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "websocket write failed");
            return;
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(text.as_str(), &shared, &events),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(text, &shared, &events),
                Err(_) => warn!("dropping non-utf8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => break err.to_string(),
            None => break "connection ended".to_string(),
        }
    };

    let abandoned = shared.close();
    debug!(reason = %reason, abandoned, "signaling channel disconnected");
    let _ = events.send(ChannelEvent::Disconnected { reason });
}

fn handle_frame(text: &str, shared: &Shared, events: &mpsc::UnboundedSender<ChannelEvent>) {
    let frame: ServerFrame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "ignoring malformed server frame");
            return;
        }
    };
    match frame {
        ServerFrame::Response { id, result } => shared.complete(id, result),
        ServerFrame::Notification { method, data } => match Notification::decode(method, data) {
            Ok(notification) => {
                let _ = events.send(ChannelEvent::Notification(notification));
            }
            Err(err) => warn!(error = %err, "ignoring malformed notification"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beach_relay_core::{
        protocol::{
            Empty, GetRouterRtpCapabilitiesRequest, JoinRequest, JoinResponse,
            NewProducerNotification, ResumeRequest,
        },
        ErrorCode, ErrorPayload, MediaKind, PeerId, ProducerId, RoomId, RtpCapabilities,
    };
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair(config: ChannelConfig) -> (SignalingChannel, ChannelEvents, WebSocketStream<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (channel, events) = SignalingChannel::from_stream(client, config);
        (channel, events, server)
    }

    async fn next_request(server: &mut WebSocketStream<DuplexStream>) -> (u64, String, serde_json::Value) {
        loop {
            match server.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: ClientFrame = decode_frame(text.as_str()).unwrap();
                    let ClientFrame::Request { id, method, data } = frame;
                    return (id, method.as_str().to_string(), data);
                }
                Some(Ok(_)) => continue,
                other => panic!("server stream ended: {other:?}"),
            }
        }
    }

    async fn reply(server: &mut WebSocketStream<DuplexStream>, frame: ServerFrame) {
        let text = encode_frame(&frame).unwrap();
        server.send(Message::Text(text.into())).await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn acknowledgements_are_correlated_by_id() {
        let (channel, _events, mut server) = pair(ChannelConfig::default()).await;
        let channel = Arc::new(channel);

        let join = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.request(&JoinRequest::default()).await }
        });
        let (join_id, method, data) = next_request(&mut server).await;
        assert_eq!(method, "join");
        assert_eq!(data, json!({}));

        let caps = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.request(&GetRouterRtpCapabilitiesRequest {}).await }
        });
        let (caps_id, method, _) = next_request(&mut server).await;
        assert_eq!(method, "getRouterRtpCapabilities");
        assert_ne!(join_id, caps_id);

        // Answer out of order.
        reply(&mut server, ServerFrame::ok(caps_id, json!({ "codecs": [] }))).await;
        reply(
            &mut server,
            ServerFrame::ok(join_id, json!({ "peerId": "p-1", "roomId": "lobby" })),
        )
        .await;

        let caps: RtpCapabilities = caps.await.unwrap().unwrap();
        assert!(caps.codecs.is_empty());
        let joined: JoinResponse = join.await.unwrap().unwrap();
        assert_eq!(joined.peer_id, PeerId::from("p-1"));
        assert_eq!(joined.room_id, RoomId::from("lobby"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_request_surfaces_error_payload() {
        let (channel, _events, mut server) = pair(ChannelConfig::default()).await;
        let pending = tokio::spawn(async move {
            let result = channel.request(&ResumeRequest::default()).await;
            (channel, result)
        });
        let (id, _, _) = next_request(&mut server).await;
        reply(
            &mut server,
            ServerFrame::error(id, ErrorPayload::new(ErrorCode::NotFound, "no consumer")),
        )
        .await;
        let (_channel, result) = pending.await.unwrap();
        assert_eq!(
            result.unwrap_err(),
            RequestError::Rejected(ErrorPayload::new(ErrorCode::NotFound, "no consumer"))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unanswered_request_times_out() {
        let (channel, _events, mut server) = pair(ChannelConfig {
            request_timeout: Duration::from_millis(50),
            ..ChannelConfig::default()
        })
        .await;
        let pending = tokio::spawn(async move { channel.request(&ResumeRequest::default()).await });
        let _ = next_request(&mut server).await;
        let err: RequestError = pending.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            RequestError::Channel(ChannelError::TimedOut { method: "resume", .. })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn server_close_fails_in_flight_requests_and_reports_disconnect() {
        let (channel, mut events, mut server) = pair(ChannelConfig::default()).await;
        let channel = Arc::new(channel);
        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.request(&ResumeRequest::default()).await }
        });
        let _ = next_request(&mut server).await;
        server.close(None).await.unwrap();

        let result: Result<Empty, RequestError> = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), RequestError::Channel(ChannelError::Closed));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Disconnected { .. })
        ));
        assert!(channel.is_closed());
        assert_eq!(
            channel.request(&ResumeRequest::default()).await.unwrap_err(),
            RequestError::Channel(ChannelError::Closed)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn notifications_are_delivered_in_order() {
        let (_channel, mut events, mut server) = pair(ChannelConfig::default()).await;
        for id in ["p1", "p2"] {
            let frame = Notification::NewProducer(NewProducerNotification {
                producer_id: ProducerId::from(id),
                kind: MediaKind::Video,
            })
            .into_frame()
            .unwrap();
            reply(&mut server, frame).await;
        }
        for id in ["p1", "p2"] {
            match events.recv().await {
                Some(ChannelEvent::Notification(Notification::NewProducer(inner))) => {
                    assert_eq!(inner.producer_id, ProducerId::from(id));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}

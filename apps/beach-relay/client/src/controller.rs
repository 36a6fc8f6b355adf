//! Client-side session controller.
//!
//! Drives one signaling channel through join, publish and subscribe, pairing
//! every local engine gate with the relay round trip it waits on. Notifications
//! and transport failures are surfaced through [`SessionController::next_event`].

use std::sync::Arc;

use beach_relay_core::{
    protocol::{
        ConnectConsumerTransportRequest, ConnectProducerTransportRequest, ConsumeRequest,
        CreateConsumerTransportRequest, CreateProducerTransportRequest, Empty,
        GetRouterRtpCapabilitiesRequest, JoinRequest, JoinResponse, Notification, ProduceRequest,
        ResumeRequest,
    },
    MediaKind, PeerId, ProducerId, RtpEncodingParameters, TransportDirection, TransportId,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureSource, MediaCapture, MediaStream, MediaTrack},
    channel::{ChannelConfig, ChannelEvent, ChannelEvents, SignalingChannel},
    device::{
        CodecOptions, Device, LocalConsumer, LocalProducer, LocalTransport, LocalTransportState,
        ProduceOptions,
    },
    error::{ChannelError, ControllerError, DeviceError, NegotiationError},
    state::{ControllerState, StateEvent},
};

/// Per-layer bitrate caps for simulcast video, lowest layer first.
pub const SIMULCAST_MAX_BITRATES: [u32; 3] = [100_000, 300_000, 900_000];
pub const VIDEO_GOOGLE_START_BITRATE: u32 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub channel: ChannelConfig,
    pub force_tcp: bool,
    pub simulcast: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            force_tcp: false,
            simulcast: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    TransportFailed {
        direction: TransportDirection,
        transport_id: TransportId,
    },
    Disconnected {
        reason: String,
    },
}

struct Publication {
    transport: Arc<dyn LocalTransport>,
    producer: LocalProducer,
    stream: MediaStream,
    states: watch::Receiver<LocalTransportState>,
}

impl Publication {
    fn close(self) {
        self.producer.close();
        self.transport.close();
        self.stream.stop();
    }
}

struct Subscription {
    transport: Arc<dyn LocalTransport>,
    consumer: LocalConsumer,
    stream: MediaStream,
    states: watch::Receiver<LocalTransportState>,
}

impl Subscription {
    fn close(self) {
        self.consumer.close();
        self.transport.close();
        self.stream.stop();
    }
}

enum Wake {
    Channel(Option<ChannelEvent>),
    Transport(TransportDirection, LocalTransportState),
}

pub struct SessionController {
    device: Arc<dyn Device>,
    capture: Arc<dyn MediaCapture>,
    config: ControllerConfig,
    state: ControllerState,
    channel: Option<SignalingChannel>,
    events: Option<ChannelEvents>,
    session: Option<JoinResponse>,
    device_error: Option<DeviceError>,
    publication: Option<Publication>,
    subscription: Option<Subscription>,
}

impl SessionController {
    pub fn new(
        device: Arc<dyn Device>,
        capture: Arc<dyn MediaCapture>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            device,
            capture,
            config,
            state: ControllerState::default(),
            channel: None,
            events: None,
            session: None,
            device_error: None,
            publication: None,
            subscription: None,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.session.as_ref().map(|session| &session.peer_id)
    }

    pub fn session(&self) -> Option<&JoinResponse> {
        self.session.as_ref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.publication.as_ref().map(|publication| &publication.stream)
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.subscription
            .as_ref()
            .map(|subscription| &subscription.stream)
    }

    pub fn producer(&self) -> Option<&LocalProducer> {
        self.publication
            .as_ref()
            .map(|publication| &publication.producer)
    }

    pub fn consumer(&self) -> Option<&LocalConsumer> {
        self.subscription
            .as_ref()
            .map(|subscription| &subscription.consumer)
    }

    /// Opens a channel to `url`, joins and loads the device with the router
    /// capabilities. A device that fails to load does not fail the connect;
    /// publish and subscribe report its error instead.
    pub async fn connect(&mut self, url: &str) -> Result<JoinResponse, ControllerError> {
        self.state.apply(StateEvent::ConnectStarted)?;
        let result = match SignalingChannel::connect(url, self.config.channel).await {
            Ok((channel, events)) => self.join(channel, events).await,
            Err(err) => Err(err.into()),
        };
        self.finish_connect(result)
    }

    /// Same as [`connect`](Self::connect) over an already open channel.
    pub async fn connect_channel(
        &mut self,
        channel: SignalingChannel,
        events: ChannelEvents,
    ) -> Result<JoinResponse, ControllerError> {
        self.state.apply(StateEvent::ConnectStarted)?;
        let result = self.join(channel, events).await;
        self.finish_connect(result)
    }

    async fn join(
        &mut self,
        channel: SignalingChannel,
        events: ChannelEvents,
    ) -> Result<JoinResponse, ControllerError> {
        let joined = channel.request(&JoinRequest::default()).await?;
        let capabilities = channel.request(&GetRouterRtpCapabilitiesRequest {}).await?;
        self.device_error = None;
        if !self.device.is_loaded() {
            if let Err(err) = self.device.load(capabilities).await {
                warn!(error = %err, "local media engine unavailable");
                self.device_error = Some(err);
            }
        }
        self.channel = Some(channel);
        self.events = Some(events);
        Ok(joined)
    }

    fn finish_connect(
        &mut self,
        result: Result<JoinResponse, ControllerError>,
    ) -> Result<JoinResponse, ControllerError> {
        match result {
            Ok(joined) => {
                self.state.apply(StateEvent::Joined)?;
                info!(peer_id = %joined.peer_id, room_id = %joined.room_id, "joined room");
                self.session = Some(joined.clone());
                Ok(joined)
            }
            Err(err) => {
                warn!(error = %err, "connect failed");
                self.channel = None;
                self.events = None;
                self.state.apply(StateEvent::ConnectFailed(err.clone()))?;
                Err(err)
            }
        }
    }

    /// Captures the camera (or the screen) and publishes it as the room's
    /// video producer. On failure nothing stays attached: the track and the
    /// send transport are closed and the publish phase is `Failed`.
    pub async fn publish(&mut self, use_screen: bool) -> Result<MediaStream, ControllerError> {
        self.state.apply(StateEvent::PublishStarted)?;
        match self.start_publish(CaptureSource::from_use_screen(use_screen)).await {
            Ok(publication) => {
                info!(
                    producer_id = %publication.producer.id,
                    transport_id = %publication.transport.id(),
                    "publishing"
                );
                let stream = publication.stream.clone();
                self.publication = Some(publication);
                self.state.apply(StateEvent::Published)?;
                Ok(stream)
            }
            Err(err) => {
                warn!(error = %err, "publish failed");
                self.state.apply(StateEvent::PublishFailed(err.clone()))?;
                Err(err)
            }
        }
    }

    async fn start_publish(&self, source: CaptureSource) -> Result<Publication, ControllerError> {
        let channel = self.channel()?;
        if !self.loaded_device()?.can_produce(MediaKind::Video)? {
            return Err(DeviceError::CannotProduce(MediaKind::Video).into());
        }
        let track = self.capture.capture(source).await?;

        match self.open_send_transport(channel, &track).await {
            Ok((transport, producer)) => {
                let mut stream = MediaStream::new();
                stream.add_track(track);
                Ok(Publication {
                    states: transport.subscribe_state(),
                    transport,
                    producer,
                    stream,
                })
            }
            Err(err) => {
                track.stop();
                Err(err)
            }
        }
    }

    async fn open_send_transport(
        &self,
        channel: &SignalingChannel,
        track: &MediaTrack,
    ) -> Result<(Arc<dyn LocalTransport>, LocalProducer), ControllerError> {
        let parameters = channel
            .request(&CreateProducerTransportRequest {
                force_tcp: self.config.force_tcp,
                rtp_capabilities: Some(self.device.rtp_capabilities()?),
            })
            .await?;
        let transport = self
            .device
            .create_transport(TransportDirection::Send, parameters)?;
        debug!(transport_id = %transport.id(), "send transport created");

        match self.produce_on(channel, &transport, track).await {
            Ok(producer) => Ok((transport, producer)),
            Err(err) => {
                transport.close();
                Err(err)
            }
        }
    }

    async fn produce_on(
        &self,
        channel: &SignalingChannel,
        transport: &Arc<dyn LocalTransport>,
        track: &MediaTrack,
    ) -> Result<LocalProducer, ControllerError> {
        self.finalize(channel, transport).await?;
        let gate = transport
            .produce_gate(track, self.produce_options())
            .await?;
        let request = ProduceRequest {
            transport_id: transport.id().clone(),
            kind: gate.kind,
            rtp_parameters: gate.rtp_parameters,
        };
        match channel.request(&request).await {
            Ok(response) => Ok(transport.release_produce(Ok(response.id))?),
            Err(err) => {
                let _ = transport.release_produce(Err(err.to_string()));
                Err(err.into())
            }
        }
    }

    fn produce_options(&self) -> ProduceOptions {
        let encodings = if self.config.simulcast {
            SIMULCAST_MAX_BITRATES
                .into_iter()
                .map(RtpEncodingParameters::with_max_bitrate)
                .collect()
        } else {
            Vec::new()
        };
        ProduceOptions {
            encodings,
            codec_options: CodecOptions {
                video_google_start_bitrate: Some(VIDEO_GOOGLE_START_BITRATE),
            },
        }
    }

    /// Receives the room's active producer. The subscription only counts as
    /// established once the relay has acknowledged the resume.
    pub async fn subscribe(&mut self) -> Result<MediaStream, ControllerError> {
        self.state.apply(StateEvent::SubscribeStarted)?;
        match self.start_subscribe().await {
            Ok(subscription) => {
                info!(
                    consumer_id = %subscription.consumer.id,
                    producer_id = %subscription.consumer.producer_id,
                    "subscribed"
                );
                let stream = subscription.stream.clone();
                self.subscription = Some(subscription);
                self.state.apply(StateEvent::Subscribed)?;
                Ok(stream)
            }
            Err(err) => {
                warn!(error = %err, "subscribe failed");
                self.state.apply(StateEvent::SubscribeFailed(err.clone()))?;
                Err(err)
            }
        }
    }

    async fn start_subscribe(&self) -> Result<Subscription, ControllerError> {
        let channel = self.channel()?;
        self.loaded_device()?;
        let parameters = channel
            .request(&CreateConsumerTransportRequest {
                force_tcp: self.config.force_tcp,
            })
            .await?;
        let transport = self
            .device
            .create_transport(TransportDirection::Recv, parameters)?;
        debug!(transport_id = %transport.id(), "receive transport created");

        match self.consume_on(channel, &transport).await {
            Ok(consumer) => {
                let mut stream = MediaStream::new();
                stream.add_track(consumer.track.clone());
                Ok(Subscription {
                    states: transport.subscribe_state(),
                    transport,
                    consumer,
                    stream,
                })
            }
            Err(err) => {
                transport.close();
                Err(err)
            }
        }
    }

    async fn consume_on(
        &self,
        channel: &SignalingChannel,
        transport: &Arc<dyn LocalTransport>,
    ) -> Result<LocalConsumer, ControllerError> {
        self.finalize(channel, transport).await?;
        let response = channel
            .request(&ConsumeRequest {
                transport_id: Some(transport.id().clone()),
                rtp_capabilities: self.device.rtp_capabilities()?,
            })
            .await?;
        let consumer = transport.consume(&response).await?;
        match channel
            .request(&ResumeRequest {
                consumer_id: Some(consumer.id.clone()),
            })
            .await
        {
            Ok(Empty {}) => {
                consumer.resume();
                Ok(consumer)
            }
            Err(err) => {
                consumer.close();
                Err(err.into())
            }
        }
    }

    /// Connect gate → relay finalize → release. The gate is released with the
    /// relay's outcome either way so the local transport never stays pending.
    async fn finalize(
        &self,
        channel: &SignalingChannel,
        transport: &Arc<dyn LocalTransport>,
    ) -> Result<(), ControllerError> {
        let dtls_parameters = transport.connect_gate().await?;
        let transport_id = Some(transport.id().clone());
        let outcome = match transport.direction() {
            TransportDirection::Send => {
                channel
                    .request(&ConnectProducerTransportRequest {
                        transport_id,
                        dtls_parameters,
                    })
                    .await
            }
            TransportDirection::Recv => {
                channel
                    .request(&ConnectConsumerTransportRequest {
                        transport_id,
                        dtls_parameters,
                    })
                    .await
            }
        };
        match outcome {
            Ok(Empty {}) => {
                transport.release_connect(Ok(()))?;
                debug!(transport_id = %transport.id(), "transport connected");
                Ok(())
            }
            Err(err) => {
                let _ = transport.release_connect(Err(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Waits for the next notification, transport failure or disconnect.
    /// Returns `None` once the controller is disconnected.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        loop {
            let events = self.events.as_mut()?;
            let wake = tokio::select! {
                event = events.recv() => Wake::Channel(event),
                state = terminal_state(self.publication.as_mut().map(|p| &mut p.states)) => {
                    Wake::Transport(TransportDirection::Send, state)
                }
                state = terminal_state(self.subscription.as_mut().map(|s| &mut s.states)) => {
                    Wake::Transport(TransportDirection::Recv, state)
                }
            };

            let event = match wake {
                Wake::Channel(Some(ChannelEvent::Notification(notification))) => {
                    self.handle_notification(notification)
                }
                Wake::Channel(Some(ChannelEvent::Disconnected { reason })) => {
                    Some(self.handle_disconnect(reason))
                }
                Wake::Channel(None) => Some(self.handle_disconnect("channel closed".into())),
                Wake::Transport(direction, state) => self.handle_transport_failure(direction, state),
            };
            if event.is_some() {
                return event;
            }
        }
    }

    fn handle_notification(&mut self, notification: Notification) -> Option<ControllerEvent> {
        match notification {
            Notification::Joined(joined) => {
                debug!(peer_id = %joined.peer_id, "join confirmed");
                None
            }
            Notification::NewProducer(inner) => Some(ControllerEvent::NewProducer {
                producer_id: inner.producer_id,
                kind: inner.kind,
            }),
            Notification::ProducerClosed(inner) => {
                let producer_id = inner.producer_id;
                let consuming = self
                    .subscription
                    .as_ref()
                    .is_some_and(|s| s.consumer.producer_id == producer_id);
                if consuming {
                    if let Some(subscription) = self.subscription.take() {
                        subscription.close();
                    }
                    self.apply(StateEvent::SubscriptionEnded);
                    info!(producer_id = %producer_id, "remote producer closed");
                }
                let publishing = self
                    .publication
                    .as_ref()
                    .is_some_and(|p| p.producer.id == producer_id);
                if publishing {
                    if let Some(publication) = self.publication.take() {
                        publication.close();
                    }
                    self.apply(StateEvent::PublishEnded);
                    info!(producer_id = %producer_id, "own producer replaced");
                }
                Some(ControllerEvent::ProducerClosed { producer_id })
            }
        }
    }

    fn handle_transport_failure(
        &mut self,
        direction: TransportDirection,
        state: LocalTransportState,
    ) -> Option<ControllerEvent> {
        let transport_id = match direction {
            TransportDirection::Send => {
                let publication = self.publication.take()?;
                let id = publication.transport.id().clone();
                publication.close();
                id
            }
            TransportDirection::Recv => {
                let subscription = self.subscription.take()?;
                let id = subscription.transport.id().clone();
                subscription.close();
                id
            }
        };
        warn!(transport_id = %transport_id, %direction, ?state, "transport lost");
        let err = ControllerError::Negotiation(match state {
            LocalTransportState::Closed => NegotiationError::TransportClosed(transport_id.clone()),
            _ => NegotiationError::TransportFailed(transport_id.clone()),
        });
        match direction {
            TransportDirection::Send => self.apply(StateEvent::PublishFailed(err)),
            TransportDirection::Recv => self.apply(StateEvent::SubscribeFailed(err)),
        }
        Some(ControllerEvent::TransportFailed {
            direction,
            transport_id,
        })
    }

    fn handle_disconnect(&mut self, reason: String) -> ControllerEvent {
        warn!(reason = %reason, "signaling channel lost");
        self.teardown();
        self.apply(StateEvent::Disconnected(Some(ControllerError::Channel(
            ChannelError::Closed,
        ))));
        ControllerEvent::Disconnected { reason }
    }

    /// Closes every local resource and the channel. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(channel) = self.channel.as_ref() {
            channel.close();
        }
        self.teardown();
        self.apply(StateEvent::Disconnected(None));
        info!("disconnected");
    }

    fn teardown(&mut self) {
        if let Some(publication) = self.publication.take() {
            publication.close();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.close();
        }
        self.channel = None;
        self.events = None;
        self.session = None;
    }

    fn loaded_device(&self) -> Result<&Arc<dyn Device>, ControllerError> {
        match &self.device_error {
            Some(err) => Err(err.clone().into()),
            None => Ok(&self.device),
        }
    }

    fn channel(&self) -> Result<&SignalingChannel, ControllerError> {
        self.channel
            .as_ref()
            .ok_or(ControllerError::Channel(ChannelError::Closed))
    }

    fn apply(&mut self, event: StateEvent) {
        if let Err(err) = self.state.apply(event) {
            debug!(error = %err, "ignored state transition");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Resolves once the watched transport reaches a terminal state; never
/// resolves when there is nothing to watch.
async fn terminal_state(
    states: Option<&mut watch::Receiver<LocalTransportState>>,
) -> LocalTransportState {
    let Some(states) = states else {
        return std::future::pending().await;
    };
    loop {
        let state = *states.borrow_and_update();
        if state.is_terminal() {
            return state;
        }
        if states.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

use std::{collections::HashMap, sync::Arc};

use beach_relay_core::{
    protocol::{
        ConnectConsumerTransportRequest, ConnectProducerTransportRequest, ConsumeRequest,
        ConsumeResponse, Empty, JoinRequest, JoinResponse, JoinedNotification,
        NewProducerNotification, Notification, ProduceRequest, ProduceResponse,
        ProducerClosedNotification, Request, ResumeRequest, TransportParameters,
    },
    ConsumerId, ConsumerType, DtlsParameters, MediaKind, PeerId, ProducerId, RoomId,
    RtpCapabilities, TransportDirection, TransportId,
};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    error::CoordinatorError,
    room::{ActiveProducer, Room, RoomEvent},
    transport::TransportRecord,
    Coordinator,
};
use crate::engine::{ConsumeOptions, ConsumerLayers, EngineConsumer, EngineProducer};

const SIMULCAST_PREFERRED_LAYERS: ConsumerLayers = ConsumerLayers {
    spatial_layer: 2,
    temporal_layer: Some(2),
};

/// Acknowledgement payload plus notifications that must follow it on the
/// same connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub data: Value,
    pub notifications: Vec<Notification>,
}

impl Reply {
    fn new<T: Serialize>(payload: &T) -> Result<Self, CoordinatorError> {
        let data = serde_json::to_value(payload)
            .map_err(|err| CoordinatorError::InvalidRequest(err.to_string()))?;
        Ok(Self {
            data,
            notifications: Vec::new(),
        })
    }

    fn with_notifications(mut self, notifications: Vec<Notification>) -> Self {
        self.notifications = notifications;
        self
    }
}

/// Everything one signaling connection owns. Driven by exactly one task, so
/// no field needs a lock.
pub struct PeerSession {
    coordinator: Coordinator,
    peer_id: PeerId,
    room_id: RoomId,
    events: mpsc::UnboundedSender<RoomEvent>,
    room: Option<Arc<Room>>,
    transports: HashMap<TransportId, TransportRecord>,
    latest_send: Option<TransportId>,
    latest_recv: Option<TransportId>,
    producer: Option<Arc<dyn EngineProducer>>,
    consumers: HashMap<ConsumerId, Arc<dyn EngineConsumer>>,
    latest_consumer: Option<ConsumerId>,
    closed: bool,
}

impl PeerSession {
    pub(crate) fn new(
        coordinator: Coordinator,
        peer_id: PeerId,
        room_id: RoomId,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            coordinator,
            peer_id,
            room_id,
            events,
            room: None,
            transports: HashMap::new(),
            latest_send: None,
            latest_recv: None,
            producer: None,
            consumers: HashMap::new(),
            latest_consumer: None,
            closed: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_joined(&self) -> bool {
        self.room.is_some()
    }

    pub fn producer_id(&self) -> Option<&ProducerId> {
        self.producer.as_ref().map(|producer| producer.id())
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn transport_state(&mut self, id: &TransportId) -> Option<super::TransportState> {
        self.transports.get_mut(id).map(|record| record.state())
    }

    /// Dispatches one decoded request.
    pub async fn handle(&mut self, request: Request) -> Result<Reply, CoordinatorError> {
        match request {
            Request::Join(request) => self.join(request),
            Request::GetRouterRtpCapabilities => Reply::new(&self.router_capabilities()),
            Request::CreateProducerTransport(request) => {
                if request.rtp_capabilities.is_some() {
                    debug!(peer_id = %self.peer_id, "ignoring rtpCapabilities on createProducerTransport");
                }
                let parameters = self
                    .create_transport(TransportDirection::Send, request.force_tcp)
                    .await?;
                Reply::new(&parameters)
            }
            Request::CreateConsumerTransport(request) => {
                let parameters = self
                    .create_transport(TransportDirection::Recv, request.force_tcp)
                    .await?;
                Reply::new(&parameters)
            }
            Request::ConnectProducerTransport(ConnectProducerTransportRequest {
                transport_id,
                dtls_parameters,
            }) => {
                self.finalize_transport(TransportDirection::Send, transport_id, dtls_parameters)
                    .await?;
                Reply::new(&Empty {})
            }
            Request::ConnectConsumerTransport(ConnectConsumerTransportRequest {
                transport_id,
                dtls_parameters,
            }) => {
                self.finalize_transport(TransportDirection::Recv, transport_id, dtls_parameters)
                    .await?;
                Reply::new(&Empty {})
            }
            Request::Produce(request) => Reply::new(&self.produce(request).await?),
            Request::Consume(request) => Reply::new(&self.consume(request).await?),
            Request::Resume(ResumeRequest { consumer_id }) => {
                self.resume(consumer_id).await?;
                Reply::new(&Empty {})
            }
        }
    }

    /// Registers this connection in its room. Acknowledged with the peer's
    /// identity, followed by `joined` and the room's active producer, if any.
    /// Joining again only repeats the acknowledgement.
    pub fn join(&mut self, request: JoinRequest) -> Result<Reply, CoordinatorError> {
        let response = JoinResponse {
            peer_id: self.peer_id.clone(),
            room_id: self.room_id.clone(),
        };
        if self.room.is_some() {
            debug!(peer_id = %self.peer_id, room_id = %self.room_id, "repeated join");
            return Reply::new(&response);
        }
        if self.closed {
            return Err(CoordinatorError::InvalidRequest(
                "session already closed".into(),
            ));
        }

        let (room, active) =
            self.coordinator
                .enter_room(&self.room_id, self.peer_id.clone(), self.events.clone());
        info!(
            peer_id = %self.peer_id,
            room_id = %self.room_id,
            display_name = request.display_name.as_deref().unwrap_or(""),
            members = room.member_count(),
            "peer joined"
        );
        counter!("beach_relay_joins_total", 1);
        self.room = Some(room);

        let mut notifications = vec![Notification::Joined(JoinedNotification {
            peer_id: self.peer_id.clone(),
            room_id: self.room_id.clone(),
        })];
        if let Some(active) = active {
            notifications.push(Notification::NewProducer(NewProducerNotification {
                producer_id: active.id,
                kind: active.kind,
            }));
        }
        Ok(Reply::new(&response)?.with_notifications(notifications))
    }

    pub fn router_capabilities(&self) -> RtpCapabilities {
        self.coordinator.router().rtp_capabilities()
    }

    pub async fn create_transport(
        &mut self,
        direction: TransportDirection,
        force_tcp: bool,
    ) -> Result<TransportParameters, CoordinatorError> {
        self.ensure_joined()?;
        let settings = self.coordinator.settings();
        let max_incoming_bitrate = settings.max_incoming_bitrate;
        let options = settings.options(force_tcp);

        let engine = self
            .coordinator
            .router()
            .create_webrtc_transport(options)
            .await?;
        if let Err(err) = engine.set_max_incoming_bitrate(max_incoming_bitrate).await {
            warn!(
                transport_id = %engine.id(),
                error = %err,
                "failed to cap incoming bitrate"
            );
        }

        let record = TransportRecord::new(direction, engine);
        let parameters = record.parameters();
        let id = record.id().clone();
        info!(
            peer_id = %self.peer_id,
            transport_id = %id,
            %direction,
            force_tcp,
            "transport created"
        );
        counter!(
            "beach_relay_transports_created_total",
            1,
            "direction" => direction.to_string()
        );
        self.transports.insert(id.clone(), record);
        match direction {
            TransportDirection::Send => self.latest_send = Some(id),
            TransportDirection::Recv => self.latest_recv = Some(id),
        }
        Ok(parameters)
    }

    /// Applies the client's DTLS parameters. Exactly once per transport.
    pub async fn finalize_transport(
        &mut self,
        direction: TransportDirection,
        transport_id: Option<TransportId>,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), CoordinatorError> {
        self.ensure_joined()?;
        let id = self.resolve_transport(direction, transport_id)?;
        let record = self.transport_mut(&id)?;
        if record.direction() != direction {
            return Err(CoordinatorError::WrongDirection {
                id,
                expected: direction,
                actual: record.direction(),
            });
        }
        record.begin_connect()?;
        let engine = Arc::clone(record.engine());

        let result = engine.connect(dtls_parameters).await;
        let record = self.transport_mut(&id)?;
        record.finish_connect(result.is_ok());
        result.map_err(|source| {
            warn!(transport_id = %id, error = %source, "transport negotiation failed");
            counter!("beach_relay_negotiation_failures_total", 1);
            CoordinatorError::Negotiation { id, source }
        })
    }

    pub async fn produce(
        &mut self,
        request: ProduceRequest,
    ) -> Result<ProduceResponse, CoordinatorError> {
        let room = self.ensure_joined()?;
        let record = self.transport_mut(&request.transport_id)?;
        record.ensure_usable(TransportDirection::Send)?;
        let engine = Arc::clone(record.engine());

        let producer = engine
            .produce(request.kind, request.rtp_parameters)
            .await?;
        let producer_id = producer.id().clone();
        if let Some(previous) = self.producer.replace(Arc::clone(&producer)) {
            debug!(producer_id = %previous.id(), "closing replaced producer");
            previous.close();
        }

        let replaced = room.publish(ActiveProducer {
            id: producer_id.clone(),
            kind: request.kind,
            owner: self.peer_id.clone(),
        });
        info!(
            peer_id = %self.peer_id,
            room_id = %self.room_id,
            producer_id = %producer_id,
            kind = %request.kind,
            replaced = ?replaced.map(|active| active.id),
            "producer created"
        );
        counter!(
            "beach_relay_producers_created_total",
            1,
            "kind" => request.kind.to_string()
        );
        Ok(ProduceResponse { id: producer_id })
    }

    pub async fn consume(
        &mut self,
        request: ConsumeRequest,
    ) -> Result<ConsumeResponse, CoordinatorError> {
        let room = self.ensure_joined()?;
        let id = self.resolve_transport(TransportDirection::Recv, request.transport_id)?;
        let record = self.transport_mut(&id)?;
        record.ensure_usable(TransportDirection::Recv)?;
        let engine = Arc::clone(record.engine());

        let active = room
            .active_producer()
            .ok_or(CoordinatorError::NoActiveProducer)?;
        if !self
            .coordinator
            .router()
            .can_consume(&active.id, &request.rtp_capabilities)
        {
            counter!("beach_relay_capability_rejections_total", 1);
            return Err(CoordinatorError::Capability {
                producer_id: active.id,
                kind: active.kind,
            });
        }

        let consumer = engine
            .consume(ConsumeOptions {
                producer_id: active.id.clone(),
                rtp_capabilities: request.rtp_capabilities,
                paused: active.kind == MediaKind::Video,
            })
            .await?;
        if consumer.consumer_type() == ConsumerType::Simulcast {
            if let Err(err) = consumer
                .set_preferred_layers(SIMULCAST_PREFERRED_LAYERS)
                .await
            {
                warn!(consumer_id = %consumer.id(), error = %err, "failed to set preferred layers");
            }
        }

        let response = ConsumeResponse {
            producer_id: consumer.producer_id().clone(),
            id: consumer.id().clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.paused() || consumer.producer_paused(),
            paused: consumer.paused(),
        };
        info!(
            peer_id = %self.peer_id,
            consumer_id = %response.id,
            producer_id = %response.producer_id,
            paused = response.paused,
            "consumer created"
        );
        counter!(
            "beach_relay_consumers_created_total",
            1,
            "kind" => response.kind.to_string()
        );
        self.latest_consumer = Some(response.id.clone());
        self.consumers.insert(response.id.clone(), consumer);
        Ok(response)
    }

    /// Resumes a consumer. Resuming one that is already flowing is a no-op.
    pub async fn resume(&mut self, consumer_id: Option<ConsumerId>) -> Result<(), CoordinatorError> {
        self.ensure_joined()?;
        let consumer_id = consumer_id
            .or_else(|| self.latest_consumer.clone())
            .ok_or(CoordinatorError::NoConsumer)?;
        let consumer = self
            .consumers
            .get(&consumer_id)
            .map(Arc::clone)
            .ok_or_else(|| CoordinatorError::ConsumerNotFound(consumer_id.clone()))?;
        if !consumer.paused() {
            debug!(consumer_id = %consumer_id, "resume on unpaused consumer");
            return Ok(());
        }
        consumer.resume().await?;
        info!(peer_id = %self.peer_id, consumer_id = %consumer_id, "consumer resumed");
        Ok(())
    }

    /// Applies an event raised by another member and returns the notification
    /// to forward to this peer.
    pub fn handle_room_event(&mut self, event: RoomEvent) -> Option<Notification> {
        match event {
            RoomEvent::NewProducer { producer_id, kind } => {
                Some(Notification::NewProducer(NewProducerNotification {
                    producer_id,
                    kind,
                }))
            }
            RoomEvent::ProducerClosed { producer_id } => {
                self.consumers.retain(|_, consumer| {
                    if consumer.producer_id() == &producer_id {
                        consumer.close();
                        false
                    } else {
                        true
                    }
                });
                if self.producer_id() == Some(&producer_id) {
                    if let Some(producer) = self.producer.take() {
                        info!(peer_id = %self.peer_id, producer_id = %producer_id, "producer replaced by another member");
                        producer.close();
                    }
                }
                Some(Notification::ProducerClosed(ProducerClosedNotification {
                    producer_id,
                }))
            }
        }
    }

    /// Releases every resource the connection owns and leaves the room.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for consumer in self.consumers.values() {
            consumer.close();
        }
        self.consumers.clear();
        if let Some(producer) = self.producer.take() {
            producer.close();
            if let Some(room) = &self.room {
                room.unpublish(producer.id());
            }
        }
        let transports = self.transports.len();
        for record in self.transports.values_mut() {
            record.close();
        }
        self.transports.clear();

        if let Some(room) = self.room.take() {
            let remaining = room.remove_member(&self.peer_id);
            gauge!(
                "beach_relay_room_members",
                remaining as f64,
                "room_id" => self.room_id.to_string()
            );
            self.coordinator.release_room(&room);
        }
        info!(
            peer_id = %self.peer_id,
            room_id = %self.room_id,
            transports,
            "peer session closed"
        );
    }

    fn ensure_joined(&self) -> Result<Arc<Room>, CoordinatorError> {
        self.room.clone().ok_or(CoordinatorError::NotJoined)
    }

    fn resolve_transport(
        &self,
        direction: TransportDirection,
        transport_id: Option<TransportId>,
    ) -> Result<TransportId, CoordinatorError> {
        let latest = match direction {
            TransportDirection::Send => &self.latest_send,
            TransportDirection::Recv => &self.latest_recv,
        };
        transport_id
            .or_else(|| latest.clone())
            .ok_or(CoordinatorError::NoTransport(direction))
    }

    fn transport_mut(&mut self, id: &TransportId) -> Result<&mut TransportRecord, CoordinatorError> {
        self.transports
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::TransportNotFound(id.to_string()))
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

use std::{collections::BTreeMap, sync::Arc};

use beach_relay_core::{
    protocol::{
        ConnectProducerTransportRequest, ConsumeRequest, CreateConsumerTransportRequest,
        CreateProducerTransportRequest, JoinRequest, Notification, ProduceRequest, Request,
    },
    DtlsFingerprint, DtlsParameters, DtlsRole, ErrorCode, MediaKind, RoomId, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    TransportDirection, TransportId,
};

use super::{transport::TransportRecord, *};
use crate::engine::{
    local::{LocalEngine, LocalEngineConfig, LocalRouter},
    ConsumerLayers, MediaRouter,
};

struct Fixture {
    router: Arc<LocalRouter>,
    coordinator: Coordinator,
}

impl Fixture {
    fn new() -> Self {
        Self::with_engine(LocalEngineConfig::default())
    }

    fn with_engine(config: LocalEngineConfig) -> Self {
        let engine = LocalEngine::new(config);
        let router = engine.create_local_router(vec![
            RtpCodecCapability::audio("audio/opus", 48000, 2),
            RtpCodecCapability::video("video/VP8", 90000)
                .with_parameter("x-google-start-bitrate", 1000),
        ]);
        let dyn_router: Arc<dyn MediaRouter> = router.clone();
        let coordinator = Coordinator::new(dyn_router, TransportSettings::default());
        Self {
            router,
            coordinator,
        }
    }

    async fn joined_peer(&self, room: &str) -> (PeerSession, PeerEvents) {
        let (mut peer, mut events) = self.coordinator.connect(RoomId::from(room));
        peer.join(JoinRequest::default()).unwrap();
        while events.try_recv().is_ok() {}
        (peer, events)
    }
}

fn dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".into(),
            value: "AB:CD:EF".into(),
        }],
    }
}

fn rtp_parameters(kind: MediaKind, encodings: usize) -> RtpParameters {
    let codec = match kind {
        MediaKind::Audio => RtpCodecParameters {
            mime_type: "audio/opus".into(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        },
        MediaKind::Video => RtpCodecParameters {
            mime_type: "video/VP8".into(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        },
    };
    RtpParameters {
        mid: Some("0".into()),
        codecs: vec![codec],
        header_extensions: Vec::new(),
        encodings: [100_000, 300_000, 900_000]
            .into_iter()
            .take(encodings)
            .map(RtpEncodingParameters::with_max_bitrate)
            .collect(),
        rtcp: Default::default(),
    }
}

async fn connected_transport(peer: &mut PeerSession, direction: TransportDirection) -> TransportId {
    let parameters = peer.create_transport(direction, false).await.unwrap();
    peer.finalize_transport(direction, Some(parameters.id.clone()), dtls())
        .await
        .unwrap();
    parameters.id
}

async fn publish(peer: &mut PeerSession, kind: MediaKind, encodings: usize) {
    let transport_id = connected_transport(peer, TransportDirection::Send).await;
    peer.produce(ProduceRequest {
        transport_id,
        kind,
        rtp_parameters: rtp_parameters(kind, encodings),
    })
    .await
    .unwrap();
}

#[test_timeout::tokio_timeout_test]
async fn join_acknowledges_then_notifies() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.coordinator.connect(RoomId::from("lobby"));
    let reply = peer.join(JoinRequest::default()).unwrap();
    assert_eq!(reply.data["roomId"], "lobby");
    assert_eq!(reply.data["peerId"], peer.peer_id().as_str());
    assert!(matches!(reply.notifications.as_slice(), [Notification::Joined(_)]));

    let again = peer.join(JoinRequest::default()).unwrap();
    assert_eq!(again.data, reply.data);
    assert!(again.notifications.is_empty());
    assert_eq!(fixture.coordinator.room(&RoomId::from("lobby")).unwrap().member_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn late_joiner_hears_about_the_active_producer() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    publish(&mut publisher, MediaKind::Video, 1).await;

    let (mut late, _late_events) = fixture.coordinator.connect(RoomId::from("lobby"));
    let reply = late.join(JoinRequest::default()).unwrap();
    match reply.notifications.as_slice() {
        [Notification::Joined(_), Notification::NewProducer(new_producer)] => {
            assert_eq!(Some(&new_producer.producer_id), publisher.producer_id());
            assert_eq!(new_producer.kind, MediaKind::Video);
        }
        other => panic!("unexpected notifications {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn requests_before_join_are_rejected() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.coordinator.connect(RoomId::default());
    let err = peer
        .handle(Request::CreateProducerTransport(
            CreateProducerTransportRequest::default(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotJoined);

    // Capabilities are static and need no membership.
    let reply = peer.handle(Request::GetRouterRtpCapabilities).await.unwrap();
    assert_eq!(reply.data["codecs"].as_array().map(Vec::len), Some(2));
}

#[test_timeout::tokio_timeout_test]
async fn force_tcp_disables_udp_candidates() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.joined_peer("lobby").await;
    let parameters = peer
        .create_transport(TransportDirection::Recv, true)
        .await
        .unwrap();
    assert!(!parameters.ice_candidates.is_empty());
    assert!(parameters
        .ice_candidates
        .iter()
        .all(|candidate| candidate.protocol == beach_relay_core::TransportProtocol::Tcp));
    let transport = fixture.router.transport(&parameters.id).unwrap();
    assert_eq!(transport.max_incoming_bitrate(), 1_500_000);
}

#[test_timeout::tokio_timeout_test]
async fn produce_on_unconnected_transport_fails() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.joined_peer("lobby").await;
    let parameters = peer
        .create_transport(TransportDirection::Send, false)
        .await
        .unwrap();
    let err = peer
        .produce(ProduceRequest {
            transport_id: parameters.id.clone(),
            kind: MediaKind::Video,
            rtp_parameters: rtp_parameters(MediaKind::Video, 1),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportNotConnected);
    assert!(peer.producer_id().is_none());
}

#[test_timeout::tokio_timeout_test]
async fn connecting_transport_is_not_usable() {
    let fixture = Fixture::new();
    let engine = fixture
        .router
        .create_webrtc_transport(TransportSettings::default().options(false))
        .await
        .unwrap();
    let mut record = TransportRecord::new(TransportDirection::Recv, engine);
    record.begin_connect().unwrap();
    assert_eq!(record.state(), TransportState::Connecting);

    let err = record.ensure_usable(TransportDirection::Recv).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportNotConnected);
    let err = record.begin_connect().unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateFinalize);
}

#[test_timeout::tokio_timeout_test]
async fn consume_on_unconnected_transport_fails() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    publish(&mut publisher, MediaKind::Video, 1).await;

    let (mut viewer, _viewer_events) = fixture.joined_peer("lobby").await;
    viewer
        .create_transport(TransportDirection::Recv, false)
        .await
        .unwrap();
    let err = viewer
        .consume(ConsumeRequest {
            transport_id: None,
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportNotConnected);
    assert_eq!(viewer.consumer_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn second_finalize_is_rejected() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.joined_peer("lobby").await;
    let transport_id = connected_transport(&mut peer, TransportDirection::Send).await;

    let err = peer
        .handle(Request::ConnectProducerTransport(
            ConnectProducerTransportRequest {
                transport_id: Some(transport_id.clone()),
                dtls_parameters: dtls(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateFinalize);
    assert_eq!(peer.transport_state(&transport_id), Some(TransportState::Connected));
}

#[test_timeout::tokio_timeout_test]
async fn rejected_handshake_fails_the_transport() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.joined_peer("lobby").await;
    let parameters = peer
        .create_transport(TransportDirection::Send, false)
        .await
        .unwrap();
    let err = peer
        .finalize_transport(
            TransportDirection::Send,
            None,
            DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Negotiation);
    assert_eq!(peer.transport_state(&parameters.id), Some(TransportState::Failed));

    let err = peer
        .finalize_transport(TransportDirection::Send, None, dtls())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportInactive);
}

#[test_timeout::tokio_timeout_test]
async fn engine_driven_failure_makes_transport_inactive() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.joined_peer("lobby").await;
    let transport_id = connected_transport(&mut peer, TransportDirection::Send).await;
    assert!(fixture.router.fail_transport(&transport_id));

    let err = peer
        .produce(ProduceRequest {
            transport_id: transport_id.clone(),
            kind: MediaKind::Audio,
            rtp_parameters: rtp_parameters(MediaKind::Audio, 1),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportInactive);
    assert_eq!(peer.transport_state(&transport_id), Some(TransportState::Failed));
}

#[test_timeout::tokio_timeout_test]
async fn new_producer_reaches_every_other_member_once() {
    let fixture = Fixture::new();
    let (mut publisher, mut publisher_events) = fixture.joined_peer("lobby").await;
    let (_b, mut b_events) = fixture.joined_peer("lobby").await;
    let (_c, mut c_events) = fixture.joined_peer("lobby").await;
    let (_elsewhere, mut other_room_events) = fixture.joined_peer("other").await;

    publish(&mut publisher, MediaKind::Video, 1).await;
    let producer_id = publisher.producer_id().cloned().unwrap();

    for events in [&mut b_events, &mut c_events] {
        assert_eq!(
            events.try_recv().unwrap(),
            RoomEvent::NewProducer {
                producer_id: producer_id.clone(),
                kind: MediaKind::Video
            }
        );
        assert!(events.try_recv().is_err());
    }
    assert!(publisher_events.try_recv().is_err());
    assert!(other_room_events.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn video_consumer_starts_paused_and_audio_does_not() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    let (mut viewer, _viewer_events) = fixture.joined_peer("lobby").await;
    connected_transport(&mut viewer, TransportDirection::Recv).await;

    publish(&mut publisher, MediaKind::Video, 1).await;
    let video = viewer
        .consume(ConsumeRequest {
            transport_id: None,
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(video.kind, MediaKind::Video);
    assert!(video.paused);
    assert!(video.producer_paused);

    publish(&mut publisher, MediaKind::Audio, 1).await;
    let audio = viewer
        .consume(ConsumeRequest {
            transport_id: None,
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(audio.kind, MediaKind::Audio);
    assert!(!audio.paused);
    assert!(!audio.producer_paused);
}

#[test_timeout::tokio_timeout_test]
async fn resume_unpauses_once_and_then_is_a_no_op() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    let (mut viewer, _viewer_events) = fixture.joined_peer("lobby").await;
    let recv_id = connected_transport(&mut viewer, TransportDirection::Recv).await;
    publish(&mut publisher, MediaKind::Video, 1).await;

    let consumed = viewer
        .consume(ConsumeRequest {
            transport_id: Some(recv_id),
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap();
    viewer.resume(Some(consumed.id.clone())).await.unwrap();
    viewer.resume(None).await.unwrap();
    assert_eq!(viewer.consumer_count(), 1);

    let err = viewer
        .resume(Some(beach_relay_core::ConsumerId::from("missing")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test_timeout::tokio_timeout_test]
async fn incompatible_capabilities_create_no_consumer() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    let (mut viewer, _viewer_events) = fixture.joined_peer("lobby").await;
    connected_transport(&mut viewer, TransportDirection::Recv).await;
    publish(&mut publisher, MediaKind::Video, 1).await;

    let err = viewer
        .consume(ConsumeRequest {
            transport_id: None,
            rtp_capabilities: RtpCapabilities {
                codecs: vec![RtpCodecCapability::video("video/H264", 90000)],
                header_extensions: Vec::new(),
            },
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Capability);
    assert_eq!(viewer.consumer_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn consume_without_producer_is_not_found() {
    let fixture = Fixture::new();
    let (mut viewer, _events) = fixture.joined_peer("lobby").await;
    connected_transport(&mut viewer, TransportDirection::Recv).await;
    let err = viewer
        .consume(ConsumeRequest {
            transport_id: None,
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test_timeout::tokio_timeout_test]
async fn simulcast_consumer_prefers_top_layers() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    let (mut viewer, _viewer_events) = fixture.joined_peer("lobby").await;
    let recv_id = connected_transport(&mut viewer, TransportDirection::Recv).await;
    publish(&mut publisher, MediaKind::Video, 3).await;

    let consumed = viewer
        .consume(ConsumeRequest {
            transport_id: Some(recv_id.clone()),
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(consumed.consumer_type, beach_relay_core::ConsumerType::Simulcast);

    let consumer = fixture
        .router
        .transport(&recv_id)
        .and_then(|transport| transport.consumer(&consumed.id))
        .unwrap();
    assert_eq!(
        consumer.preferred_layers(),
        Some(ConsumerLayers {
            spatial_layer: 2,
            temporal_layer: Some(2),
        })
    );
}

#[test_timeout::tokio_timeout_test]
async fn single_encoding_consumer_keeps_default_layers() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    let (mut viewer, _viewer_events) = fixture.joined_peer("lobby").await;
    let recv_id = connected_transport(&mut viewer, TransportDirection::Recv).await;
    publish(&mut publisher, MediaKind::Video, 1).await;

    let consumed = viewer
        .consume(ConsumeRequest {
            transport_id: Some(recv_id.clone()),
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap();
    let consumer = fixture
        .router
        .transport(&recv_id)
        .and_then(|transport| transport.consumer(&consumed.id))
        .unwrap();
    assert_eq!(consumer.preferred_layers(), None);
}

#[test_timeout::tokio_timeout_test]
async fn failed_transports_give_their_port_back() {
    let fixture = Fixture::with_engine(LocalEngineConfig {
        rtc_min_port: 40000,
        rtc_max_port: 40000,
    });
    let (mut peer, _events) = fixture.joined_peer("lobby").await;

    let rejected = peer
        .create_transport(TransportDirection::Send, false)
        .await
        .unwrap();
    let err = peer
        .finalize_transport(
            TransportDirection::Send,
            None,
            DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Negotiation);
    assert_eq!(peer.transport_state(&rejected.id), Some(TransportState::Failed));
    assert_eq!(fixture.router.open_transports(), 0);

    // The retry gets the only port back.
    let retry = connected_transport(&mut peer, TransportDirection::Send).await;
    assert!(fixture.router.fail_transport(&retry));
    assert_eq!(peer.transport_state(&retry), Some(TransportState::Failed));
    assert_eq!(fixture.router.open_transports(), 0);

    // An engine-side failure frees it again.
    let recv = peer
        .create_transport(TransportDirection::Recv, false)
        .await
        .unwrap();
    assert!(fixture.router.transport(&recv.id).is_some());
}

#[test_timeout::tokio_timeout_test]
async fn replacing_the_active_producer_closes_the_previous_one() {
    let fixture = Fixture::new();
    let (mut first, mut first_events) = fixture.joined_peer("lobby").await;
    let (mut second, _second_events) = fixture.joined_peer("lobby").await;

    publish(&mut first, MediaKind::Video, 1).await;
    let first_producer = first.producer_id().cloned().unwrap();
    publish(&mut second, MediaKind::Video, 1).await;
    assert_eq!(fixture.router.live_producers(), 2);

    let event = first_events.try_recv().unwrap();
    let notification = first.handle_room_event(event);
    assert!(matches!(
        notification,
        Some(Notification::ProducerClosed(ref closed)) if closed.producer_id == first_producer
    ));
    assert!(first.producer_id().is_none());
    assert_eq!(fixture.router.live_producers(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_releases_resources_and_notifies_the_room() {
    let fixture = Fixture::new();
    let (mut publisher, _events) = fixture.joined_peer("lobby").await;
    let (mut viewer, mut viewer_events) = fixture.joined_peer("lobby").await;
    connected_transport(&mut viewer, TransportDirection::Recv).await;
    publish(&mut publisher, MediaKind::Video, 1).await;
    let producer_id = publisher.producer_id().cloned().unwrap();
    viewer
        .consume(ConsumeRequest {
            transport_id: None,
            rtp_capabilities: fixture.router.rtp_capabilities(),
        })
        .await
        .unwrap();
    let _ = viewer_events.try_recv();

    drop(publisher);
    assert_eq!(fixture.router.live_producers(), 0);
    let room = fixture.coordinator.room(&RoomId::from("lobby")).unwrap();
    assert!(room.active_producer().is_none());
    assert_eq!(room.member_count(), 1);

    let event = viewer_events.try_recv().unwrap();
    assert_eq!(event, RoomEvent::ProducerClosed { producer_id });
    viewer.handle_room_event(event);
    assert_eq!(viewer.consumer_count(), 0);

    viewer.close();
    assert_eq!(fixture.router.open_transports(), 0);
    assert_eq!(fixture.coordinator.room_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn create_consumer_transport_via_dispatch_returns_parameters() {
    let fixture = Fixture::new();
    let (mut peer, _events) = fixture.joined_peer("lobby").await;
    let reply = peer
        .handle(Request::CreateConsumerTransport(
            CreateConsumerTransportRequest::default(),
        ))
        .await
        .unwrap();
    for field in ["id", "iceParameters", "iceCandidates", "dtlsParameters"] {
        assert!(reply.data.get(field).is_some(), "missing {field}");
    }
}

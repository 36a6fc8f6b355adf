//! In-process media engine. It allocates ports, mints ICE/DTLS credentials and
//! tracks producer/consumer lifecycles exactly as the coordinator expects from a
//! real worker, without forwarding any packets itself.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use beach_relay_core::{
    ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceCandidateType, IceParameters, MediaKind, ProducerId, RtcpFeedback, RtcpParameters,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtension, RtpParameters, TransportId, TransportProtocol,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    ConsumeOptions, ConsumerLayers, EngineConsumer, EngineError, EngineProducer, EngineTransport,
    EngineTransportState, MediaEngine, MediaRouter, WebRtcTransportOptions, WorkerHealth,
};

const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;
/// Codecs a router can carry before the payload type space runs out.
pub const MAX_ROUTER_CODECS: usize = (u8::MAX - FIRST_DYNAMIC_PAYLOAD_TYPE) as usize + 1;
const SUPPORTED_FINGERPRINT_ALGORITHMS: &[&str] =
    &["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];
const MID_EXTENSION_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";

#[derive(Debug, Clone, Copy)]
pub struct LocalEngineConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

pub struct LocalEngine {
    ports: Arc<PortPool>,
    alive: Arc<AtomicBool>,
    health: watch::Sender<WorkerHealth>,
}

impl LocalEngine {
    pub fn new(config: LocalEngineConfig) -> Self {
        let (health, _) = watch::channel(WorkerHealth::Running);
        Self {
            ports: Arc::new(PortPool::new(config.rtc_min_port, config.rtc_max_port)),
            alive: Arc::new(AtomicBool::new(true)),
            health,
        }
    }

    /// Same as [`MediaEngine::create_router`] but keeps the concrete type, which
    /// exposes failure injection.
    pub fn create_local_router(&self, codecs: Vec<RtpCodecCapability>) -> Arc<LocalRouter> {
        Arc::new(LocalRouter {
            shared: Arc::new(RouterShared {
                capabilities: build_capabilities(codecs),
                producers: DashMap::new(),
                transports: DashMap::new(),
                ports: Arc::clone(&self.ports),
                alive: Arc::clone(&self.alive),
            }),
        })
    }

    /// Marks the worker dead; every later operation fails with
    /// [`EngineError::WorkerDied`].
    pub fn kill(&self, reason: impl Into<String>) {
        self.alive.store(false, Ordering::SeqCst);
        let reason = reason.into();
        warn!(reason = %reason, "local media worker died");
        self.health.send_replace(WorkerHealth::Died { reason });
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn MediaRouter>, EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerDied);
        }
        let router: Arc<dyn MediaRouter> = self.create_local_router(codecs);
        Ok(router)
    }

    fn worker_health(&self) -> watch::Receiver<WorkerHealth> {
        self.health.subscribe()
    }
}

struct PortPool {
    min: u16,
    max: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate(&self) -> Result<u16, EngineError> {
        let mut in_use = self.in_use.lock();
        let port = (self.min..=self.max)
            .find(|port| !in_use.contains(port))
            .ok_or(EngineError::PortsExhausted {
                min: self.min,
                max: self.max,
            })?;
        in_use.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }
}

struct RouterShared {
    capabilities: RtpCapabilities,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    /// Open transports only; a transport unregisters itself on close.
    transports: DashMap<TransportId, Weak<LocalTransport>>,
    ports: Arc<PortPool>,
    alive: Arc<AtomicBool>,
}

impl RouterShared {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::WorkerDied)
        }
    }
}

pub struct LocalRouter {
    shared: Arc<RouterShared>,
}

impl LocalRouter {
    pub fn transport(&self, id: &TransportId) -> Option<Arc<LocalTransport>> {
        self.shared
            .transports
            .get(id)
            .and_then(|entry| entry.value().upgrade())
    }

    /// Drives a connecting or connected transport into `failed`, as an ICE or
    /// DTLS timeout would.
    pub fn fail_transport(&self, id: &TransportId) -> bool {
        match self.transport(id) {
            Some(transport) => transport.fail(),
            None => false,
        }
    }

    pub fn live_producers(&self) -> usize {
        self.shared.producers.len()
    }

    pub fn open_transports(&self) -> usize {
        self.shared.transports.len()
    }
}

#[async_trait]
impl MediaRouter for LocalRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        self.shared.ensure_alive()?;
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Unsupported(
                "transport needs UDP or TCP enabled".into(),
            ));
        }
        if options.listen_ips.is_empty() {
            return Err(EngineError::Unsupported("no listen addresses".into()));
        }

        let port = self.shared.ports.allocate()?;
        let transport = Arc::new(LocalTransport {
            id: TransportId::generate(),
            port,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: host_candidates(&options, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![random_fingerprint()],
            },
            outgoing_bitrate: AtomicU32::new(options.initial_available_outgoing_bitrate),
            max_incoming_bitrate: AtomicU32::new(0),
            state: Mutex::new(EngineTransportState::New),
            remote_dtls: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            shared: Arc::clone(&self.shared),
        });
        debug!(transport_id = %transport.id, port, "local transport created");
        self.shared
            .transports
            .insert(transport.id.clone(), Arc::downgrade(&transport));

        let transport: Arc<dyn EngineTransport> = transport;
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.shared.producers.get(producer_id) else {
            return false;
        };
        producer
            .rtp_parameters
            .codecs
            .iter()
            .any(|codec| capabilities.find_codec(codec).is_some())
    }
}

pub struct LocalTransport {
    id: TransportId,
    port: u16,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    outgoing_bitrate: AtomicU32,
    max_incoming_bitrate: AtomicU32,
    state: Mutex<EngineTransportState>,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    shared: Arc<RouterShared>,
}

impl LocalTransport {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_incoming_bitrate(&self) -> u32 {
        self.max_incoming_bitrate.load(Ordering::Relaxed)
    }

    pub fn available_outgoing_bitrate(&self) -> u32 {
        self.outgoing_bitrate.load(Ordering::Relaxed)
    }

    pub fn remote_dtls_parameters(&self) -> Option<DtlsParameters> {
        self.remote_dtls.lock().clone()
    }

    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<LocalConsumer>> {
        self.consumers
            .lock()
            .iter()
            .find(|consumer| &consumer.id == id)
            .cloned()
    }

    fn fail(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            EngineTransportState::Connecting | EngineTransportState::Connected => {
                *state = EngineTransportState::Failed;
                warn!(transport_id = %self.id, "local transport failed");
                true
            }
            _ => false,
        }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        self.shared.ensure_alive()?;
        match *self.state.lock() {
            EngineTransportState::Failed | EngineTransportState::Closed => {
                Err(EngineError::TransportClosed(self.id.clone()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn state(&self) -> EngineTransportState {
        *self.state.lock()
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.max_incoming_bitrate.store(bitrate, Ordering::Relaxed);
        Ok(())
    }

    async fn connect(&self, remote: DtlsParameters) -> Result<(), EngineError> {
        self.shared.ensure_alive()?;
        {
            let mut state = self.state.lock();
            match *state {
                EngineTransportState::New => *state = EngineTransportState::Connecting,
                EngineTransportState::Connecting | EngineTransportState::Connected => {
                    return Err(EngineError::AlreadyConnected(self.id.clone()));
                }
                EngineTransportState::Failed | EngineTransportState::Closed => {
                    return Err(EngineError::TransportClosed(self.id.clone()));
                }
            }
        }

        if let Err(reason) = validate_remote_dtls(&remote) {
            *self.state.lock() = EngineTransportState::Failed;
            return Err(EngineError::Dtls(reason));
        }

        *self.remote_dtls.lock() = Some(remote);
        let mut state = self.state.lock();
        // A concurrent close wins over the handshake.
        if *state == EngineTransportState::Connecting {
            *state = EngineTransportState::Connected;
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Unsupported("rtpParameters has no codecs".into()));
        }
        for codec in &rtp_parameters.codecs {
            if codec.kind().is_some_and(|codec_kind| codec_kind != kind) {
                return Err(EngineError::Unsupported(format!(
                    "codec {} does not match kind {kind}",
                    codec.mime_type
                )));
            }
            if self.shared.capabilities.find_codec(codec).is_none() {
                return Err(EngineError::Unsupported(format!(
                    "codec {} not enabled on router",
                    codec.mime_type
                )));
            }
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            shared: Arc::downgrade(&self.shared),
        });
        self.shared
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        debug!(transport_id = %self.id, producer_id = %producer.id, %kind, "local producer created");

        let producer: Arc<dyn EngineProducer> = producer;
        Ok(producer)
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;
        let producer = self
            .shared
            .producers
            .get(&options.producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::UnknownProducer(options.producer_id.clone()))?;

        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                options
                    .rtp_capabilities
                    .find_codec(codec)
                    .map(|capability| RtpCodecParameters {
                        payload_type: capability
                            .preferred_payload_type
                            .unwrap_or(codec.payload_type),
                        rtcp_feedback: capability.rtcp_feedback.clone(),
                        ..codec.clone()
                    })
            })
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Unsupported(
                "no codec in common with the producer".into(),
            ));
        }

        let consumer_type = if producer.rtp_parameters.is_simulcast() {
            ConsumerType::Simulcast
        } else {
            ConsumerType::Simple
        };
        let scalability_mode = match consumer_type {
            ConsumerType::Simulcast => {
                Some(format!("L{}T3", producer.rtp_parameters.encodings.len()))
            }
            _ => None,
        };
        let mid = self.consumers.lock().len().to_string();
        let rtp_parameters = RtpParameters {
            mid: Some(mid),
            codecs,
            header_extensions: options.rtp_capabilities.header_extensions.clone(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::thread_rng().next_u32()),
                scalability_mode,
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters {
                cname: Some(format!("beach-relay-{}", producer.id)),
                reduced_size: true,
            },
        };

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::generate(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters,
            consumer_type,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            preferred_layers: Mutex::new(None),
            producer: Arc::downgrade(&producer),
        });
        producer.consumers.lock().push(Arc::downgrade(&consumer));
        self.consumers.lock().push(Arc::clone(&consumer));
        debug!(
            transport_id = %self.id,
            consumer_id = %consumer.id,
            producer_id = %consumer.producer_id,
            paused = options.paused,
            "local consumer created"
        );

        let consumer: Arc<dyn EngineConsumer> = consumer;
        Ok(consumer)
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == EngineTransportState::Closed {
                return;
            }
            *state = EngineTransportState::Closed;
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close();
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close();
        }
        self.shared.transports.remove(&self.id);
        self.shared.ports.release(self.port);
        debug!(transport_id = %self.id, port = self.port, "local transport closed");
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    shared: Weak<RouterShared>,
}

impl EngineProducer for LocalProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.producers.remove(&self.id);
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close();
        }
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    paused: AtomicBool,
    closed: AtomicBool,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    producer: Weak<LocalProducer>,
}

impl LocalConsumer {
    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.preferred_layers.lock()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::ConsumerClosed(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer
            .upgrade()
            .map(|producer| producer.paused())
            .unwrap_or(true)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.consumer_type == ConsumerType::Simple {
            return Err(EngineError::Unsupported(
                "preferred layers need a simulcast or svc consumer".into(),
            ));
        }
        *self.preferred_layers.lock() = Some(layers);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn build_capabilities(codecs: Vec<RtpCodecCapability>) -> RtpCapabilities {
    let codecs = codecs
        .into_iter()
        .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..=u8::MAX)
        .map(|(mut codec, payload_type)| {
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(payload_type);
            }
            if codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = default_feedback(codec.kind);
            }
            codec
        })
        .collect();

    RtpCapabilities {
        codecs,
        header_extensions: vec![
            RtpHeaderExtension {
                kind: None,
                uri: MID_EXTENSION_URI.into(),
                id: 1,
            },
            RtpHeaderExtension {
                kind: None,
                uri: ABS_SEND_TIME_URI.into(),
                id: 4,
            },
        ],
    }
}

fn default_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn host_candidates(options: &WebRtcTransportOptions, port: u16) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    for listen_ip in &options.listen_ips {
        let ip = listen_ip.advertised();
        if options.enable_udp {
            candidates.push(IceCandidate {
                foundation: "udpcandidate".into(),
                priority: if options.prefer_udp { 1_076_302_079 } else { 1_076_302_078 },
                ip: ip.clone(),
                protocol: TransportProtocol::Udp,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".into(),
                priority: 1_076_276_479,
                ip,
                protocol: TransportProtocol::Tcp,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: Some("passive".into()),
            });
        }
    }
    candidates
}

fn validate_remote_dtls(remote: &DtlsParameters) -> Result<(), String> {
    if remote.fingerprints.is_empty() {
        return Err("remote DTLS parameters carry no fingerprint".into());
    }
    for fingerprint in &remote.fingerprints {
        let algorithm = fingerprint.algorithm.to_ascii_lowercase();
        if !SUPPORTED_FINGERPRINT_ALGORITHMS.contains(&algorithm.as_str()) {
            return Err(format!(
                "unsupported fingerprint algorithm {}",
                fingerprint.algorithm
            ));
        }
        if fingerprint.value.trim().is_empty() {
            return Err("empty fingerprint value".into());
        }
    }
    Ok(())
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> DtlsFingerprint {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let digest = Sha256::digest(seed);
    let value = digest
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".into(),
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ListenIp;

    fn codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::audio("audio/opus", 48000, 2),
            RtpCodecCapability::video("video/VP8", 90000),
        ]
    }

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: "127.0.0.1".parse().unwrap(),
                announced_ip: Some("203.0.113.7".into()),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![random_fingerprint()],
        }
    }

    fn vp8_parameters(encodings: usize) -> RtpParameters {
        RtpParameters {
            mid: Some("0".into()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Default::default(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: (0..encodings)
                .map(|index| RtpEncodingParameters {
                    rid: Some(format!("r{index}")),
                    ..RtpEncodingParameters::default()
                })
                .collect(),
            rtcp: RtcpParameters::default(),
        }
    }

    #[test_timeout::timeout]
    fn router_assigns_dynamic_payload_types() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let caps = router.rtp_capabilities();
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert!(!caps.codecs[1].rtcp_feedback.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn transport_advertises_announced_ip_candidates() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let transport = router.create_webrtc_transport(options()).await.unwrap();
        let candidates = transport.ice_candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.ip == "203.0.113.7"));
        assert_eq!(transport.dtls_parameters().fingerprints[0].value.len(), 95);
        assert_eq!(transport.state(), EngineTransportState::New);
    }

    #[test_timeout::tokio_timeout_test]
    async fn port_pool_exhaustion_is_reported_and_recovers() {
        let engine = LocalEngine::new(LocalEngineConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
        });
        let router = engine.create_local_router(codecs());
        let first = router.create_webrtc_transport(options()).await.unwrap();
        let _second = router.create_webrtc_transport(options()).await.unwrap();
        let err = match router.create_webrtc_transport(options()).await {
            Err(err) => err,
            Ok(_) => panic!("expected port exhaustion"),
        };
        assert!(matches!(err, EngineError::PortsExhausted { min: 40000, max: 40001 }));

        first.close();
        assert!(router.create_webrtc_transport(options()).await.is_ok());
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_is_not_idempotent() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let transport = router.create_webrtc_transport(options()).await.unwrap();
        let remote = client_dtls();
        transport.connect(remote.clone()).await.unwrap();
        assert_eq!(transport.state(), EngineTransportState::Connected);
        let err = transport.connect(client_dtls()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyConnected(_)));

        let local = router.transport(transport.id()).unwrap();
        assert_eq!(local.remote_dtls_parameters(), Some(remote));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_transports_are_unregistered() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let mut ids = Vec::new();
        for _ in 0..20 {
            let transport = router.create_webrtc_transport(options()).await.unwrap();
            ids.push(transport.id().clone());
            transport.close();
        }
        assert_eq!(router.open_transports(), 0);
        assert!(ids.iter().all(|id| router.transport(id).is_none()));

        let open = router.create_webrtc_transport(options()).await.unwrap();
        assert!(router.transport(open.id()).is_some());
        assert_eq!(router.open_transports(), 1);
    }

    #[test_timeout::timeout]
    fn payload_types_stop_at_the_end_of_the_range() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let codecs: Vec<RtpCodecCapability> = (0..MAX_ROUTER_CODECS + 4)
            .map(|index| RtpCodecCapability::video(format!("video/X{index}"), 90000))
            .collect();
        let caps = engine.create_local_router(codecs).rtp_capabilities();
        assert_eq!(caps.codecs.len(), MAX_ROUTER_CODECS);
        assert_eq!(
            caps.codecs.last().and_then(|codec| codec.preferred_payload_type),
            Some(u8::MAX)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn bad_fingerprint_fails_the_transport() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let transport = router.create_webrtc_transport(options()).await.unwrap();
        let err = transport
            .connect(DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "md5".into(),
                    value: "00".into(),
                }],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Dtls(_)));
        assert_eq!(transport.state(), EngineTransportState::Failed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn simulcast_producer_yields_simulcast_consumer() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let send = router.create_webrtc_transport(options()).await.unwrap();
        let recv = router.create_webrtc_transport(options()).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters(3))
            .await
            .unwrap();
        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps));

        let consumer = recv
            .consume(ConsumeOptions {
                producer_id: producer.id().clone(),
                rtp_capabilities: caps,
                paused: true,
            })
            .await
            .unwrap();
        assert_eq!(consumer.consumer_type(), ConsumerType::Simulcast);
        assert!(consumer.paused());
        assert_eq!(consumer.rtp_parameters().codecs[0].payload_type, 101);
        consumer
            .set_preferred_layers(ConsumerLayers {
                spatial_layer: 2,
                temporal_layer: Some(2),
            })
            .await
            .unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn incompatible_capabilities_cannot_consume() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let send = router.create_webrtc_transport(options()).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters(1))
            .await
            .unwrap();
        let h264_only = RtpCapabilities {
            codecs: vec![RtpCodecCapability::video("video/H264", 90000)],
            header_extensions: Vec::new(),
        };
        assert!(!router.can_consume(producer.id(), &h264_only));
        assert!(!router.can_consume(&ProducerId::from("missing"), &router.rtp_capabilities()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_transport_closes_its_producer_and_downstream_consumers() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let router = engine.create_local_router(codecs());
        let send = router.create_webrtc_transport(options()).await.unwrap();
        let recv = router.create_webrtc_transport(options()).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters(1))
            .await
            .unwrap();
        let consumer = recv
            .consume(ConsumeOptions {
                producer_id: producer.id().clone(),
                rtp_capabilities: router.rtp_capabilities(),
                paused: false,
            })
            .await
            .unwrap();

        send.close();
        assert_eq!(router.live_producers(), 0);
        assert!(consumer.closed());
        assert!(consumer.resume().await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn dead_worker_rejects_new_resources() {
        let engine = LocalEngine::new(LocalEngineConfig::default());
        let mut health = engine.worker_health();
        let router = engine.create_local_router(codecs());
        engine.kill("test");
        health.changed().await.unwrap();
        assert!(matches!(*health.borrow(), WorkerHealth::Died { .. }));
        assert!(matches!(
            router.create_webrtc_transport(options()).await,
            Err(EngineError::WorkerDied)
        ));
    }
}

//! Boundary to the media engine that actually moves packets.
//!
//! The coordinator only ever talks to these traits. [`local::LocalEngine`] is the
//! in-process implementation used by the binary and the tests; a binding to an
//! out-of-process worker implements the same surface.

use async_trait::async_trait;
use beach_relay_core::{
    ConsumerId, ConsumerType, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId,
};
use serde::{Deserialize, Serialize};
use std::{fmt, net::IpAddr, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;

pub mod local;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no free RTC port in range {min}..={max}")]
    PortsExhausted { min: u16, max: u16 },
    #[error("unknown producer {0}")]
    UnknownProducer(ProducerId),
    #[error("transport {0} is already connected")]
    AlreadyConnected(TransportId),
    #[error("transport {0} is closed")]
    TransportClosed(TransportId),
    #[error("consumer {0} is closed")]
    ConsumerClosed(ConsumerId),
    #[error("DTLS negotiation failed: {0}")]
    Dtls(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("media worker died")]
    WorkerDied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerHealth {
    Running,
    Died { reason: String },
}

/// Engine-side view of a transport's ICE/DTLS progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for EngineTransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineTransportState::New => "new",
            EngineTransportState::Connecting => "connecting",
            EngineTransportState::Connected => "connected",
            EngineTransportState::Failed => "failed",
            EngineTransportState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: IpAddr,
    #[serde(default)]
    pub announced_ip: Option<String>,
}

impl ListenIp {
    /// Address advertised to peers in ICE candidates.
    pub fn advertised(&self) -> String {
        self.announced_ip
            .clone()
            .unwrap_or_else(|| self.ip.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn MediaRouter>, EngineError>;

    fn worker_health(&self) -> watch::Receiver<WorkerHealth>;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn state(&self) -> EngineTransportState;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    /// Applies the remote DTLS parameters. Not idempotent.
    async fn connect(&self, remote: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    async fn consume(&self, options: ConsumeOptions)
        -> Result<Arc<dyn EngineConsumer>, EngineError>;

    /// Closes the transport together with every producer and consumer on it.
    fn close(&self);
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn consumer_type(&self) -> ConsumerType;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;
    fn closed(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;
    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<(), EngineError>;

    fn close(&self);
}

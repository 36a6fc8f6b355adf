//! Seam to the local media engine.
//!
//! A [`LocalTransport`] does not call back into the controller when it needs
//! the remote side to act. Instead negotiation is split into gates: the
//! controller opens a gate to obtain what must be sent to the relay, performs
//! the round trip, and only then releases the gate with the relay's answer.
//! Implementations reject a release that has no matching open gate.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use beach_relay_core::{
    protocol::{ConsumeResponse, TransportParameters},
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpEncodingParameters,
    RtpParameters, TransportDirection, TransportId,
};
use tokio::sync::watch;

use crate::{
    capture::MediaTrack,
    error::{DeviceError, NegotiationError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl LocalTransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LocalTransportState::Failed | LocalTransportState::Closed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecOptions {
    pub video_google_start_bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceOptions {
    pub encodings: Vec<RtpEncodingParameters>,
    pub codec_options: CodecOptions,
}

/// What the local engine wants announced to the relay before it can send.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceGate {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
pub struct LocalProducer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track: MediaTrack,
}

impl LocalProducer {
    pub fn close(&self) {
        self.track.stop();
    }
}

#[derive(Debug, Clone)]
pub struct LocalConsumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub track: MediaTrack,
    paused: Arc<AtomicBool>,
}

impl LocalConsumer {
    pub fn new(response: &ConsumeResponse, track: MediaTrack) -> Self {
        Self {
            id: response.id.clone(),
            producer_id: response.producer_id.clone(),
            kind: response.kind,
            rtp_parameters: response.rtp_parameters.clone(),
            track,
            paused: Arc::new(AtomicBool::new(response.paused || response.producer_paused)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.track.stop();
    }
}

#[async_trait]
pub trait LocalTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> TransportDirection;

    fn state(&self) -> LocalTransportState;

    /// Observes connection state changes, including failures reported by the
    /// engine after negotiation completed.
    fn subscribe_state(&self) -> watch::Receiver<LocalTransportState>;

    /// Moves a new transport to connecting and yields the local DTLS
    /// parameters the relay must be given.
    async fn connect_gate(&self) -> Result<DtlsParameters, NegotiationError>;

    /// Answers the open connect gate with the relay's outcome.
    fn release_connect(&self, outcome: Result<(), String>) -> Result<(), NegotiationError>;

    /// Prepares a track for sending on a connected transport.
    async fn produce_gate(
        &self,
        track: &MediaTrack,
        options: ProduceOptions,
    ) -> Result<ProduceGate, NegotiationError>;

    /// Answers the open produce gate with the producer id assigned by the
    /// relay, or the reason it refused.
    fn release_produce(
        &self,
        outcome: Result<ProducerId, String>,
    ) -> Result<LocalProducer, NegotiationError>;

    async fn consume(&self, response: &ConsumeResponse) -> Result<LocalConsumer, NegotiationError>;

    fn close(&self);
}

#[async_trait]
pub trait Device: Send + Sync {
    fn is_loaded(&self) -> bool;

    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), DeviceError>;

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError>;

    fn can_produce(&self, kind: MediaKind) -> Result<bool, DeviceError>;

    fn create_transport(
        &self,
        direction: TransportDirection,
        parameters: TransportParameters,
    ) -> Result<Arc<dyn LocalTransport>, DeviceError>;
}

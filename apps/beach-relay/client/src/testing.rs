//! In-process doubles for the local media engine and capture sources.
//!
//! The simulated transport enforces gate ordering the way a real engine would,
//! so controller bugs that release a gate early or produce before connecting
//! surface as [`NegotiationError`]s.

use std::{collections::HashSet, fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use beach_relay_core::{
    protocol::{ConsumeResponse, TransportParameters},
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, ProducerId, RtcpParameters,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    TransportDirection, TransportId,
};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use tokio::sync::watch;

use crate::{
    capture::{CaptureSource, MediaCapture, MediaTrack},
    device::{
        Device, LocalConsumer, LocalProducer, LocalTransport, LocalTransportState, ProduceGate,
        ProduceOptions,
    },
    error::{DeviceError, MediaAccessError, NegotiationError},
};

#[derive(Default)]
pub struct SimulatedDevice {
    /// Mime types this device can handle; `None` accepts whatever the router
    /// offers.
    supported_mime_types: Option<Vec<String>>,
    unsupported: bool,
    loaded: Mutex<Option<RtpCapabilities>>,
    transports: Mutex<Vec<Arc<SimulatedTransport>>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose engine refuses to load at all.
    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Self::default()
        }
    }

    /// A device restricted to the given codecs, e.g. `["video/H264"]`.
    pub fn with_codecs<I, S>(mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported_mime_types: Some(mime_types.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn transports(&self) -> Vec<Arc<SimulatedTransport>> {
        self.transports.lock().clone()
    }

    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<SimulatedTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.direction == direction)
            .cloned()
    }

    fn supports(&self, codec: &RtpCodecCapability) -> bool {
        match &self.supported_mime_types {
            Some(mime_types) => mime_types
                .iter()
                .any(|mime_type| mime_type.eq_ignore_ascii_case(&codec.mime_type)),
            None => true,
        }
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    fn is_loaded(&self) -> bool {
        self.loaded.lock().is_some()
    }

    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), DeviceError> {
        if self.unsupported {
            return Err(DeviceError::Unsupported("simulated engine disabled".into()));
        }
        let codecs = router_capabilities
            .codecs
            .into_iter()
            .filter(|codec| self.supports(codec))
            .collect();
        *self.loaded.lock() = Some(RtpCapabilities {
            codecs,
            header_extensions: router_capabilities.header_extensions,
        });
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError> {
        self.loaded.lock().clone().ok_or(DeviceError::NotLoaded)
    }

    fn can_produce(&self, kind: MediaKind) -> Result<bool, DeviceError> {
        Ok(self.rtp_capabilities()?.supports_kind(kind))
    }

    fn create_transport(
        &self,
        direction: TransportDirection,
        parameters: TransportParameters,
    ) -> Result<Arc<dyn LocalTransport>, DeviceError> {
        let capabilities = self.rtp_capabilities()?;
        let transport = Arc::new(SimulatedTransport::new(direction, parameters, capabilities));
        self.transports.lock().push(Arc::clone(&transport));
        let transport: Arc<dyn LocalTransport> = transport;
        Ok(transport)
    }
}

pub struct SimulatedTransport {
    id: TransportId,
    direction: TransportDirection,
    remote: TransportParameters,
    capabilities: RtpCapabilities,
    state: watch::Sender<LocalTransportState>,
    pending_produce: Mutex<Option<(MediaKind, MediaTrack)>>,
}

impl SimulatedTransport {
    fn new(
        direction: TransportDirection,
        remote: TransportParameters,
        capabilities: RtpCapabilities,
    ) -> Self {
        let (state, _) = watch::channel(LocalTransportState::New);
        Self {
            id: remote.id.clone(),
            direction,
            remote,
            capabilities,
            state,
            pending_produce: Mutex::new(None),
        }
    }

    pub fn remote_parameters(&self) -> &TransportParameters {
        &self.remote
    }

    /// Simulates the engine losing ICE/DTLS connectivity.
    pub fn fail(&self) {
        self.state.send_replace(LocalTransportState::Failed);
    }

    fn current(&self) -> LocalTransportState {
        *self.state.borrow()
    }

    fn ensure_connected(&self) -> Result<(), NegotiationError> {
        match self.current() {
            LocalTransportState::Connected => Ok(()),
            LocalTransportState::Failed => Err(NegotiationError::TransportFailed(self.id.clone())),
            LocalTransportState::Closed => Err(NegotiationError::TransportClosed(self.id.clone())),
            _ => Err(NegotiationError::NotConnected(self.id.clone())),
        }
    }

    fn send_parameters(
        &self,
        kind: MediaKind,
        options: ProduceOptions,
    ) -> Result<RtpParameters, NegotiationError> {
        let codec = self
            .capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == kind)
            .ok_or_else(|| NegotiationError::Local(format!("no {kind} codec negotiated")))?;

        let mut parameters = codec.parameters.clone();
        if kind == MediaKind::Video {
            if let Some(bitrate) = options.codec_options.video_google_start_bitrate {
                parameters.insert("x-google-start-bitrate".into(), bitrate.into());
            }
        }

        let mut rng = rand::thread_rng();
        let encodings = if options.encodings.is_empty() {
            vec![RtpEncodingParameters {
                ssrc: Some(rng.gen()),
                ..RtpEncodingParameters::default()
            }]
        } else {
            let simulcast = options.encodings.len() > 1;
            options
                .encodings
                .into_iter()
                .enumerate()
                .map(|(index, encoding)| RtpEncodingParameters {
                    ssrc: Some(rng.gen()),
                    rid: simulcast.then(|| format!("r{index}")),
                    ..encoding
                })
                .collect()
        };

        Ok(RtpParameters {
            mid: Some("0".into()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(96),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters,
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            header_extensions: Vec::new(),
            encodings,
            rtcp: RtcpParameters {
                cname: Some(format!("sim-{}", rng.gen::<u32>())),
                reduced_size: true,
            },
        })
    }
}

#[async_trait]
impl LocalTransport for SimulatedTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn state(&self) -> LocalTransportState {
        self.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<LocalTransportState> {
        self.state.subscribe()
    }

    async fn connect_gate(&self) -> Result<DtlsParameters, NegotiationError> {
        match self.current() {
            LocalTransportState::New => {
                self.state.send_replace(LocalTransportState::Connecting);
                Ok(DtlsParameters {
                    role: DtlsRole::Client,
                    fingerprints: vec![local_fingerprint()],
                })
            }
            LocalTransportState::Failed => Err(NegotiationError::TransportFailed(self.id.clone())),
            LocalTransportState::Closed => Err(NegotiationError::TransportClosed(self.id.clone())),
            _ => Err(NegotiationError::NotConnecting(self.id.clone())),
        }
    }

    fn release_connect(&self, outcome: Result<(), String>) -> Result<(), NegotiationError> {
        if self.current() != LocalTransportState::Connecting {
            return Err(NegotiationError::NotConnecting(self.id.clone()));
        }
        match outcome {
            Ok(()) => {
                self.state.send_replace(LocalTransportState::Connected);
                Ok(())
            }
            Err(reason) => {
                self.state.send_replace(LocalTransportState::Failed);
                Err(NegotiationError::Remote(reason))
            }
        }
    }

    async fn produce_gate(
        &self,
        track: &MediaTrack,
        options: ProduceOptions,
    ) -> Result<ProduceGate, NegotiationError> {
        self.ensure_connected()?;
        if self.direction != TransportDirection::Send {
            return Err(NegotiationError::Local("cannot produce on a receive transport".into()));
        }
        if track.is_ended() {
            return Err(NegotiationError::Local(format!("track {} has ended", track.id())));
        }
        let mut pending = self.pending_produce.lock();
        if pending.is_some() {
            return Err(NegotiationError::Local("a produce is already in flight".into()));
        }
        let rtp_parameters = self.send_parameters(track.kind(), options)?;
        *pending = Some((track.kind(), track.clone()));
        Ok(ProduceGate {
            kind: track.kind(),
            rtp_parameters,
        })
    }

    fn release_produce(
        &self,
        outcome: Result<ProducerId, String>,
    ) -> Result<LocalProducer, NegotiationError> {
        let (kind, track) = self
            .pending_produce
            .lock()
            .take()
            .ok_or_else(|| NegotiationError::NoPendingProduce(self.id.clone()))?;
        match outcome {
            Ok(id) => Ok(LocalProducer { id, kind, track }),
            Err(reason) => Err(NegotiationError::Remote(reason)),
        }
    }

    async fn consume(&self, response: &ConsumeResponse) -> Result<LocalConsumer, NegotiationError> {
        self.ensure_connected()?;
        if self.direction != TransportDirection::Recv {
            return Err(NegotiationError::Local("cannot consume on a send transport".into()));
        }
        let track = MediaTrack::new(response.kind, format!("remote-{}", response.producer_id));
        Ok(LocalConsumer::new(response, track))
    }

    fn close(&self) {
        self.pending_produce.lock().take();
        self.state.send_replace(LocalTransportState::Closed);
    }
}

#[derive(Default)]
pub struct SimulatedCapture {
    denied: HashSet<CaptureSource>,
    missing: HashSet<CaptureSource>,
    captured: Mutex<Vec<MediaTrack>>,
}

impl SimulatedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests for `source` fail as if the user declined the prompt.
    pub fn deny(mut self, source: CaptureSource) -> Self {
        self.denied.insert(source);
        self
    }

    pub fn without(mut self, source: CaptureSource) -> Self {
        self.missing.insert(source);
        self
    }

    pub fn captured(&self) -> Vec<MediaTrack> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for SimulatedCapture {
    async fn capture(&self, source: CaptureSource) -> Result<MediaTrack, MediaAccessError> {
        if self.missing.contains(&source) {
            return Err(MediaAccessError::NotFound(source));
        }
        if self.denied.contains(&source) {
            return Err(MediaAccessError::PermissionDenied(source));
        }
        let track = MediaTrack::new(MediaKind::Video, source.to_string());
        self.captured.lock().push(track.clone());
        Ok(track)
    }
}

fn local_fingerprint() -> DtlsFingerprint {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut value = String::with_capacity(bytes.len() * 3);
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            value.push(':');
        }
        let _ = write!(value, "{byte:02X}");
    }
    DtlsFingerprint {
        algorithm: "sha-256".into(),
        value,
    }
}

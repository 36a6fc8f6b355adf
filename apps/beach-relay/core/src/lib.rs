//! Shared primitives for the Beach relay: identifiers, media descriptors and the
//! request/acknowledgement signaling protocol spoken between the relay server and
//! its clients.

mod error;
mod ids;
pub mod protocol;
pub mod rtp;

pub use error::{ErrorCode, ErrorPayload};
pub use ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
pub use rtp::{
    ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceCandidateType,
    IceParameters, MediaKind, ProducerInfo, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpParameters,
    TransportDirection, TransportProtocol,
};

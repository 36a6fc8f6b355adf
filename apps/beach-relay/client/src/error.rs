use std::time::Duration;

use beach_relay_core::{ErrorCode, ErrorPayload, MediaKind, TransportId};
use thiserror::Error;

use crate::{capture::CaptureSource, state::InvalidTransition};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connecting to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("{method} was not acknowledged within {timeout:?}")]
    TimedOut {
        method: &'static str,
        timeout: Duration,
    },
    #[error("signaling channel closed")]
    Closed,
    #[error("failed to encode {method}: {reason}")]
    Encode { method: &'static str, reason: String },
    #[error("unexpected acknowledgement for {method}: {reason}")]
    Decode { method: &'static str, reason: String },
}

/// Outcome of a single request round trip.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("request rejected: {0}")]
    Rejected(ErrorPayload),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("local media engine unsupported: {0}")]
    Unsupported(String),
    #[error("device has not been loaded with router capabilities")]
    NotLoaded,
    #[error("device cannot produce {0}")]
    CannotProduce(MediaKind),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission to capture {0} was denied")]
    PermissionDenied(CaptureSource),
    #[error("no {0} source available")]
    NotFound(CaptureSource),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("transport {0} is not awaiting a connect")]
    NotConnecting(TransportId),
    #[error("transport {0} is not connected")]
    NotConnected(TransportId),
    #[error("transport {0} has no produce in flight")]
    NoPendingProduce(TransportId),
    #[error("transport {0} failed")]
    TransportFailed(TransportId),
    #[error("transport {0} is closed")]
    TransportClosed(TransportId),
    #[error("remote finalize failed: {0}")]
    Remote(String),
    #[error("{0}")]
    Local(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("capability mismatch: {0}")]
    Capability(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error("transport already finalized: {0}")]
    DuplicateFinalize(String),
    #[error("relay could not allocate a resource: {0}")]
    Engine(String),
    #[error("relay rejected request: {0}")]
    Remote(ErrorPayload),
    #[error(transparent)]
    InvalidState(#[from] InvalidTransition),
}

impl From<RequestError> for ControllerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Channel(err) => ControllerError::Channel(err),
            RequestError::Rejected(payload) => match payload.code {
                ErrorCode::Negotiation => {
                    ControllerError::Negotiation(NegotiationError::Remote(payload.message))
                }
                ErrorCode::Capability => ControllerError::Capability(payload.message),
                ErrorCode::DuplicateFinalize => ControllerError::DuplicateFinalize(payload.message),
                ErrorCode::Engine => ControllerError::Engine(payload.message),
                _ => ControllerError::Remote(payload),
            },
        }
    }
}

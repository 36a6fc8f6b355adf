use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine readable failure class carried in a rejected acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Signaling connection lost or never acknowledged.
    Channel,
    /// Transport handshake failed.
    Negotiation,
    /// Capability set cannot consume the requested producer.
    Capability,
    /// Local media engine unsupported in this environment.
    Device,
    /// Capture permission denied or device absent.
    MediaAccess,
    DuplicateFinalize,
    /// Media engine could not allocate a resource.
    Engine,
    NotJoined,
    NotFound,
    TransportNotConnected,
    TransportInactive,
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Channel => "channel",
            ErrorCode::Negotiation => "negotiation",
            ErrorCode::Capability => "capability",
            ErrorCode::Device => "device",
            ErrorCode::MediaAccess => "media_access",
            ErrorCode::DuplicateFinalize => "duplicate_finalize",
            ErrorCode::Engine => "engine",
            ErrorCode::NotJoined => "not_joined",
            ErrorCode::NotFound => "not_found",
            ErrorCode::TransportNotConnected => "transport_not_connected",
            ErrorCode::TransportInactive => "transport_inactive",
            ErrorCode::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned in place of a response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

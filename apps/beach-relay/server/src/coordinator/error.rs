use beach_relay_core::{
    ConsumerId, ErrorCode, ErrorPayload, MediaKind, ProducerId, TransportDirection, TransportId,
};
use thiserror::Error;

use super::transport::TransportState;
use crate::engine::EngineError;

/// Failure of a single signaling request. Always answered in the ack, never
/// fatal to the connection.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("peer has not joined a room")]
    NotJoined,
    #[error("transport {0} not found")]
    TransportNotFound(String),
    #[error("no {0} transport has been created")]
    NoTransport(TransportDirection),
    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),
    #[error("no consumer has been created")]
    NoConsumer,
    #[error("room has no active producer")]
    NoActiveProducer,
    #[error("transport {id} is a {actual} transport, expected {expected}")]
    WrongDirection {
        id: TransportId,
        expected: TransportDirection,
        actual: TransportDirection,
    },
    #[error("transport {id} is {state}, finalize it before creating media on it")]
    TransportNotConnected { id: TransportId, state: TransportState },
    #[error("transport {id} is {state}")]
    TransportInactive { id: TransportId, state: TransportState },
    #[error("transport {0} was already finalized")]
    DuplicateFinalize(TransportId),
    #[error("transport {id} negotiation failed: {source}")]
    Negotiation {
        id: TransportId,
        #[source]
        source: EngineError,
    },
    #[error("rtp capabilities cannot consume {kind} producer {producer_id}")]
    Capability {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CoordinatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::NotJoined => ErrorCode::NotJoined,
            CoordinatorError::TransportNotFound(_)
            | CoordinatorError::NoTransport(_)
            | CoordinatorError::ConsumerNotFound(_)
            | CoordinatorError::NoConsumer
            | CoordinatorError::NoActiveProducer => ErrorCode::NotFound,
            CoordinatorError::WrongDirection { .. } | CoordinatorError::InvalidRequest(_) => {
                ErrorCode::InvalidRequest
            }
            CoordinatorError::TransportNotConnected { .. } => ErrorCode::TransportNotConnected,
            CoordinatorError::TransportInactive { .. } => ErrorCode::TransportInactive,
            CoordinatorError::DuplicateFinalize(_) => ErrorCode::DuplicateFinalize,
            CoordinatorError::Negotiation { .. } => ErrorCode::Negotiation,
            CoordinatorError::Capability { .. } => ErrorCode::Capability,
            CoordinatorError::Engine(_) => ErrorCode::Engine,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }

    /// Label used for the request outcome metric.
    pub fn metric_label(&self) -> &'static str {
        self.code().as_str()
    }
}

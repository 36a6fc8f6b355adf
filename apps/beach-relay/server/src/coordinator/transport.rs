use std::{fmt, sync::Arc};

use beach_relay_core::{protocol::TransportParameters, TransportDirection, TransportId};
use tracing::{info, warn};

use super::error::CoordinatorError;
use crate::engine::{EngineTransport, EngineTransportState};

/// Coordinator-side lifecycle of a transport.
///
/// `created → connecting → connected`, `connecting | connected → failed` and
/// `* → closed`. `failed` and `closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportState::Created => "created",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(label)
    }
}

pub(crate) struct TransportRecord {
    direction: TransportDirection,
    engine: Arc<dyn EngineTransport>,
    state: TransportState,
}

impl TransportRecord {
    pub(crate) fn new(direction: TransportDirection, engine: Arc<dyn EngineTransport>) -> Self {
        Self {
            direction,
            engine,
            state: TransportState::Created,
        }
    }

    pub(crate) fn id(&self) -> &TransportId {
        self.engine.id()
    }

    pub(crate) fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub(crate) fn engine(&self) -> &Arc<dyn EngineTransport> {
        &self.engine
    }

    pub(crate) fn parameters(&self) -> TransportParameters {
        TransportParameters {
            id: self.engine.id().clone(),
            ice_parameters: self.engine.ice_parameters(),
            ice_candidates: self.engine.ice_candidates(),
            dtls_parameters: self.engine.dtls_parameters(),
        }
    }

    /// Current state after folding in transitions the engine drove on its own
    /// (ICE or DTLS failure, worker-side close). A failed transport is closed
    /// in the engine so its port is released.
    pub(crate) fn state(&mut self) -> TransportState {
        if self.state.is_terminal() {
            return self.state;
        }
        let next = match self.engine.state() {
            EngineTransportState::Failed => Some(TransportState::Failed),
            EngineTransportState::Closed => Some(TransportState::Closed),
            EngineTransportState::Connected if self.state == TransportState::Connecting => {
                Some(TransportState::Connected)
            }
            _ => None,
        };
        if let Some(next) = next {
            if next == TransportState::Failed {
                warn!(transport_id = %self.id(), previous = %self.state, "transport failed");
                self.engine.close();
            }
            self.state = next;
        }
        self.state
    }

    /// Moves `created → connecting`; the caller finishes with
    /// [`finish_connect`](Self::finish_connect).
    pub(crate) fn begin_connect(&mut self) -> Result<(), CoordinatorError> {
        match self.state() {
            TransportState::Created => {
                self.state = TransportState::Connecting;
                Ok(())
            }
            TransportState::Connecting | TransportState::Connected => {
                Err(CoordinatorError::DuplicateFinalize(self.id().clone()))
            }
            state @ (TransportState::Failed | TransportState::Closed) => {
                Err(CoordinatorError::TransportInactive {
                    id: self.id().clone(),
                    state,
                })
            }
        }
    }

    pub(crate) fn finish_connect(&mut self, connected: bool) {
        if self.state != TransportState::Connecting {
            return;
        }
        self.state = if connected {
            TransportState::Connected
        } else {
            self.engine.close();
            TransportState::Failed
        };
        info!(
            transport_id = %self.id(),
            direction = %self.direction,
            state = %self.state,
            "transport finalized"
        );
    }

    /// Gate for producer/consumer creation.
    pub(crate) fn ensure_usable(
        &mut self,
        expected: TransportDirection,
    ) -> Result<(), CoordinatorError> {
        if self.direction != expected {
            return Err(CoordinatorError::WrongDirection {
                id: self.id().clone(),
                expected,
                actual: self.direction,
            });
        }
        match self.state() {
            TransportState::Connected => Ok(()),
            state @ (TransportState::Created | TransportState::Connecting) => {
                Err(CoordinatorError::TransportNotConnected {
                    id: self.id().clone(),
                    state,
                })
            }
            state @ (TransportState::Failed | TransportState::Closed) => {
                Err(CoordinatorError::TransportInactive {
                    id: self.id().clone(),
                    state,
                })
            }
        }
    }

    pub(crate) fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.engine.close();
        self.state = TransportState::Closed;
    }
}

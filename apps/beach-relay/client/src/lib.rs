//! Client side of the Beach relay: a request/acknowledgement signaling channel
//! and the session controller that drives join, publish and subscribe against
//! a local media engine.

pub mod capture;
pub mod channel;
pub mod controller;
pub mod device;
pub mod error;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use capture::{CaptureSource, MediaCapture, MediaStream, MediaTrack};
pub use channel::{ChannelConfig, ChannelEvent, ChannelEvents, SignalingChannel};
pub use controller::{ControllerConfig, ControllerEvent, SessionController};
pub use device::{Device, LocalConsumer, LocalProducer, LocalTransport, LocalTransportState};
pub use error::{
    ChannelError, ControllerError, DeviceError, MediaAccessError, NegotiationError, RequestError,
};
pub use state::{ConnectionPhase, ControllerState, PublishPhase, SubscribePhase};

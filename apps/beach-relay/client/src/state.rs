//! Controller state machine.
//!
//! The three axes move independently except that publishing and subscribing
//! both require a joined connection, and a disconnect resets everything.

use std::fmt;

use thiserror::Error;

use crate::error::ControllerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Joining,
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPhase {
    #[default]
    Idle,
    Starting,
    Publishing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribePhase {
    #[default]
    Idle,
    Subscribing,
    Subscribed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    ConnectStarted,
    Joined,
    ConnectFailed(ControllerError),
    Disconnected(Option<ControllerError>),
    PublishStarted,
    Published,
    PublishFailed(ControllerError),
    PublishEnded,
    SubscribeStarted,
    Subscribed,
    SubscribeFailed(ControllerError),
    SubscriptionEnded,
}

impl StateEvent {
    fn name(&self) -> &'static str {
        match self {
            StateEvent::ConnectStarted => "connect_started",
            StateEvent::Joined => "joined",
            StateEvent::ConnectFailed(_) => "connect_failed",
            StateEvent::Disconnected(_) => "disconnected",
            StateEvent::PublishStarted => "publish_started",
            StateEvent::Published => "published",
            StateEvent::PublishFailed(_) => "publish_failed",
            StateEvent::PublishEnded => "publish_ended",
            StateEvent::SubscribeStarted => "subscribe_started",
            StateEvent::Subscribed => "subscribed",
            StateEvent::SubscribeFailed(_) => "subscribe_failed",
            StateEvent::SubscriptionEnded => "subscription_ended",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{event} is not allowed while {state}")]
pub struct InvalidTransition {
    pub event: &'static str,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub connection: ConnectionPhase,
    pub publish: PublishPhase,
    pub subscribe: SubscribePhase,
    pub last_error: Option<ControllerError>,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?}",
            self.connection, self.publish, self.subscribe
        )
    }
}

impl ControllerState {
    pub fn is_joined(&self) -> bool {
        self.connection == ConnectionPhase::Joined
    }

    /// Applies `event`, leaving the state untouched when the transition is
    /// not allowed.
    pub fn apply(&mut self, event: StateEvent) -> Result<(), InvalidTransition> {
        let name = event.name();
        let allowed = match &event {
            StateEvent::ConnectStarted => self.connection == ConnectionPhase::Disconnected,
            StateEvent::Joined | StateEvent::ConnectFailed(_) => {
                self.connection == ConnectionPhase::Joining
            }
            StateEvent::Disconnected(_) => true,
            StateEvent::PublishStarted => {
                self.is_joined()
                    && matches!(self.publish, PublishPhase::Idle | PublishPhase::Failed)
            }
            StateEvent::Published => self.publish == PublishPhase::Starting,
            StateEvent::PublishFailed(_) => {
                matches!(self.publish, PublishPhase::Starting | PublishPhase::Publishing)
            }
            StateEvent::PublishEnded => self.publish == PublishPhase::Publishing,
            StateEvent::SubscribeStarted => {
                self.is_joined()
                    && matches!(self.subscribe, SubscribePhase::Idle | SubscribePhase::Failed)
            }
            StateEvent::Subscribed => self.subscribe == SubscribePhase::Subscribing,
            StateEvent::SubscribeFailed(_) => matches!(
                self.subscribe,
                SubscribePhase::Subscribing | SubscribePhase::Subscribed
            ),
            StateEvent::SubscriptionEnded => self.subscribe == SubscribePhase::Subscribed,
        };
        if !allowed {
            return Err(InvalidTransition {
                event: name,
                state: self.to_string(),
            });
        }

        match event {
            StateEvent::ConnectStarted => {
                self.connection = ConnectionPhase::Joining;
                self.last_error = None;
            }
            StateEvent::Joined => self.connection = ConnectionPhase::Joined,
            StateEvent::ConnectFailed(err) => {
                *self = ControllerState {
                    last_error: Some(err),
                    ..ControllerState::default()
                };
            }
            StateEvent::Disconnected(err) => {
                let last_error = err.or_else(|| self.last_error.take());
                *self = ControllerState {
                    last_error,
                    ..ControllerState::default()
                };
            }
            StateEvent::PublishStarted => {
                self.publish = PublishPhase::Starting;
                self.last_error = None;
            }
            StateEvent::Published => self.publish = PublishPhase::Publishing,
            StateEvent::PublishFailed(err) => {
                self.publish = PublishPhase::Failed;
                self.last_error = Some(err);
            }
            StateEvent::PublishEnded => self.publish = PublishPhase::Idle,
            StateEvent::SubscribeStarted => {
                self.subscribe = SubscribePhase::Subscribing;
                self.last_error = None;
            }
            StateEvent::Subscribed => self.subscribe = SubscribePhase::Subscribed,
            StateEvent::SubscribeFailed(err) => {
                self.subscribe = SubscribePhase::Failed;
                self.last_error = Some(err);
            }
            StateEvent::SubscriptionEnded => self.subscribe = SubscribePhase::Idle,
        }
        Ok(())
    }
}

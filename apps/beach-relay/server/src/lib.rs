//! Session coordinator for the Beach media relay: per-room signaling over
//! websockets on top of a pluggable media engine.

pub mod app;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod probe;
pub mod telemetry;
mod websocket;

//! Bus Tracker Library
//!
//! Core of the bus tracking client: position publishing over a reconnecting
//! MQTT link, and an authenticated HTTP gateway that refreshes credentials.

pub mod api;
pub mod auth;
pub mod broker;
pub mod commands;
pub mod config;
pub mod gateway;
pub mod location;
pub mod logging;
pub mod position;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use commands::AppState;
pub use config::Config;
pub use telemetry::{ConnectionState, TelemetryLink};
pub use tracking::{TrackingCoordinator, TrackingHandle};

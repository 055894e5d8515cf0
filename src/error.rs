//! Error types for the `AirPods` service.
//!
//! This module defines the crate-wide error type. Module-level errors (codec,
//! long-press, audio route, packet log, relay) convert into it with `?`.

use bluer::Address;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
   airpods::{long_press::ToggleError, parser::ProtoError, policy::RouteError},
   packet_log,
   relay::RelayError,
};

/// Main error type for the `AirPods` service.
#[derive(Error, Debug)]
pub enum AirPodsError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Protocol error: {0}")]
   Proto(#[from] ProtoError),

   #[error("Long-press configuration error: {0}")]
   Toggle(#[from] ToggleError),

   #[error("Audio route error: {0}")]
   Route(#[from] RouteError),

   #[error("Packet log error: {0}")]
   PacketLog(#[from] packet_log::Error),

   #[error("Relay error: {0}")]
   Relay(#[from] RelayError),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not paired: {0}")]
   DeviceNotPaired(Address),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Invalid packet: {0}")]
   InvalidPacket(String),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Actor panicked: {0}")]
   ActorPanicked(JoinError),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

/// Convenience type alias for Results with `AirPodsError`.
pub type Result<T> = std::result::Result<T, AirPodsError>;

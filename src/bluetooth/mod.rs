//! Bluetooth communication layer for `AirPods`.
//!
//! L2CAP transport, BlueZ audio profile routing, and device
//! discovery/connection handling.

pub mod audio;
pub mod l2cap;
pub mod manager;

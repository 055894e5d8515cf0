//! `AirPods` device management and protocol implementation.
//!
//! Frame codec, decoded state, the per-device connection, long-press
//! configuration and the ear-presence media policy.

pub mod device;
pub mod long_press;
pub mod parser;
pub mod policy;
pub mod protocol;
pub mod recognition;
pub mod state;

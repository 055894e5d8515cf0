//! AirPods accessory protocol (AAP) daemon.
//!
//! Maintains the AAP link to paired `AirPods` over BlueZ, tracks battery,
//! noise control and ear state, drives media playback from ear detection and
//! exposes everything on the session bus.

pub mod airpods;
pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod mpris;
pub mod packet_log;
pub mod relay;

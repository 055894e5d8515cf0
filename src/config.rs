//! Configuration management for the `AirPods` service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices, connection parameters and policy switches.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{AirPodsError, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_sec: u64,

   /// Drive playback and audio routing from ear presence.
   #[serde(default = "default_true")]
   pub ear_detection: bool,

   /// Whether the accessory offers Off in its long-press cycle.
   #[serde(default = "default_true")]
   pub off_listening_mode: bool,

   #[serde(default = "default_handshake_retries")]
   pub handshake_retry_delays_ms: Vec<u64>,

   #[serde(default = "default_true")]
   pub packet_log: bool,
}

/// Represents a known `AirPods` device.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_poll_interval() -> u64 {
   30
}

const fn default_retry_count() -> u32 {
   10
}

const fn default_reconnect_delay() -> u64 {
   10
}

const fn default_true() -> bool {
   true
}

fn default_handshake_retries() -> Vec<u64> {
   vec![200, 5000]
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         poll_interval: default_poll_interval(),
         connection_retry_count: default_retry_count(),
         reconnect_delay_sec: default_reconnect_delay(),
         ear_detection: true,
         off_listening_mode: true,
         handshake_retry_delays_ms: default_handshake_retries(),
         packet_log: true,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      fs::write(path, toml::to_string_pretty(self)?)?;
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(airpods_home) = env::var("AIRPODS_HOME") {
         PathBuf::from(airpods_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(AirPodsError::ConfigDirNotFound);
      };

      Ok(config_dir.join("aapd").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }

   /// Handshake re-send offsets, at most two.
   pub fn handshake_retries(&self) -> Vec<Duration> {
      self
         .handshake_retry_delays_ms
         .iter()
         .take(2)
         .map(|ms| Duration::from_millis(*ms))
         .collect()
   }

   pub const fn reconnect_delay(&self) -> Duration {
      Duration::from_secs(self.reconnect_delay_sec)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_missing_file_writes_defaults() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("aapd").join("config.toml");
      let config = Config::load_from(&path)?;
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(Config::load_from(&path)?, config);
      Ok(())
   }

   #[test]
   fn test_saved_ear_detection_reloads() -> Result<()> {
      let dir = TempDir::new()?;
      let path = dir.path().join("config.toml");
      let mut config = Config::load_from(&path)?;
      assert!(config.ear_detection);
      config.ear_detection = false;
      config.save_to(&path)?;
      assert!(!Config::load_from(&path)?.ear_detection);
      Ok(())
   }

   #[test]
   fn test_partial_file_uses_defaults() -> Result<()> {
      let config: Config = toml::from_str(
         r#"
            ear_detection = false
            handshake_retry_delays_ms = [100, 1000, 9000]

            [[known_devices]]
            address = "AA:BB:CC:DD:EE:FF"
            name = "Pods"
         "#,
      )?;
      assert!(!config.ear_detection);
      assert!(config.off_listening_mode);
      assert!(config.packet_log);
      assert_eq!(config.connection_retry_count, 10);
      assert_eq!(
         config.handshake_retries(),
         [Duration::from_millis(100), Duration::from_secs(1)]
      );
      assert_eq!(config.is_known_device("aa:bb:cc:dd:ee:ff"), Some("Pods"));
      Ok(())
   }
}

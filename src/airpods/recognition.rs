//! Recognition of AAP-capable accessories among BlueZ devices.
//!
//! Checks run from most to least reliable; the first hit wins and is reported
//! so the manager can log why a device was picked up.

use uuid::Uuid;

/// Service record advertised by accessories that speak AAP.
pub const AAP_SERVICE: Uuid = Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a);

const NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple vendor / company id.
const APPLE_ID: u16 = 0x004C;

/// Proximity-pairing message type in manufacturer data.
const PROXIMITY_PAIRING: u8 = 0x07;
/// Offset of the low product-id byte in a proximity-pairing message.
const PID_OFFSET: usize = 6;

const KNOWN_PIDS: &[u16] = &[
   0x2002, // AirPods (1st gen) / some Beats
   0x200A, // AirPods Max
   0x200E, // AirPods Pro
   0x200F, // AirPods (2nd gen)
   0x2012, // Powerbeats Pro
   0x2013, // AirPods (3rd gen)
   0x2014, // AirPods Pro (2nd gen)
   0x2024, // AirPods Pro (2nd gen, USB-C)
];

/// Why a device was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Signal {
   Modalias,
   ServiceRecord,
   ManufacturerData,
   Name,
}

pub fn modalias_matches(vendor: u32, product: u32) -> bool {
   vendor == u32::from(APPLE_ID) && KNOWN_PIDS.iter().any(|&p| u32::from(p) == product)
}

/// Proximity-pairing TLV: `[type, len, ..., pid_lo @6, ...]`.
pub fn manufacturer_data_matches(data: &[u8]) -> bool {
   match data {
      [PROXIMITY_PAIRING, ..] if data.len() > PID_OFFSET => {
         let pid = data[PID_OFFSET];
         KNOWN_PIDS.iter().any(|&p| p.to_le_bytes()[0] == pid)
      },
      _ => false,
   }
}

pub fn name_matches(name: &str) -> bool {
   let name = name.to_ascii_lowercase();
   NAME_PATTERNS.iter().any(|p| name.contains(p))
}

/// Probes a BlueZ device. Property read failures count as "no match".
pub async fn recognize(dev: &bluer::Device) -> Option<Signal> {
   if let Ok(Some(modalias)) = dev.modalias().await
      && modalias_matches(modalias.vendor, modalias.product)
   {
      return Some(Signal::Modalias);
   }

   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.contains(&AAP_SERVICE)
   {
      return Some(Signal::ServiceRecord);
   }

   if let Ok(Some(mfg)) = dev.manufacturer_data().await
      && mfg.get(&APPLE_ID).is_some_and(|d| manufacturer_data_matches(d))
   {
      return Some(Signal::ManufacturerData);
   }

   if let Ok(Some(name)) = dev.name().await
      && name_matches(&name)
   {
      return Some(Signal::Name);
   }
   if let Ok(alias) = dev.alias().await
      && name_matches(&alias)
   {
      return Some(Signal::Name);
   }
   None
}

pub async fn is_device_airpods(dev: &bluer::Device) -> bool {
   match recognize(dev).await {
      Some(signal) => {
         log::debug!("{}: recognized via {signal}", dev.address());
         true
      },
      None => false,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_modalias() {
      assert!(modalias_matches(0x004C, 0x2014));
      assert!(!modalias_matches(0x004C, 0x1234));
      assert!(!modalias_matches(0x0075, 0x2014));
   }

   #[test]
   fn test_manufacturer_data() {
      assert!(manufacturer_data_matches(&[0x07, 0x19, 0x01, 0x0E, 0x20, 0x2B, 0x14]));
      assert!(!manufacturer_data_matches(&[0x10, 0x05, 0x01, 0x0E, 0x20, 0x2B, 0x14]));
      assert!(!manufacturer_data_matches(&[0x07, 0x19]));
   }

   #[test]
   fn test_name_patterns() {
      assert!(name_matches("Alice's AirPods Pro"));
      assert!(name_matches("Powerbeats Pro"));
      assert!(!name_matches("EarPods"));
   }
}

//! Frame classification and decoding for the `AirPods` notification stream.
//!
//! Frames carry no uniform length prefix; each kind is recognised by its own
//! header predicate, checked in a fixed priority order by [`classify`].
//! [`classify_and_decode`] is the entry point used by the read loop and never
//! fails: anything it cannot make sense of is logged and dropped.

use std::str;

use log::debug;
use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   airpods::protocol::{
      BATTERY_LEVEL_ABSENT, Battery, BatteryReading, BatteryStatus, Component,
      ConversationAwareness, EarPresence, FeatureCmd, FeatureId, HDR_ACK_FEATURES,
      HDR_ACK_HANDSHAKE, HDR_BATTERY_STATE, HDR_CMD_CTL, HDR_CONVERSATION, HDR_EAR_DETECTION,
      HDR_METADATA, HDR_NOISE_CTL, NoiseControlMode,
   },
   bluetooth::l2cap::Packet,
};

/// Error type for protocol parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Packet is not of the expected type
   #[error("Not a {expected} packet")]
   WrongPacketType { expected: &'static str },

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 0-3)")]
   InvalidBatteryCount { count: u8 },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   /// Unknown noise control mode
   #[error("Unknown noise control mode: 0x{mode:02x}")]
   UnknownNoiseMode { mode: u8 },
}

type Result<T, E = ProtoError> = std::result::Result<T, E>;

/// Frame kinds, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FrameKind {
   EarDetection,
   NoiseControl,
   Battery,
   ConversationAwareness,
   Metadata,
   FeatureEcho,
   HandshakeAck,
   FeaturesAck,
   Unknown,
}

/// A decoded notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
   EarDetection(EarPresence),
   NoiseControl(NoiseControlMode),
   Battery(Battery),
   ConversationAwareness(ConversationAwareness),
   Metadata(Metadata),
   Feature { feature: FeatureId, enabled: bool },
   HandshakeAck,
   FeaturesAck,
}

fn is_battery_frame(data: &[u8]) -> bool {
   if !data.starts_with(HDR_BATTERY_STATE) || data.len() < 7 {
      return false;
   }
   let count = data[6];
   count <= 3 && data.len() == 7 + 5 * count as usize
}

/// Recognises the frame kind from its header bytes alone.
pub fn classify(data: &[u8]) -> FrameKind {
   if data.starts_with(HDR_EAR_DETECTION) && data.len() >= 8 {
      FrameKind::EarDetection
   } else if data.starts_with(HDR_NOISE_CTL) && data.len() >= 8 {
      FrameKind::NoiseControl
   } else if is_battery_frame(data) {
      FrameKind::Battery
   } else if data.starts_with(HDR_CONVERSATION) && data.len() >= 10 {
      FrameKind::ConversationAwareness
   } else if data.starts_with(HDR_METADATA) {
      FrameKind::Metadata
   } else if data.starts_with(HDR_CMD_CTL) && FeatureCmd::parse(data).is_some() {
      FrameKind::FeatureEcho
   } else if data.starts_with(HDR_ACK_HANDSHAKE) {
      FrameKind::HandshakeAck
   } else if data.starts_with(HDR_ACK_FEATURES) {
      FrameKind::FeaturesAck
   } else {
      FrameKind::Unknown
   }
}

/// Classifies and decodes a frame. Unknown and malformed input yields `None`.
pub fn classify_and_decode(data: &[u8]) -> Option<DecodedFrame> {
   let kind = classify(data);
   let decoded = match kind {
      FrameKind::EarDetection => parse_ear_detection(data).map(DecodedFrame::EarDetection),
      FrameKind::NoiseControl => parse_noise_mode(data).map(DecodedFrame::NoiseControl),
      FrameKind::Battery => parse_battery_status(data).map(DecodedFrame::Battery),
      FrameKind::ConversationAwareness => {
         parse_conversation_awareness(data).map(DecodedFrame::ConversationAwareness)
      },
      FrameKind::Metadata => parse_metadata(data).map(DecodedFrame::Metadata),
      FrameKind::FeatureEcho => match FeatureCmd::parse(data) {
         Some((feature, FeatureCmd::Enable)) => Ok(DecodedFrame::Feature {
            feature,
            enabled: true,
         }),
         Some((feature, FeatureCmd::Disable)) => Ok(DecodedFrame::Feature {
            feature,
            enabled: false,
         }),
         _ => return None,
      },
      FrameKind::HandshakeAck => Ok(DecodedFrame::HandshakeAck),
      FrameKind::FeaturesAck => Ok(DecodedFrame::FeaturesAck),
      FrameKind::Unknown => {
         debug!("Unknown packet | {} bytes => {}", data.len(), summarize(data));
         return None;
      },
   };
   decoded
      .inspect_err(|e| debug!("Dropping malformed {kind} frame ({e}): {}", hex::encode(data)))
      .ok()
}

fn summarize(data: &[u8]) -> String {
   if data.len() < 16 {
      hex::encode(data)
   } else {
      format!("{}..{}", hex::encode(&data[..8]), hex::encode(&data[8..]))
   }
}

/// Parses a battery status packet from `AirPods`.
///
/// Up to three 5-byte slots follow the count byte:
/// `[component, 0x01, level, status, 0x01]`. Slots for unknown components or
/// with the absent level sentinel are skipped.
pub fn parse_battery_status(data: &[u8]) -> Result<Battery> {
   if !data.starts_with(HDR_BATTERY_STATE) {
      return Err(ProtoError::WrongPacketType {
         expected: "battery status",
      });
   }
   if data.len() < 7 {
      return Err(ProtoError::PacketTooShort {
         expected: 7,
         actual: data.len(),
      });
   }

   let count = data[6];
   if count > 3 {
      return Err(ProtoError::InvalidBatteryCount { count });
   }
   let expected = 7 + 5 * count as usize;
   if data.len() != expected {
      return Err(ProtoError::PacketSizeMismatch {
         expected,
         actual: data.len(),
      });
   }

   let readings = data[7..].chunks_exact(5).filter_map(|slot| {
      let (id, level, status) = (slot[0], slot[2], slot[3]);
      let Some(component) = Component::from_repr(id) else {
         debug!("Skipping unknown battery component 0x{id:02x}");
         return None;
      };
      if level == BATTERY_LEVEL_ABSENT {
         return None;
      }
      Some(BatteryReading::new(
         component,
         level.min(100),
         BatteryStatus::from_byte(status),
      ))
   });
   Ok(Battery::from_readings(readings))
}

/// Builds a well-formed battery frame from readings.
pub fn encode_battery_frame(readings: &[BatteryReading]) -> Packet {
   let mut packet = Packet::from_slice(HDR_BATTERY_STATE);
   let readings = &readings[..readings.len().min(3)];
   packet.push(readings.len() as u8);
   for r in readings {
      packet.extend_from_slice(&[r.component as u8, 0x01, r.level, r.status as u8, 0x01]);
   }
   packet
}

pub fn parse_noise_mode(data: &[u8]) -> Result<NoiseControlMode> {
   if !data.starts_with(HDR_NOISE_CTL) {
      return Err(ProtoError::WrongPacketType {
         expected: "noise control",
      });
   }
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }
   let mode = data[7];
   NoiseControlMode::from_repr(mode).ok_or(ProtoError::UnknownNoiseMode { mode })
}

pub fn parse_ear_detection(data: &[u8]) -> Result<EarPresence> {
   if !data.starts_with(HDR_EAR_DETECTION) {
      return Err(ProtoError::WrongPacketType {
         expected: "ear detection",
      });
   }
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }
   Ok(EarPresence::from_raw(data[6], data[7]))
}

pub fn parse_conversation_awareness(data: &[u8]) -> Result<ConversationAwareness> {
   if !data.starts_with(HDR_CONVERSATION) {
      return Err(ProtoError::WrongPacketType {
         expected: "conversation awareness",
      });
   }
   if data.len() < 10 {
      return Err(ProtoError::PacketTooShort {
         expected: 10,
         actual: data.len(),
      });
   }
   Ok(ConversationAwareness::from_byte(data[9]))
}

/// Strings advertised in the device information frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
   pub name: Option<SmolStr>,
   pub model: Option<SmolStr>,
   pub firmware: Option<SmolStr>,
}

/// Parses the device information frame: NUL-separated strings after a
/// 6-byte header, name first, then model number, then firmware revision.
pub fn parse_metadata(data: &[u8]) -> Result<Metadata> {
   if !data.starts_with(HDR_METADATA) {
      return Err(ProtoError::WrongPacketType {
         expected: "metadata",
      });
   }
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }

   let mut strings = data[6..]
      .split(|&b| b == 0)
      .filter_map(|chunk| str::from_utf8(chunk).ok())
      .map(str::trim)
      .filter(|text| text.len() > 2 && text.chars().all(|c| !c.is_control()))
      .filter(|text| text.chars().any(char::is_alphanumeric))
      .map(SmolStr::from);

   Ok(Metadata {
      name: strings.next(),
      model: strings.next(),
      firmware: strings.next(),
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   fn frame(header: &[u8], tail: &[u8]) -> Vec<u8> {
      let mut v = header.to_vec();
      v.extend_from_slice(tail);
      v
   }

   #[test]
   fn test_ear_detection_marker_asymmetry() {
      for b0 in 0u8..=4 {
         for b1 in 0u8..=4 {
            let data = frame(HDR_EAR_DETECTION, &[b0, b1]);
            let Some(DecodedFrame::EarDetection(ear)) = classify_and_decode(&data) else {
               panic!("ear frame not decoded: {data:02x?}");
            };
            let marker = matches!(b0, 2 | 3) || matches!(b1, 2 | 3);
            let expected = if marker {
               b0 == 0 || b1 == 0
            } else {
               b0 == 0 && b1 == 0
            };
            assert_eq!(ear.in_ear(), expected, "bytes {b0:02x} {b1:02x}");
            assert_eq!(ear.pair(), [b0 == 0, b1 == 0]);
         }
      }
   }

   #[test]
   fn test_noise_mode_transparency() {
      let data = frame(HDR_NOISE_CTL, &[0x03, 0x00, 0x00, 0x00]);
      assert_eq!(classify(&data), FrameKind::NoiseControl);
      assert_eq!(
         classify_and_decode(&data),
         Some(DecodedFrame::NoiseControl(NoiseControlMode::Transparency))
      );
   }

   #[test]
   fn test_noise_mode_out_of_range_dropped() {
      let data = frame(HDR_NOISE_CTL, &[0x07, 0x00, 0x00, 0x00]);
      assert_eq!(
         parse_noise_mode(&data),
         Err(ProtoError::UnknownNoiseMode { mode: 7 })
      );
      assert_eq!(classify_and_decode(&data), None);
   }

   #[test]
   fn test_battery_case_absent() {
      let data = frame(
         HDR_BATTERY_STATE,
         &[
            0x03, // count
            0x04, 0x01, 0x50, 0x02, 0x01, // left 80%
            0x02, 0x01, 0x4B, 0x01, 0x01, // right 75% charging
            0x08, 0x01, 0xFF, 0x04, 0x01, // case absent
         ],
      );
      let Some(DecodedFrame::Battery(battery)) = classify_and_decode(&data) else {
         panic!("battery frame not decoded");
      };
      assert_eq!(
         battery.readings(),
         &[
            BatteryReading::new(Component::Left, 80, BatteryStatus::NotCharging),
            BatteryReading::new(Component::Right, 75, BatteryStatus::Charging),
         ]
      );
   }

   #[test]
   fn test_battery_encode_decode() {
      let readings = [
         BatteryReading::new(Component::Left, 12, BatteryStatus::NotCharging),
         BatteryReading::new(Component::Right, 100, BatteryStatus::Charging),
         BatteryReading::new(Component::Case, 55, BatteryStatus::Disconnected),
      ];
      let packet = encode_battery_frame(&readings);
      assert_eq!(packet.len(), 22);
      assert_eq!(parse_battery_status(&packet).unwrap().readings(), &readings);
   }

   #[test]
   fn test_battery_size_mismatch() {
      let data = frame(HDR_BATTERY_STATE, &[0x02, 0x04, 0x01, 0x50, 0x02, 0x01]);
      assert_eq!(classify(&data), FrameKind::Unknown);
      assert_eq!(
         parse_battery_status(&data),
         Err(ProtoError::PacketSizeMismatch {
            expected: 17,
            actual: 12
         })
      );
      let data = frame(HDR_BATTERY_STATE, &[0x04]);
      assert_eq!(
         parse_battery_status(&data),
         Err(ProtoError::InvalidBatteryCount { count: 4 })
      );
   }

   #[test]
   fn test_conversation_awareness_codes() {
      let decode = |b: u8| match classify_and_decode(&frame(HDR_CONVERSATION, &[b])) {
         Some(DecodedFrame::ConversationAwareness(ca)) => ca,
         other => panic!("unexpected {other:?}"),
      };
      assert_eq!(decode(0x01), ConversationAwareness::SpeakingStarted(0x01));
      assert_eq!(decode(0x02), ConversationAwareness::SpeakingStarted(0x02));
      assert_eq!(decode(0x08), ConversationAwareness::SpeakingStopped(0x08));
      assert_eq!(decode(0x09), ConversationAwareness::SpeakingStopped(0x09));
      assert_eq!(decode(0x05), ConversationAwareness::Other(0x05));
   }

   #[test]
   fn test_priority_and_unknown() {
      // Noise control wins over the generic feature echo with the same header.
      let data = frame(HDR_CMD_CTL, &[0x0D, 0x02, 0x00, 0x00, 0x00]);
      assert_eq!(classify(&data), FrameKind::NoiseControl);

      let data = frame(HDR_CMD_CTL, &[0x28, 0x01, 0x00, 0x00, 0x00]);
      assert_eq!(
         classify_and_decode(&data),
         Some(DecodedFrame::Feature {
            feature: FeatureId::CONVERSATIONAL,
            enabled: true
         })
      );

      assert_eq!(classify_and_decode(&[]), None);
      assert_eq!(classify_and_decode(&[0x04, 0x00, 0x04]), None);
      assert_eq!(classify_and_decode(HDR_EAR_DETECTION), None);
      assert_eq!(classify_and_decode(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]), None);
   }

   #[test]
   fn test_metadata_strings() {
      let mut data = HDR_METADATA.to_vec();
      data.push(0x00);
      data.extend_from_slice(b"Jane's AirPods Pro\0A2084\x006F21\0");
      let meta = parse_metadata(&data).unwrap();
      assert_eq!(meta.name.as_deref(), Some("Jane's AirPods Pro"));
      assert_eq!(meta.model.as_deref(), Some("A2084"));
      assert_eq!(meta.firmware.as_deref(), Some("6F21"));
   }
}

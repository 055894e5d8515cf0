//! `AirPods` protocol definitions and data structures.
//!
//! This module contains the fixed AAP byte sequences, the typed values
//! carried by notification frames, and the encoders for every outbound
//! command the service knows how to send.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::{SmolStr, format_smolstr};

use crate::bluetooth::l2cap::Packet;

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// The three frames that open an AAP session, in send order.
pub const HANDSHAKE_SEQUENCE: [&[u8]; 3] = [PKT_HANDSHAKE, PKT_SET_FEATURES, PKT_REQUEST_NOTIFY];

// Notification headers
pub const HDR_BATTERY_STATE: &[u8] = b"\x04\x00\x04\x00\x04\x00";
pub const HDR_NOISE_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00\x0D";
pub const HDR_CMD_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00";
pub const HDR_EAR_DETECTION: &[u8] = b"\x04\x00\x04\x00\x06\x00";
pub const HDR_CONVERSATION: &[u8] = b"\x04\x00\x04\x00\x4B\x00\x02\x00\x01";
pub const HDR_METADATA: &[u8] = b"\x04\x00\x04\x00\x1d";
pub const HDR_RENAME: &[u8] = b"\x04\x00\x04\x00\x1a\x00\x01";

// ACK packet headers
pub const HDR_ACK_HANDSHAKE: &[u8] = b"\x01\x00\x04\x00";
pub const HDR_ACK_FEATURES: &[u8] = b"\x04\x00\x04\x00\x2b";

/// Tag prepended to frames forwarded to a relay peer.
pub const RELAY_DATA_HEADER: &[u8] = &[0x00, 0x04, 0x00, 0x01];

/// Battery level byte used by the firmware for a component it cannot see.
pub const BATTERY_LEVEL_ABSENT: u8 = 0xFF;

/// Represents different components of `AirPods`.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Component {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

impl Component {
   /// Position of the component in an ordered battery report.
   pub const fn order(self) -> u8 {
      match self {
         Self::Left => 0,
         Self::Right => 1,
         Self::Case => 2,
      }
   }
}

/// Charging state reported for a single component.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryStatus {
   Charging = 0x01,
   NotCharging = 0x02,
   Disconnected = 0x04,
   Unknown = 0xFF,
}

impl BatteryStatus {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }
}

/// Noise control modes supported by `AirPods`.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0x01,
   #[strum(serialize = "nc", serialize = "anc", serialize = "noise_cancellation")]
   NoiseCancellation = 0x02,
   #[strum(serialize = "trans", serialize = "transparency")]
   Transparency = 0x03,
   #[strum(serialize = "adapt", serialize = "adaptive")]
   Adaptive = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   pub const fn from_index(index: u8) -> Option<Self> {
      match index {
         1 => Some(Self::Off),
         2 => Some(Self::NoiseCancellation),
         3 => Some(Self::Transparency),
         4 => Some(Self::Adaptive),
         _ => None,
      }
   }

   pub fn packet(self) -> Packet {
      build_control_packet(FeatureId::NOISE_CONTROL, [self as u8, 0, 0, 0])
   }
}

/// One decoded battery slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryReading {
   pub component: Component,
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryReading {
   pub const fn new(component: Component, level: u8, status: BatteryStatus) -> Self {
      Self {
         component,
         level,
         status,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

/// Battery report for every component present in the last frame,
/// ordered left, right, case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Battery(heapless::Vec<BatteryReading, 3>);

impl Battery {
   /// Builds a report, dropping duplicates and restoring canonical order.
   pub fn from_readings(readings: impl IntoIterator<Item = BatteryReading>) -> Self {
      let mut out = heapless::Vec::<BatteryReading, 3>::new();
      for reading in readings {
         if out.iter().any(|r| r.component == reading.component) {
            continue;
         }
         // At most three distinct components exist.
         let _ = out.push(reading);
      }
      out.sort_unstable_by_key(|r| r.component.order());
      Self(out)
   }

   pub fn readings(&self) -> &[BatteryReading] {
      &self.0
   }

   pub fn get(&self, component: Component) -> Option<&BatteryReading> {
      self.0.iter().find(|r| r.component == component)
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }

   pub fn to_vec(&self) -> Vec<BatteryReading> {
      self.0.to_vec()
   }

   /// True when both buds are reported and both are on charge.
   pub fn buds_charging(&self) -> bool {
      matches!(
         (self.get(Component::Left), self.get(Component::Right)),
         (Some(l), Some(r)) if l.is_charging() && r.is_charging()
      )
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut out = serde_json::Map::new();
      for r in &self.0 {
         let name: &'static str = r.component.into();
         let status: &'static str = r.status.into();
         out.insert(
            name.to_owned(),
            json!({
                "level": u32::from(r.level),
                "status": status,
                "charging": r.is_charging(),
                "available": r.is_available(),
            }),
         );
      }
      serde_json::Value::Object(out)
   }
}

impl fmt::Display for Battery {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut first = true;
      for r in &self.0 {
         if !first {
            f.write_str(" ")?;
         }
         first = false;
         write!(f, "{}:{}%", r.component, r.level)?;
         if r.is_charging() {
            f.write_str("+")?;
         }
      }
      Ok(())
   }
}

/// Ear detection report.
///
/// The firmware sends one status byte per bud: `0x00` in ear, `0x01` out of
/// ear, `0x02` in case. A `0x02`/`0x03` byte also marks an accessory that
/// cannot detect presence on one side, which changes how the aggregate
/// "in ear" flag is derived (see [`EarPresence::in_ear`]).
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub struct EarPresence {
   raw: [u8; 2],
}

impl EarPresence {
   pub const IN_EAR: u8 = 0x00;
   pub const OUT_OF_EAR: u8 = 0x01;
   pub const IN_CASE: u8 = 0x02;

   pub const fn from_raw(left: u8, right: u8) -> Self {
      Self { raw: [left, right] }
   }

   pub const fn new(left_in_ear: bool, right_in_ear: bool) -> Self {
      const fn byte(in_ear: bool) -> u8 {
         if in_ear {
            EarPresence::IN_EAR
         } else {
            EarPresence::OUT_OF_EAR
         }
      }
      Self::from_raw(byte(left_in_ear), byte(right_in_ear))
   }

   pub const fn raw(&self) -> [u8; 2] {
      self.raw
   }

   pub const fn is_left_in_ear(&self) -> bool {
      self.raw[0] == Self::IN_EAR
   }

   pub const fn is_right_in_ear(&self) -> bool {
      self.raw[1] == Self::IN_EAR
   }

   pub const fn pair(&self) -> [bool; 2] {
      [self.is_left_in_ear(), self.is_right_in_ear()]
   }

   /// Presence pair with orientation discarded.
   pub const fn sorted(&self) -> [bool; 2] {
      let [l, r] = self.pair();
      if l && !r { [r, l] } else { [l, r] }
   }

   pub const fn any_in_ear(&self) -> bool {
      self.is_left_in_ear() || self.is_right_in_ear()
   }

   pub const fn both_in_ear(&self) -> bool {
      self.is_left_in_ear() && self.is_right_in_ear()
   }

   pub const fn none_in_ear(&self) -> bool {
      !self.any_in_ear()
   }

   /// Set when either byte carries the single-accessory marker.
   pub const fn single_bud_fallback(&self) -> bool {
      matches!(self.raw[0], 0x02 | 0x03) || matches!(self.raw[1], 0x02 | 0x03)
   }

   /// Aggregate presence: OR semantics on single-accessory reports,
   /// AND semantics otherwise.
   pub const fn in_ear(&self) -> bool {
      if self.single_bud_fallback() {
         self.any_in_ear()
      } else {
         self.both_in_ear()
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_in_ear": self.is_left_in_ear(),
          "right_in_ear": self.is_right_in_ear(),
          "in_ear": self.in_ear(),
      })
   }
}

/// Conversation awareness notification value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationAwareness {
   Idle,
   /// `0x01` or `0x02`: the wearer started speaking.
   SpeakingStarted(u8),
   /// `0x08` or `0x09`: the wearer stopped speaking.
   SpeakingStopped(u8),
   Other(u8),
}

impl ConversationAwareness {
   pub const fn from_byte(b: u8) -> Self {
      match b {
         0x00 => Self::Idle,
         0x01 | 0x02 => Self::SpeakingStarted(b),
         0x08 | 0x09 => Self::SpeakingStopped(b),
         _ => Self::Other(b),
      }
   }

   pub const fn code(self) -> u8 {
      match self {
         Self::Idle => 0x00,
         Self::SpeakingStarted(b) | Self::SpeakingStopped(b) | Self::Other(b) => b,
      }
   }

   pub const fn to_str(self) -> &'static str {
      match self {
         Self::Idle => "idle",
         Self::SpeakingStarted(_) => "speaking",
         Self::SpeakingStopped(_) => "stopped_speaking",
         Self::Other(_) => "other",
      }
   }
}

/// Control-command identifier carried in byte 6 of a `04 00 04 00 09 00` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FeatureId(u8);

/// Known control identifiers, sorted by id.
pub const KNOWN_FEATURES: &[(u8, &str)] = &[
   (FeatureId::NOISE_CONTROL.id(), "noise_control"),
   (FeatureId::PRESS_SPEED.id(), "press_speed"),
   (FeatureId::PRESS_HOLD_DURATION.id(), "press_hold_duration"),
   (FeatureId::LISTENING_MODE_CONFIGS.id(), "listening_mode_configs"),
   (FeatureId::ONE_BUD_ANC.id(), "one_bud_anc"),
   (FeatureId::TONE_VOLUME.id(), "tone_volume"),
   (FeatureId::VOLUME_INTERVAL.id(), "volume_interval"),
   (FeatureId::VOLUME_SWIPE.id(), "volume_swipe"),
   (FeatureId::ADAPTIVE_VOLUME.id(), "adaptive_volume"),
   (FeatureId::CONVERSATIONAL.id(), "conversational"),
   (FeatureId::ADAPTIVE_STRENGTH.id(), "adaptive_strength"),
   (FeatureId::HEARING_ASSIST.id(), "hearing_assist"),
   (FeatureId::ALLOW_OFF.id(), "allow_off"),
];

impl FeatureId {
   pub const NOISE_CONTROL: Self = Self(0x0D);
   pub const PRESS_SPEED: Self = Self(0x17);
   pub const PRESS_HOLD_DURATION: Self = Self(0x18);
   pub const LISTENING_MODE_CONFIGS: Self = Self(0x1A);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const TONE_VOLUME: Self = Self(0x1F);
   pub const VOLUME_INTERVAL: Self = Self(0x23);
   pub const VOLUME_SWIPE: Self = Self(0x25);
   pub const ADAPTIVE_VOLUME: Self = Self(0x26);
   pub const CONVERSATIONAL: Self = Self(0x28);
   pub const ADAPTIVE_STRENGTH: Self = Self(0x2E);
   pub const HEARING_ASSIST: Self = Self(0x33);
   pub const ALLOW_OFF: Self = Self(0x34);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   /// Word index and bit mask inside a 256-bit feature set.
   pub const fn bitpos(self) -> (usize, u64) {
      let idx = self.0 as usize >> 6;
      let mask = 1 << (self.0 as usize & 0x3f);
      (idx, mask)
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      let i = KNOWN_FEATURES
         .binary_search_by_key(&self.0, |(repr, _)| *repr)
         .ok()?;
      Some(KNOWN_FEATURES[i].1)
   }

   pub fn parse(s: &str) -> Option<Self> {
      if let Some((repr, _)) = KNOWN_FEATURES
         .iter()
         .find(|(_, name)| name.eq_ignore_ascii_case(s))
      {
         return Some(Self(*repr));
      }
      let hex = s.strip_prefix("0x").unwrap_or(s);
      u8::from_str_radix(hex, 16).ok().map(Self)
   }

   pub fn name(self) -> SmolStr {
      match self.try_to_str() {
         Some(name) => SmolStr::new_static(name),
         None => format_smolstr!("{:02x}", self.0),
      }
   }
}

impl fmt::Display for FeatureId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.try_to_str() {
         Some(name) => f.write_str(name),
         None => write!(f, "{:02x}", self.0),
      }
   }
}

/// Builds a control packet for sending commands to `AirPods`.
pub fn build_control_packet(feature: FeatureId, data: [u8; 4]) -> Packet {
   HDR_CMD_CTL
      .iter()
      .copied()
      .chain([feature.id()])
      .chain(data)
      .collect()
}

/// Value word of a boolean control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FeatureCmd {
   Query = 0,
   Enable = 1,
   Disable = 2,
}

impl FeatureCmd {
   pub const fn from_bool(enabled: bool) -> Self {
      if enabled { Self::Enable } else { Self::Disable }
   }

   pub fn build(self, feature: FeatureId) -> Packet {
      build_control_packet(feature, (self as u32).to_le_bytes())
   }

   /// Parses a control-command echo. Only the three boolean words match.
   pub fn parse(data: &[u8]) -> Option<(FeatureId, Self)> {
      let rest = data.strip_prefix(HDR_CMD_CTL)?;
      let (feature, rest) = rest.split_first()?;
      let word = u32::from_le_bytes(rest.try_into().ok()?);
      let cmd = match word {
         0 => Self::Query,
         1 => Self::Enable,
         2 => Self::Disable,
         _ => return None,
      };
      Some((FeatureId::from_id(*feature), cmd))
   }
}

/// Control packet carrying a single byte value (speeds, strengths).
pub fn value_packet(feature: FeatureId, value: u8) -> Packet {
   build_control_packet(feature, [value, 0, 0, 0])
}

pub fn conversation_awareness_packet(enabled: bool) -> Packet {
   FeatureCmd::from_bool(enabled).build(FeatureId::CONVERSATIONAL)
}

pub fn off_listening_mode_packet(enabled: bool) -> Packet {
   FeatureCmd::from_bool(enabled).build(FeatureId::ALLOW_OFF)
}

pub fn tone_volume_packet(volume: u8) -> Packet {
   build_control_packet(FeatureId::TONE_VOLUME, [volume, 0x50, 0, 0])
}

/// Frames toggling personalized volume: the control toggle followed by the
/// configuration blob the accessory expects alongside it.
pub fn personalized_volume_packets(enabled: bool) -> [Packet; 2] {
   let toggle = FeatureCmd::from_bool(enabled).build(FeatureId::ADAPTIVE_VOLUME);
   let config = Packet::from_slice(&[
      0x04,
      0x00,
      0x04,
      0x00,
      0x17,
      0x00,
      0x00,
      0x00,
      0x10,
      0x00,
      0x12,
      0x00,
      0x08,
      if enabled { 0xE6 } else { 0xE5 },
      0x05,
      0x10,
      0x02,
      0x42,
      0x0B,
      0x08,
      0x50,
      0x10,
      0x02,
      0x1A,
      0x05,
      0x02,
      if enabled { 0x32 } else { 0x00 },
      0x00,
      0x00,
      0x00,
   ]);
   [toggle, config]
}

pub fn loud_sound_reduction_packet(enabled: bool) -> Packet {
   Packet::from_slice(&[0x52, 0x1B, 0x00, u8::from(enabled)])
}

/// Builds the rename frame. Returns `None` for names the length byte cannot carry.
pub fn rename_packet(name: &str) -> Option<Packet> {
   let bytes = name.as_bytes();
   let len = u8::try_from(bytes.len()).ok()?;
   let mut packet = Packet::from_slice(HDR_RENAME);
   packet.push(len);
   packet.push(0x00);
   packet.extend_from_slice(bytes);
   Some(packet)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_noise_mode_packets() {
      assert_eq!(
         NoiseControlMode::Transparency.packet().as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x03, 0x00, 0x00, 0x00]
      );
      assert_eq!(NoiseControlMode::from_index(1), Some(NoiseControlMode::Off));
      assert_eq!(NoiseControlMode::from_index(5), None);
      assert_eq!(
         "anc".parse::<NoiseControlMode>().ok(),
         Some(NoiseControlMode::NoiseCancellation)
      );
   }

   #[test]
   fn test_feature_toggle_roundtrip() {
      let packet = conversation_awareness_packet(false);
      assert_eq!(
         packet.as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x02, 0x00, 0x00, 0x00]
      );
      assert_eq!(
         FeatureCmd::parse(&packet),
         Some((FeatureId::CONVERSATIONAL, FeatureCmd::Disable))
      );
      assert_eq!(FeatureCmd::parse(&packet[..10]), None);
   }

   #[test]
   fn test_known_features_sorted() {
      assert!(KNOWN_FEATURES.windows(2).all(|w| w[0].0 < w[1].0));
      assert_eq!(FeatureId::parse("ALLOW_OFF"), Some(FeatureId::ALLOW_OFF));
      assert_eq!(FeatureId::parse("0x2e"), Some(FeatureId::ADAPTIVE_STRENGTH));
      assert_eq!(FeatureId::from_id(0x99).name(), "99");
   }

   #[test]
   fn test_ear_presence_fallback() {
      let normal = EarPresence::from_raw(0x00, 0x01);
      assert!(!normal.single_bud_fallback());
      assert!(!normal.in_ear());

      let single = EarPresence::from_raw(0x00, 0x02);
      assert!(single.single_bud_fallback());
      assert!(single.in_ear());

      assert_eq!(EarPresence::new(true, false).sorted(), [false, true]);
      assert_eq!(EarPresence::new(false, true).sorted(), [false, true]);
   }

   #[test]
   fn test_rename_packet() {
      let packet = rename_packet("Pods").unwrap();
      assert_eq!(&packet[..7], HDR_RENAME);
      assert_eq!(packet[7], 4);
      assert_eq!(&packet[9..], b"Pods");
      assert!(rename_packet(&"x".repeat(300)).is_none());
   }

   #[test]
   fn test_battery_ordering() {
      let battery = Battery::from_readings([
         BatteryReading::new(Component::Case, 90, BatteryStatus::Charging),
         BatteryReading::new(Component::Right, 40, BatteryStatus::NotCharging),
         BatteryReading::new(Component::Left, 50, BatteryStatus::NotCharging),
      ]);
      let order: Vec<_> = battery.readings().iter().map(|r| r.component).collect();
      assert_eq!(order, [Component::Left, Component::Right, Component::Case]);
      assert!(!battery.buds_charging());
   }
}

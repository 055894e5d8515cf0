//! Last-known decoded state of a device.
//!
//! The store owns a single [`DeviceState`] and publishes every change as a new
//! immutable snapshot. Readers clone the current `Arc` and never observe a
//! half-applied frame; the packet processor is the only logical writer.

use std::{collections::BTreeMap, sync::Arc};

use log::debug;
use parking_lot::RwLock;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   airpods::{
      parser::{DecodedFrame, Metadata},
      protocol::{
         Battery, BatteryReading, BatteryStatus, ConversationAwareness, EarPresence, FeatureId,
         NoiseControlMode,
      },
   },
   event::AirPodsEvent,
};

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   /// Replaces `dst` with `new` and reports what happened.
   fn apply(dst: &mut Option<T>, new: Option<T>) -> Self
   where
      T: Clone,
   {
      let prev = std::mem::replace(dst, new.clone());
      Self::new(prev, new)
   }

   fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

/// Control features seen on the link and their last known toggle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
   enabled: [u64; 256 / 64],
   seen: [u64; 256 / 64],
}

impl FeatureSet {
   pub fn is_enabled(&self, feature: FeatureId) -> bool {
      let (idx, mask) = feature.bitpos();
      self.enabled[idx] & mask != 0
   }

   pub fn is_seen(&self, feature: FeatureId) -> bool {
      let (idx, mask) = feature.bitpos();
      self.seen[idx] & mask != 0
   }

   /// Records a toggle. Returns true if the visible state changed.
   pub fn set(&mut self, feature: FeatureId, enabled: bool) -> bool {
      let before = (self.is_seen(feature), self.is_enabled(feature));
      let (idx, mask) = feature.bitpos();
      self.seen[idx] |= mask;
      if enabled {
         self.enabled[idx] |= mask;
      } else {
         self.enabled[idx] &= !mask;
      }
      before != (true, enabled)
   }

   pub fn iter(&self) -> impl Iterator<Item = (FeatureId, bool)> + '_ {
      (0..=u8::MAX)
         .map(FeatureId::from_id)
         .filter(|f| self.is_seen(*f))
         .map(|f| (f, self.is_enabled(f)))
   }
}

/// Immutable snapshot of everything decoded from a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
   pub name: SmolStr,
   pub model: Option<SmolStr>,
   pub firmware: Option<SmolStr>,
   pub battery: Option<Battery>,
   pub noise_mode: Option<NoiseControlMode>,
   pub ear: Option<EarPresence>,
   pub conversation: Option<ConversationAwareness>,
   pub features: FeatureSet,
}

impl DeviceState {
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "name": self.name.as_str(),
      });
      if let Some(model) = &self.model {
         info["model"] = json!(model.as_str());
      }
      if let Some(firmware) = &self.firmware {
         info["firmware"] = json!(firmware.as_str());
      }
      if let Some(battery) = &self.battery {
         info["battery"] = battery.to_json();
      }
      if let Some(mode) = self.noise_mode {
         info["noise_mode"] = json!(mode.to_str());
      }
      if let Some(ear) = self.ear {
         info["ear_detection"] = ear.to_json();
      }
      if let Some(ca) = self.conversation {
         info["conversation_awareness"] = json!(ca.to_str());
      }
      let features: BTreeMap<_, _> = self.features.iter().map(|(k, v)| (k.name(), v)).collect();
      info["features"] = json!(features);
      info
   }
}

/// Merges a fresh battery report into the previous one. Components the
/// firmware reports as disconnected keep their last known level.
fn merge_battery(prev: Option<&Battery>, next: &Battery) -> Battery {
   Battery::from_readings(next.readings().iter().map(|r| {
      match prev.and_then(|p| p.get(r.component)) {
         Some(old) if r.status == BatteryStatus::Disconnected => {
            BatteryReading::new(r.component, old.level, r.status)
         },
         _ => *r,
      }
   }))
}

/// Shared owner of a device's decoded state.
#[derive(Debug, Default)]
pub struct StateStore {
   current: RwLock<Arc<DeviceState>>,
}

impl StateStore {
   pub fn new(name: impl Into<SmolStr>) -> Self {
      Self {
         current: RwLock::new(Arc::new(DeviceState {
            name: name.into(),
            ..Default::default()
         })),
      }
   }

   /// Current snapshot.
   pub fn snapshot(&self) -> Arc<DeviceState> {
      self.current.read().clone()
   }

   /// Applies `f` to a copy of the state and publishes it.
   pub fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
      let mut guard = self.current.write();
      let mut next = DeviceState::clone(&guard);
      let r = f(&mut next);
      if next != **guard {
         *guard = Arc::new(next);
      }
      r
   }

   pub fn set_noise_mode(&self, mode: NoiseControlMode) -> UpdateOp<NoiseControlMode> {
      self.update(|s| UpdateOp::apply(&mut s.noise_mode, Some(mode)))
   }

   pub fn set_feature(&self, feature: FeatureId, enabled: bool) -> bool {
      self.update(|s| s.features.set(feature, enabled))
   }

   pub fn set_name(&self, name: SmolStr) -> bool {
      self.update(|s| {
         if s.name == name {
            false
         } else {
            s.name = name;
            true
         }
      })
   }

   /// Forgets readings that only describe a live session. A new link then
   /// reports the first ear and conversation frames even if they repeat the
   /// previous session's values.
   pub fn begin_session(&self) {
      self.update(|s| {
         s.ear = None;
         s.conversation = None;
      });
   }

   fn apply_metadata(&self, meta: &Metadata) -> Option<AirPodsEvent> {
      self.update(|s| {
         if meta.model.is_some() {
            s.model.clone_from(&meta.model);
         }
         if meta.firmware.is_some() {
            s.firmware.clone_from(&meta.firmware);
         }
         match &meta.name {
            Some(name) if *name != s.name => {
               s.name = name.clone();
               Some(AirPodsEvent::DeviceNameChanged(name.clone()))
            },
            _ => None,
         }
      })
   }

   /// Applies a decoded frame, returning the event to publish if anything
   /// observable changed.
   pub fn apply(&self, frame: &DecodedFrame) -> Option<AirPodsEvent> {
      match frame {
         DecodedFrame::Battery(battery) => self.update(|s| {
            let merged = merge_battery(s.battery.as_ref(), battery);
            debug!("Battery: {merged}");
            UpdateOp::apply(&mut s.battery, Some(merged.clone()))
               .is_updated()
               .then_some(AirPodsEvent::BatteryUpdated(merged))
         }),
         DecodedFrame::NoiseControl(mode) => self
            .set_noise_mode(*mode)
            .is_updated()
            .then_some(AirPodsEvent::NoiseControlChanged(*mode)),
         DecodedFrame::EarDetection(ear) => self
            .update(|s| UpdateOp::apply(&mut s.ear, Some(*ear)))
            .is_updated()
            .then_some(AirPodsEvent::EarDetectionChanged(*ear)),
         DecodedFrame::ConversationAwareness(ca) => self
            .update(|s| UpdateOp::apply(&mut s.conversation, Some(*ca)))
            .is_updated()
            .then_some(AirPodsEvent::ConversationAwarenessChanged(*ca)),
         DecodedFrame::Metadata(meta) => self.apply_metadata(meta),
         DecodedFrame::Feature { feature, enabled } => {
            self.set_feature(*feature, *enabled);
            None
         },
         DecodedFrame::HandshakeAck | DecodedFrame::FeaturesAck => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::protocol::Component;

   fn battery(readings: &[(Component, u8, BatteryStatus)]) -> Battery {
      Battery::from_readings(
         readings
            .iter()
            .map(|&(c, l, s)| BatteryReading::new(c, l, s)),
      )
   }

   #[test]
   fn test_snapshot_is_immutable() {
      let store = StateStore::new("Pods");
      let before = store.snapshot();
      let ev = store.apply(&DecodedFrame::NoiseControl(NoiseControlMode::Adaptive));
      assert!(matches!(
         ev,
         Some(AirPodsEvent::NoiseControlChanged(NoiseControlMode::Adaptive))
      ));
      assert_eq!(before.noise_mode, None);
      assert_eq!(store.snapshot().noise_mode, Some(NoiseControlMode::Adaptive));
   }

   #[test]
   fn test_repeated_frame_emits_once() {
      let store = StateStore::new("Pods");
      let ear = EarPresence::new(true, false);
      assert!(store.apply(&DecodedFrame::EarDetection(ear)).is_some());
      let snap = store.snapshot();
      assert!(store.apply(&DecodedFrame::EarDetection(ear)).is_none());
      assert!(Arc::ptr_eq(&snap, &store.snapshot()));
   }

   #[test]
   fn test_new_session_reports_repeated_ear_frame() {
      let store = StateStore::new("Pods");
      let in_case = EarPresence::from_raw(0x02, 0x02);
      store.apply(&DecodedFrame::EarDetection(in_case));
      store.apply(&DecodedFrame::NoiseControl(NoiseControlMode::Off));
      assert!(store.apply(&DecodedFrame::EarDetection(in_case)).is_none());

      store.begin_session();
      assert_eq!(store.snapshot().ear, None);
      assert_eq!(store.snapshot().noise_mode, Some(NoiseControlMode::Off));
      assert_eq!(
         store.apply(&DecodedFrame::EarDetection(in_case)),
         Some(AirPodsEvent::EarDetectionChanged(in_case))
      );
   }

   #[test]
   fn test_disconnected_component_keeps_level() {
      let store = StateStore::new("Pods");
      store.apply(&DecodedFrame::Battery(battery(&[
         (Component::Left, 70, BatteryStatus::NotCharging),
         (Component::Right, 65, BatteryStatus::NotCharging),
      ])));
      store.apply(&DecodedFrame::Battery(battery(&[
         (Component::Left, 69, BatteryStatus::NotCharging),
         (Component::Right, 0, BatteryStatus::Disconnected),
      ])));
      let snap = store.snapshot();
      let right = snap.battery.as_ref().unwrap().get(Component::Right).unwrap();
      assert_eq!(right.level, 65);
      assert_eq!(right.status, BatteryStatus::Disconnected);
   }

   #[test]
   fn test_metadata_renames() {
      let store = StateStore::new("Old");
      let meta = Metadata {
         name: Some("New".into()),
         model: Some("A2084".into()),
         firmware: None,
      };
      assert!(matches!(
         store.apply(&DecodedFrame::Metadata(meta.clone())),
         Some(AirPodsEvent::DeviceNameChanged(n)) if n == "New"
      ));
      assert!(store.apply(&DecodedFrame::Metadata(meta)).is_none());
      assert_eq!(store.snapshot().model.as_deref(), Some("A2084"));
   }

   #[test]
   fn test_feature_set() {
      let mut set = FeatureSet::default();
      assert!(set.set(FeatureId::ONE_BUD_ANC, false));
      assert!(!set.set(FeatureId::ONE_BUD_ANC, false));
      assert!(set.set(FeatureId::ONE_BUD_ANC, true));
      assert_eq!(set.iter().collect::<Vec<_>>(), [(FeatureId::ONE_BUD_ANC, true)]);
      assert!(!set.is_seen(FeatureId::ALLOW_OFF));
   }
}

//! Long-press listening-mode cycle configuration.
//!
//! The stem long-press cycles through a configurable subset of the four
//! listening modes. The accessory is configured with a single
//! `LISTENING_MODE_CONFIGS` control packet carrying a mode mask, but the
//! firmware only honours a fixed set of transitions. [`resolve_toggle_command`]
//! maps a one-toggle change onto that set with a lookup table.

use thiserror::Error;

use crate::{
   airpods::protocol::{FeatureId, build_control_packet},
   bluetooth::l2cap::Packet,
};

/// Index of a toggle in a [`LongPressToggles`] vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum ToggleIndex {
   Off = 0,
   Anc = 1,
   Transparency = 2,
   Adaptive = 3,
}

impl ToggleIndex {
   pub const ALL: [Self; 4] = [Self::Off, Self::Anc, Self::Transparency, Self::Adaptive];

   pub const fn bit(self) -> u8 {
      1 << self as u8
   }
}

/// Enabled state of the four long-press modes, indexed by [`ToggleIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LongPressToggles(pub [bool; 4]);

impl LongPressToggles {
   pub const fn new(off: bool, anc: bool, transparency: bool, adaptive: bool) -> Self {
      Self([off, anc, transparency, adaptive])
   }

   pub fn from_mask(mask: u8) -> Self {
      Self(ToggleIndex::ALL.map(|i| mask & i.bit() != 0))
   }

   pub fn mask(&self) -> u8 {
      ToggleIndex::ALL
         .iter()
         .filter(|i| self.get(**i))
         .fold(0, |acc, i| acc | i.bit())
   }

   pub const fn get(&self, index: ToggleIndex) -> bool {
      self.0[index as usize]
   }
}

/// Caller errors for [`resolve_toggle_command`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleError {
   #[error("Long-press toggles unchanged")]
   Unchanged,

   #[error("Long-press toggles changed at {count} positions, expected exactly one")]
   MultipleChanges { count: usize },
}

macro_rules! long_press_commands {
   ($($name:ident => $mask:literal),+ $(,)?) => {
      /// Listening-mode configuration commands understood by the firmware.
      #[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::EnumIter)]
      #[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
      pub enum LongPressCommand {
         $($name),+
      }

      impl LongPressCommand {
         /// Mode mask written into the configuration packet.
         pub const fn mask(self) -> u8 {
            match self {
               $(Self::$name => $mask),+
            }
         }
      }
   };
}

// Mask bits: Off 0x01, ANC 0x02, Transparency 0x04, Adaptive 0x08.
long_press_commands! {
   EnableEverything => 0x0F,
   EnableOffFromTransparencyAndAnc => 0x07,
   EnableOffFromAdaptiveAndAnc => 0x0B,
   EnableOffFromTransparencyAndAdaptive => 0x0D,
   DisableOffFromEverything => 0x0E,
   DisableOffFromTransparencyAndAnc => 0x06,
   DisableOffFromAdaptiveAndAnc => 0x0A,
   DisableOffFromTransparencyAndAdaptive => 0x0C,
   EnableAncFromOffAndTransparency => 0x07,
   EnableAncFromOffAndAdaptive => 0x0B,
   DisableAncFromEverything => 0x0D,
   DisableAncFromOffAndTransparency => 0x05,
   DisableAncFromOffAndAdaptive => 0x09,
   EnableTransparencyFromOffAndAnc => 0x07,
   EnableTransparencyFromOffAndAdaptive => 0x0D,
   EnableTransparencyFromAdaptiveAndAnc => 0x0E,
   DisableTransparencyFromEverything => 0x0B,
   DisableTransparencyFromOffAndAnc => 0x03,
   DisableTransparencyFromOffAndAdaptive => 0x09,
   DisableTransparencyFromAdaptiveAndAnc => 0x0A,
   EnableAdaptiveFromOffAndAnc => 0x0B,
   EnableAdaptiveFromOffAndTransparency => 0x0D,
   EnableAdaptiveFromTransparencyAndAnc => 0x0E,
   DisableAdaptiveFromEverything => 0x07,
   DisableAdaptiveFromOffAndAnc => 0x03,
   DisableAdaptiveFromOffAndTransparency => 0x05,
   DisableAdaptiveFromTransparencyAndAnc => 0x06,
   EnableEverythingOffDisabled => 0x0E,
   DisableAncOffDisabled => 0x0C,
   DisableTransparencyOffDisabled => 0x0A,
   DisableAdaptiveOffDisabled => 0x06,
}

impl LongPressCommand {
   pub fn name(self) -> &'static str {
      self.into()
   }

   pub fn packet(self) -> Packet {
      build_control_packet(FeatureId::LISTENING_MODE_CONFIGS, [self.mask(), 0, 0, 0])
   }
}

const OFF: u8 = ToggleIndex::Off.bit();
const ANC: u8 = ToggleIndex::Anc.bit();
const TRANS: u8 = ToggleIndex::Transparency.bit();
const ADAPT: u8 = ToggleIndex::Adaptive.bit();

/// `(changed, enabled, old mask of the other three, command)`.
type Row = (ToggleIndex, bool, u8, LongPressCommand);

/// Transitions with off listening mode available. Combinations missing here
/// have no firmware command.
#[rustfmt::skip]
const FULL_TABLE: &[Row] = {
   use LongPressCommand::*;
   use ToggleIndex::*;
   &[
      (Off, true, ANC | TRANS | ADAPT, EnableEverything),
      (Off, true, ANC | TRANS, EnableOffFromTransparencyAndAnc),
      (Off, true, ANC | ADAPT, EnableOffFromAdaptiveAndAnc),
      (Off, true, TRANS | ADAPT, EnableOffFromTransparencyAndAdaptive),
      (Off, false, ANC | TRANS | ADAPT, DisableOffFromEverything),
      (Off, false, ANC | TRANS, DisableOffFromTransparencyAndAnc),
      (Off, false, ANC | ADAPT, DisableOffFromAdaptiveAndAnc),
      (Off, false, TRANS | ADAPT, DisableOffFromTransparencyAndAdaptive),

      (Anc, true, OFF | TRANS | ADAPT, EnableEverything),
      (Anc, true, OFF | TRANS, EnableAncFromOffAndTransparency),
      (Anc, true, OFF | ADAPT, EnableAncFromOffAndAdaptive),
      // The firmware reuses the Off commands for this pair.
      (Anc, true, TRANS | ADAPT, EnableOffFromTransparencyAndAdaptive),
      (Anc, false, OFF | TRANS | ADAPT, DisableAncFromEverything),
      (Anc, false, OFF | TRANS, DisableAncFromOffAndTransparency),
      (Anc, false, OFF | ADAPT, DisableAncFromOffAndAdaptive),
      (Anc, false, TRANS | ADAPT, DisableOffFromTransparencyAndAdaptive),

      (Transparency, true, OFF | ANC | ADAPT, EnableEverything),
      (Transparency, true, OFF | ANC, EnableTransparencyFromOffAndAnc),
      (Transparency, true, OFF | ADAPT, EnableTransparencyFromOffAndAdaptive),
      (Transparency, true, ANC | ADAPT, EnableTransparencyFromAdaptiveAndAnc),
      (Transparency, false, OFF | ANC | ADAPT, DisableTransparencyFromEverything),
      (Transparency, false, OFF | ANC, DisableTransparencyFromOffAndAnc),
      (Transparency, false, OFF | ADAPT, DisableTransparencyFromOffAndAdaptive),
      (Transparency, false, ANC | ADAPT, DisableTransparencyFromAdaptiveAndAnc),

      (Adaptive, true, OFF | ANC | TRANS, EnableEverything),
      (Adaptive, true, OFF | ANC, EnableAdaptiveFromOffAndAnc),
      (Adaptive, true, OFF | TRANS, EnableAdaptiveFromOffAndTransparency),
      (Adaptive, true, ANC | TRANS, EnableAdaptiveFromTransparencyAndAnc),
      (Adaptive, false, OFF | ANC | TRANS, DisableAdaptiveFromEverything),
      (Adaptive, false, OFF | ANC, DisableAdaptiveFromOffAndAnc),
      (Adaptive, false, OFF | TRANS, DisableAdaptiveFromOffAndTransparency),
      (Adaptive, false, ANC | TRANS, DisableAdaptiveFromTransparencyAndAnc),
   ]
};

/// Transitions when the accessory has no off listening mode. Off is not
/// selectable, so only the changed mode and its direction matter.
const OFF_DISABLED_TABLE: &[(ToggleIndex, bool, LongPressCommand)] = {
   use LongPressCommand::*;
   use ToggleIndex::*;
   &[
      (Anc, true, EnableEverythingOffDisabled),
      (Anc, false, DisableAncOffDisabled),
      (Transparency, true, EnableEverythingOffDisabled),
      (Transparency, false, DisableTransparencyOffDisabled),
      (Adaptive, true, EnableEverythingOffDisabled),
      (Adaptive, false, DisableAdaptiveOffDisabled),
   ]
};

/// Picks the firmware command that moves the long-press cycle from `old` to
/// `new`.
///
/// `old` and `new` must differ in exactly one position. `Ok(None)` means the
/// firmware has no command for the transition and nothing should be sent.
pub fn resolve_toggle_command(
   old: LongPressToggles,
   new: LongPressToggles,
   off_listening_mode: bool,
) -> Result<Option<LongPressCommand>, ToggleError> {
   let changed = (old.mask() ^ new.mask()).count_ones() as usize;
   let index = match changed {
      0 => return Err(ToggleError::Unchanged),
      1 => ToggleIndex::ALL
         .into_iter()
         .find(|i| old.get(*i) != new.get(*i))
         .ok_or(ToggleError::Unchanged)?,
      count => return Err(ToggleError::MultipleChanges { count }),
   };
   let enabled = new.get(index);

   let command = if off_listening_mode {
      let others = old.mask() & !index.bit();
      FULL_TABLE
         .iter()
         .find(|(i, e, mask, _)| *i == index && *e == enabled && *mask == others)
         .map(|row| row.3)
   } else {
      OFF_DISABLED_TABLE
         .iter()
         .find(|(i, e, _)| *i == index && *e == enabled)
         .map(|row| row.2)
   };
   Ok(command)
}

#[cfg(test)]
mod tests {
   use super::*;
   use LongPressCommand::*;
   use strum::IntoEnumIterator;

   const F: bool = false;
   const T: bool = true;

   fn resolve(old: [bool; 4], new: [bool; 4], flag: bool) -> Option<LongPressCommand> {
      resolve_toggle_command(LongPressToggles(old), LongPressToggles(new), flag).unwrap()
   }

   #[test]
   fn test_enable_adaptive_with_anc_and_transparency() {
      assert_eq!(
         resolve([F, T, T, F], [F, T, T, T], false),
         Some(EnableEverythingOffDisabled)
      );
      assert_eq!(
         resolve([F, T, T, F], [F, T, T, T], true),
         Some(EnableAdaptiveFromTransparencyAndAnc)
      );
      assert_eq!(resolve([T, T, T, F], [T, T, T, T], true), Some(EnableEverything));
   }

   #[test]
   fn test_precondition_violations() {
      let a = LongPressToggles::new(F, T, T, F);
      assert_eq!(resolve_toggle_command(a, a, true), Err(ToggleError::Unchanged));
      assert_eq!(
         resolve_toggle_command(a, LongPressToggles::new(T, F, T, F), true),
         Err(ToggleError::MultipleChanges { count: 2 })
      );
   }

   #[test]
   fn test_no_command_with_fewer_than_two_others() {
      assert_eq!(resolve([F, F, F, F], [T, F, F, F], true), None);
      assert_eq!(resolve([F, T, F, F], [F, T, T, F], true), None);
      assert_eq!(resolve([T, F, F, T], [T, F, F, F], true), None);
   }

   #[test]
   fn test_anc_reuses_off_commands() {
      assert_eq!(
         resolve([F, F, T, T], [F, T, T, T], true),
         Some(EnableOffFromTransparencyAndAdaptive)
      );
      assert_eq!(
         resolve([F, T, T, T], [F, F, T, T], true),
         Some(DisableOffFromTransparencyAndAdaptive)
      );
   }

   #[test]
   fn test_off_disabled_table() {
      assert_eq!(resolve([F, T, T, T], [T, T, T, T], false), None);
      assert_eq!(resolve([F, T, T, T], [F, F, T, T], false), Some(DisableAncOffDisabled));
      assert_eq!(
         resolve([F, T, T, T], [F, T, F, T], false),
         Some(DisableTransparencyOffDisabled)
      );
      assert_eq!(
         resolve([F, T, T, T], [F, T, T, F], false),
         Some(DisableAdaptiveOffDisabled)
      );
      assert_eq!(resolve([F, F, F, F], [F, T, F, F], false), Some(EnableEverythingOffDisabled));
   }

   #[test]
   fn test_full_table_exhaustive() {
      let mut mapped = 0;
      for old_mask in 0u8..16 {
         for index in ToggleIndex::ALL {
            let old = LongPressToggles::from_mask(old_mask);
            let new = LongPressToggles::from_mask(old_mask ^ index.bit());
            let first = resolve_toggle_command(old, new, true).unwrap();
            assert_eq!(first, resolve_toggle_command(old, new, true).unwrap());
            let others = (old_mask & !index.bit()).count_ones();
            assert_eq!(first.is_some(), others >= 2, "{old:?} -> {new:?}");
            mapped += usize::from(first.is_some());
         }
      }
      assert_eq!(mapped, FULL_TABLE.len());
   }

   #[test]
   fn test_mask_matches_resulting_set() {
      // Every command except the reused ANC rows writes the resulting mode set.
      for &(index, enabled, others, command) in FULL_TABLE {
         if index == ToggleIndex::Anc && others == TRANS | ADAPT {
            continue;
         }
         let expected = if enabled { others | index.bit() } else { others };
         assert_eq!(command.mask(), expected, "{}", command.name());
      }
      assert!(LongPressCommand::iter().all(|c| c.mask() & !0x0F == 0));
   }

   #[test]
   fn test_command_packet() {
      assert_eq!(
         DisableAncOffDisabled.packet().as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x1A, 0x0C, 0x00, 0x00, 0x00]
      );
      assert_eq!(EnableEverything.name(), "ENABLE_EVERYTHING");
   }
}

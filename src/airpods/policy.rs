//! Ear-presence and media policy.
//!
//! [`EarPolicy`] is a pure state machine turning decoded events into
//! [`MediaAction`]s. [`MediaPolicy`] hosts one policy per device, listens on
//! the event bus and runs the resulting actions against the injected
//! [`AudioRoute`] and [`MediaController`] capabilities on a worker task.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use bluer::Address;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   airpods::{
      device::AirPods,
      protocol::{Battery, ConversationAwareness, EarPresence},
   },
   event::{AirPodsEvent, EventBus},
};

#[derive(Error, Debug)]
pub enum RouteError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("No media player available")]
   NoPlayer,

   #[error("Audio route unavailable for {0}")]
   Unavailable(Address),
}

/// Connects and releases the audio profiles of a device.
pub trait AudioRoute: Send + Sync {
   fn connect_audio_route(&self, address: Address) -> BoxFuture<'_, Result<(), RouteError>>;

   fn disconnect_audio_route(&self, address: Address) -> BoxFuture<'_, Result<(), RouteError>>;

   /// Drops the radio connection entirely.
   fn disconnect_device(&self, address: Address) -> BoxFuture<'_, Result<(), RouteError>>;
}

/// System media session control.
pub trait MediaController: Send + Sync {
   fn play(&self) -> BoxFuture<'_, Result<(), RouteError>>;

   fn pause(&self) -> BoxFuture<'_, Result<(), RouteError>>;

   fn duck_volume(&self) -> BoxFuture<'_, Result<(), RouteError>>;

   fn restore_volume(&self) -> BoxFuture<'_, Result<(), RouteError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaAction {
   /// Connect the audio profiles; with `then_play`, start playback once the
   /// route is up. This is the only play issued for that transition.
   ConnectAudio { then_play: bool },
   DisconnectAudio,
   Play,
   Pause,
   DuckVolume,
   RestoreVolume,
}

/// Per-device policy state.
#[derive(Debug, Clone)]
pub struct EarPolicy {
   enabled: bool,
   previous: Option<EarPresence>,
   user_played: bool,
   paused_by_policy: bool,
   buds_charging: bool,
}

impl EarPolicy {
   pub const fn new(ear_detection: bool) -> Self {
      Self {
         enabled: ear_detection,
         previous: None,
         user_played: false,
         paused_by_policy: false,
         buds_charging: false,
      }
   }

   pub const fn user_played(&self) -> bool {
      self.user_played
   }

   pub const fn paused_by_policy(&self) -> bool {
      self.paused_by_policy
   }

   pub const fn previous(&self) -> Option<EarPresence> {
      self.previous
   }

   pub const fn is_enabled(&self) -> bool {
      self.enabled
   }

   /// Turns ear detection on or off. The presence baseline is dropped so a
   /// re-enabled policy does not act on a stale report.
   pub fn set_enabled(&mut self, enabled: bool) {
      if self.enabled != enabled {
         self.enabled = enabled;
         self.previous = None;
         self.paused_by_policy = false;
      }
   }

   /// Records that playback was started by the user rather than the policy.
   pub fn note_user_played(&mut self) {
      self.user_played = true;
      self.paused_by_policy = false;
   }

   /// Evaluates an ear-presence report. The first report after a (re)connect
   /// only establishes the baseline.
   pub fn on_ear_presence(&mut self, new: EarPresence) -> Vec<MediaAction> {
      if !self.enabled {
         return Vec::new();
      }
      let Some(prev) = self.previous.replace(new) else {
         debug!("Ear baseline {:?}", new.pair());
         return Vec::new();
      };
      if prev.sorted() == new.sorted() {
         return Vec::new();
      }

      if prev.none_in_ear() && new.any_in_ear() {
         self.paused_by_policy = false;
         return vec![MediaAction::ConnectAudio { then_play: true }];
      }
      if prev.any_in_ear() && new.none_in_ear() {
         return vec![MediaAction::DisconnectAudio];
      }
      if !prev.both_in_ear() && new.both_in_ear() {
         self.user_played = false;
         return Vec::new();
      }
      if prev.both_in_ear() && !new.both_in_ear() {
         self.user_played = false;
      }

      if new.in_ear() {
         self.paused_by_policy = false;
         vec![MediaAction::Play]
      } else {
         self.paused_by_policy = true;
         vec![MediaAction::Pause]
      }
   }

   pub fn on_conversation(&mut self, status: ConversationAwareness) -> Vec<MediaAction> {
      match status {
         ConversationAwareness::SpeakingStarted(_) => vec![MediaAction::DuckVolume],
         ConversationAwareness::SpeakingStopped(_) => vec![MediaAction::RestoreVolume],
         _ => Vec::new(),
      }
   }

   /// Releases audio while both buds charge and reclaims it afterwards.
   pub fn on_battery(&mut self, battery: &Battery) -> Vec<MediaAction> {
      let charging = battery.buds_charging();
      if charging == self.buds_charging {
         return Vec::new();
      }
      self.buds_charging = charging;
      if charging {
         vec![MediaAction::DisconnectAudio]
      } else {
         vec![MediaAction::ConnectAudio { then_play: false }]
      }
   }

   /// Called when the system re-attached the audio profile on its own.
   /// Audio is released whenever no bud is in an ear.
   pub fn audio_source_check(&self) -> Vec<MediaAction> {
      match self.previous {
         Some(ear) if ear.none_in_ear() => vec![MediaAction::DisconnectAudio],
         _ => Vec::new(),
      }
   }

   /// Forgets the presence baseline, keeping the configuration.
   pub fn reset(&mut self) {
      *self = Self::new(self.enabled);
   }
}

/// Event sink that applies [`EarPolicy`] to every device.
pub struct MediaPolicy {
   ear_detection: AtomicBool,
   policies: Mutex<HashMap<Address, EarPolicy>>,
   tx: mpsc::UnboundedSender<(Address, MediaAction)>,
}

impl MediaPolicy {
   /// Creates the policy and spawns its action worker.
   pub fn spawn(
      ear_detection: bool,
      route: Arc<dyn AudioRoute>,
      media: Arc<dyn MediaController>,
   ) -> (Arc<Self>, JoinHandle<()>) {
      let (tx, rx) = mpsc::unbounded_channel();
      let handle = tokio::spawn(run_actions(rx, route, media));
      let policy = Arc::new(Self {
         ear_detection: AtomicBool::new(ear_detection),
         policies: Mutex::new(HashMap::new()),
         tx,
      });
      (policy, handle)
   }

   pub fn note_user_played(&self, address: Address) {
      self.with_policy(address, EarPolicy::note_user_played);
   }

   pub fn ear_detection(&self) -> bool {
      self.ear_detection.load(Ordering::Relaxed)
   }

   /// Applies to every tracked device and to devices seen later.
   pub fn set_ear_detection(&self, enabled: bool) {
      let mut policies = self.policies.lock();
      self.ear_detection.store(enabled, Ordering::Relaxed);
      for policy in policies.values_mut() {
         policy.set_enabled(enabled);
      }
      info!("Ear detection {}", if enabled { "enabled" } else { "disabled" });
   }

   fn with_policy<R>(&self, address: Address, f: impl FnOnce(&mut EarPolicy) -> R) -> R {
      let mut policies = self.policies.lock();
      let policy = policies
         .entry(address)
         .or_insert_with(|| EarPolicy::new(self.ear_detection()));
      f(policy)
   }

   fn dispatch(&self, address: Address, actions: Vec<MediaAction>) {
      for action in actions {
         debug!("{address}: policy action {action:?}");
         if self.tx.send((address, action)).is_err() {
            warn!("Media policy worker stopped, dropping {action:?}");
            return;
         }
      }
   }
}

impl EventBus for MediaPolicy {
   fn emit(&self, device: &AirPods, event: AirPodsEvent) {
      let address = device.address();
      let actions = match &event {
         AirPodsEvent::EarDetectionChanged(ear) => {
            self.with_policy(address, |p| p.on_ear_presence(*ear))
         },
         AirPodsEvent::ConversationAwarenessChanged(ca) => {
            self.with_policy(address, |p| p.on_conversation(*ca))
         },
         AirPodsEvent::BatteryUpdated(battery) => {
            self.with_policy(address, |p| p.on_battery(battery))
         },
         AirPodsEvent::AudioSourceConnected => {
            self.with_policy(address, |p| p.audio_source_check())
         },
         AirPodsEvent::DeviceDisconnected => {
            self.with_policy(address, EarPolicy::reset);
            Vec::new()
         },
         _ => Vec::new(),
      };
      self.dispatch(address, actions);
   }
}

async fn run_actions(
   mut rx: mpsc::UnboundedReceiver<(Address, MediaAction)>,
   route: Arc<dyn AudioRoute>,
   media: Arc<dyn MediaController>,
) {
   while let Some((address, action)) = rx.recv().await {
      let result = match action {
         MediaAction::ConnectAudio { then_play } => {
            match route.connect_audio_route(address).await {
               Ok(()) if then_play => media.play().await,
               other => other,
            }
         },
         MediaAction::DisconnectAudio => route.disconnect_audio_route(address).await,
         MediaAction::Play => media.play().await,
         MediaAction::Pause => media.pause().await,
         MediaAction::DuckVolume => media.duck_volume().await,
         MediaAction::RestoreVolume => media.restore_volume().await,
      };
      match result {
         Ok(()) => debug!("{address}: {action:?} done"),
         Err(e) => warn!("{address}: {action:?} failed: {e}"),
      }
   }
   info!("Media policy worker stopped");
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;
   use crate::{
      airpods::{
         device::{DeviceContext, LinkState},
         protocol::{BatteryReading, BatteryStatus, Component, HDR_EAR_DETECTION},
      },
      bluetooth::l2cap::testing,
      event::EventSender,
   };

   const ADDR: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   fn ear(left: bool, right: bool) -> EarPresence {
      EarPresence::new(left, right)
   }

   fn primed(left: bool, right: bool) -> EarPolicy {
      let mut policy = EarPolicy::new(true);
      assert!(policy.on_ear_presence(ear(left, right)).is_empty());
      policy
   }

   #[test]
   fn test_insert_both_plays_once() {
      let mut policy = primed(false, false);
      let actions = policy.on_ear_presence(ear(true, true));
      assert_eq!(actions, [MediaAction::ConnectAudio { then_play: true }]);
      let plays = actions
         .iter()
         .filter(|a| {
            matches!(
               a,
               MediaAction::Play | MediaAction::ConnectAudio { then_play: true }
            )
         })
         .count();
      assert_eq!(plays, 1);
   }

   #[test]
   fn test_remove_all_disconnects_only() {
      let mut policy = primed(true, false);
      assert_eq!(
         policy.on_ear_presence(ear(false, false)),
         [MediaAction::DisconnectAudio]
      );
   }

   #[test]
   fn test_sorted_duplicates_suppressed() {
      let mut policy = primed(true, false);
      assert!(policy.on_ear_presence(ear(false, true)).is_empty());
      assert_eq!(policy.previous(), Some(ear(false, true)));
   }

   #[test]
   fn test_one_to_both_resets_user_flag() {
      let mut policy = primed(true, false);
      policy.note_user_played();
      assert!(policy.on_ear_presence(ear(true, true)).is_empty());
      assert!(!policy.user_played());
   }

   #[test]
   fn test_both_to_one_pauses() {
      let mut policy = primed(true, true);
      policy.note_user_played();
      assert_eq!(policy.on_ear_presence(ear(false, true)), [MediaAction::Pause]);
      assert!(!policy.user_played());
      assert!(policy.paused_by_policy());
   }

   #[test]
   fn test_single_bud_fallback_plays() {
      // 0x03 marks a single accessory; one zero byte is enough to be in ear.
      let mut policy = primed(true, true);
      let actions = policy.on_ear_presence(EarPresence::from_raw(0x00, 0x03));
      assert_eq!(actions, [MediaAction::Play]);
      assert!(!policy.paused_by_policy());
   }

   #[test]
   fn test_disabled_ignores_everything() {
      let mut policy = EarPolicy::new(false);
      assert!(policy.on_ear_presence(ear(false, false)).is_empty());
      assert!(policy.on_ear_presence(ear(true, true)).is_empty());
      assert_eq!(policy.previous(), None);
   }

   #[test]
   fn test_conversation_ducking() {
      let mut policy = EarPolicy::new(true);
      assert_eq!(
         policy.on_conversation(ConversationAwareness::SpeakingStarted(0x01)),
         [MediaAction::DuckVolume]
      );
      assert_eq!(
         policy.on_conversation(ConversationAwareness::SpeakingStopped(0x03)),
         [MediaAction::RestoreVolume]
      );
      assert!(policy.on_conversation(ConversationAwareness::Idle).is_empty());
   }

   #[test]
   fn test_charging_releases_audio_on_change() {
      let battery = |status| {
         Battery::from_readings([
            BatteryReading::new(Component::Left, 50, status),
            BatteryReading::new(Component::Right, 50, status),
         ])
      };
      let mut policy = EarPolicy::new(true);
      assert!(policy.on_battery(&battery(BatteryStatus::NotCharging)).is_empty());
      assert_eq!(
         policy.on_battery(&battery(BatteryStatus::Charging)),
         [MediaAction::DisconnectAudio]
      );
      assert!(policy.on_battery(&battery(BatteryStatus::Charging)).is_empty());
      assert_eq!(
         policy.on_battery(&battery(BatteryStatus::NotCharging)),
         [MediaAction::ConnectAudio { then_play: false }]
      );
   }

   #[test]
   fn test_audio_source_check() {
      let mut policy = primed(false, false);
      assert_eq!(policy.audio_source_check(), [MediaAction::DisconnectAudio]);
      // Playback the user started does not keep the route while both buds
      // are out.
      policy.note_user_played();
      assert_eq!(policy.audio_source_check(), [MediaAction::DisconnectAudio]);
      assert!(primed(true, false).audio_source_check().is_empty());
      assert!(EarPolicy::new(true).audio_source_check().is_empty());
   }

   #[test]
   fn test_toggle_ear_detection() {
      let mut policy = primed(false, false);
      policy.set_enabled(false);
      assert!(!policy.is_enabled());
      assert!(policy.on_ear_presence(ear(true, true)).is_empty());
      assert!(policy.audio_source_check().is_empty());

      // Re-enabling starts from a fresh baseline.
      policy.set_enabled(true);
      assert!(policy.on_ear_presence(ear(true, true)).is_empty());
      assert_eq!(policy.on_ear_presence(ear(false, false)), [MediaAction::DisconnectAudio]);
   }

   #[derive(Default)]
   struct Recorder(Mutex<Vec<&'static str>>);

   impl Recorder {
      fn push(&self, call: &'static str) -> BoxFuture<'_, Result<(), RouteError>> {
         self.0.lock().push(call);
         Box::pin(async { Ok(()) })
      }
   }

   impl AudioRoute for Recorder {
      fn connect_audio_route(&self, _: Address) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("connect")
      }

      fn disconnect_audio_route(&self, _: Address) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("disconnect")
      }

      fn disconnect_device(&self, _: Address) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("disconnect_device")
      }
   }

   impl MediaController for Recorder {
      fn play(&self) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("play")
      }

      fn pause(&self) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("pause")
      }

      fn duck_volume(&self) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("duck")
      }

      fn restore_volume(&self) -> BoxFuture<'_, Result<(), RouteError>> {
         self.push("restore")
      }
   }

   #[tokio::test]
   async fn test_media_policy_executes_in_order() {
      let recorder = Arc::new(Recorder::default());
      let (policy, worker) = MediaPolicy::spawn(true, recorder.clone(), recorder.clone());
      let device = AirPods::new(ADDR, "Pods", DeviceContext::default());

      for presence in [ear(false, false), ear(true, true), ear(true, false), ear(false, false)] {
         policy.emit(&device, AirPodsEvent::EarDetectionChanged(presence));
      }
      policy.emit(&device, AirPodsEvent::DeviceDisconnected);
      policy.emit(&device, AirPodsEvent::EarDetectionChanged(ear(true, true)));
      drop(policy);

      tokio::time::timeout(Duration::from_secs(1), worker)
         .await
         .unwrap()
         .unwrap();
      assert_eq!(
         *recorder.0.lock(),
         ["connect", "play", "pause", "disconnect"]
      );
   }

   #[tokio::test]
   async fn test_disabled_ear_detection_suppresses_actions() {
      let recorder = Arc::new(Recorder::default());
      let (policy, worker) = MediaPolicy::spawn(true, recorder.clone(), recorder.clone());
      let device = AirPods::new(ADDR, "Pods", DeviceContext::default());

      policy.emit(&device, AirPodsEvent::EarDetectionChanged(ear(false, false)));
      policy.set_ear_detection(false);
      assert!(!policy.ear_detection());
      policy.emit(&device, AirPodsEvent::EarDetectionChanged(ear(true, true)));
      policy.emit(&device, AirPodsEvent::EarDetectionChanged(ear(false, false)));
      policy.emit(&device, AirPodsEvent::AudioSourceConnected);

      // Devices first seen while disabled start disabled.
      let other = AirPods::new(Address([1, 2, 3, 4, 5, 6]), "Other", DeviceContext::default());
      policy.emit(&other, AirPodsEvent::EarDetectionChanged(ear(false, false)));
      policy.emit(&other, AirPodsEvent::EarDetectionChanged(ear(true, true)));

      policy.set_ear_detection(true);
      policy.emit(&device, AirPodsEvent::EarDetectionChanged(ear(false, false)));
      policy.emit(&device, AirPodsEvent::EarDetectionChanged(ear(true, false)));
      drop(policy);

      tokio::time::timeout(Duration::from_secs(1), worker)
         .await
         .unwrap()
         .unwrap();
      assert_eq!(*recorder.0.lock(), ["connect", "play"]);
   }

   async fn wait_until(mut cond: impl FnMut() -> bool) {
      for _ in 0..200 {
         if cond() {
            return;
         }
         tokio::time::sleep(Duration::from_millis(5)).await;
      }
      panic!("condition not reached");
   }

   #[tokio::test]
   async fn test_insert_after_reconnect_plays() {
      let recorder = Arc::new(Recorder::default());
      let (policy, _worker) = MediaPolicy::spawn(true, recorder.clone(), recorder.clone());
      let events: EventSender = policy.clone();
      let ctx = DeviceContext {
         handshake_retries: Vec::new(),
         ..Default::default()
      };
      let device = AirPods::new(ADDR, "Pods", ctx);
      let in_case = [HDR_EAR_DETECTION, &[0x02u8, 0x02][..]].concat();
      let inserted = [HDR_EAR_DETECTION, &[0x00u8, 0x00][..]].concat();

      let (io, peer) = testing::pair();
      let session = device.attach(io, &events).await.unwrap();
      peer.push(&in_case);
      wait_until(|| device.ear_presence().is_some()).await;
      peer.hang_up();
      session.await.unwrap();
      assert_eq!(device.link_state(), LinkState::Disconnected);

      // The buds repeat their last report before the user puts them in.
      let (io, peer) = testing::pair();
      let _session = device.attach(io, &events).await.unwrap();
      peer.push(&in_case);
      peer.push(&inserted);
      wait_until(|| recorder.0.lock().len() >= 2).await;
      assert_eq!(*recorder.0.lock(), ["connect", "play"]);
   }
}

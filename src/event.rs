//! Event handling system for `AirPods` status updates.
//!
//! Devices publish state changes through an injected [`EventBus`]. The
//! daemon dispatches them to D-Bus and the media policy; library users can
//! subscribe to an [`EventHub`] instead.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;
use tokio::sync::broadcast;

use crate::airpods::{
   device::AirPods,
   protocol::{Battery, ConversationAwareness, EarPresence, NoiseControlMode},
};

/// Events that can be emitted by the `AirPods` service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirPodsEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(Battery),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarPresence),
   ConversationAwarenessChanged(ConversationAwareness),
   DeviceNameChanged(SmolStr),
   /// The OS re-established the audio profile while the control link was up.
   AudioSourceConnected,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &AirPods, event: AirPodsEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event tagged with the device it came from.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
   pub address: Address,
   pub event: AirPodsEvent,
}

/// Broadcast channel of device events. Subscribers see events in emission
/// order; slow subscribers lag rather than block the emitter.
#[derive(Debug, Clone)]
pub struct EventHub {
   tx: broadcast::Sender<DeviceEvent>,
}

impl EventHub {
   pub fn new(capacity: usize) -> Self {
      let (tx, _) = broadcast::channel(capacity);
      Self { tx }
   }

   pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
      self.tx.subscribe()
   }
}

impl Default for EventHub {
   fn default() -> Self {
      Self::new(256)
   }
}

impl EventBus for EventHub {
   fn emit(&self, device: &AirPods, event: AirPodsEvent) {
      // No receivers is not an error.
      let _ = self.tx.send(DeviceEvent {
         address: device.address(),
         event,
      });
   }
}

/// Forwards every event to each inner bus in order.
pub struct Fanout(Vec<EventSender>);

impl Fanout {
   pub fn new(sinks: impl IntoIterator<Item = EventSender>) -> Self {
      Self(sinks.into_iter().collect())
   }
}

impl EventBus for Fanout {
   fn emit(&self, device: &AirPods, event: AirPodsEvent) {
      if let Some((last, rest)) = self.0.split_last() {
         for sink in rest {
            sink.emit(device, event.clone());
         }
         last.emit(device, event);
      }
   }
}

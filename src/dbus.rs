//! D-Bus surface of the daemon.
//!
//! `org.aapd.Manager` exposes device state and commands; device events and
//! relay traffic are published as signals by a dispatcher task.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{
   sync::{Notify, mpsc},
   time,
};
use zbus::{
   Connection, fdo, interface,
   object_server::{InterfaceRef, SignalEmitter},
   zvariant,
};

use crate::{
   airpods::{
      device::AirPods,
      long_press::LongPressToggles,
      policy::MediaPolicy,
      protocol::{FeatureId, NoiseControlMode},
   },
   bluetooth::manager::BluetoothManager,
   config::Config,
   error::Result,
   event::{AirPodsEvent, EventBus},
   packet_log::PacketLog,
   relay::{RelayFrame, RelayHub},
};

pub const SERVICE_NAME: &str = "org.aapd";
pub const OBJECT_PATH: &str = "/org/aapd/manager";

fn failed(e: impl fmt::Display) -> fdo::Error {
   fdo::Error::Failed(e.to_string())
}

fn invalid(msg: impl Into<String>) -> fdo::Error {
   fdo::Error::InvalidArgs(msg.into())
}

fn parse_address(address: &str) -> fdo::Result<Address> {
   Address::from_str(address).map_err(|e| invalid(e.to_string()))
}

/// Typed access to `SendCommand` parameters.
struct Params<'a>(&'a HashMap<String, zvariant::Value<'a>>);

impl Params<'_> {
   fn get(&self, key: &str) -> fdo::Result<&zvariant::Value<'_>> {
      self
         .0
         .get(key)
         .ok_or_else(|| invalid(format!("Missing '{key}' parameter")))
   }

   fn str(&self, key: &str) -> fdo::Result<String> {
      self
         .get(key)?
         .downcast_ref::<String>()
         .map_err(|e| invalid(format!("Invalid '{key}' parameter: {e}")))
   }

   fn bool(&self, key: &str) -> fdo::Result<bool> {
      self
         .get(key)?
         .downcast_ref::<bool>()
         .map_err(|e| invalid(format!("Invalid '{key}' parameter: {e}")))
   }

   /// Accepts a D-Bus byte or any integer that fits in one.
   fn u8(&self, key: &str) -> fdo::Result<u8> {
      let value = self.get(key)?;
      let wide = value
         .downcast_ref::<u8>()
         .map(i64::from)
         .or_else(|_| value.downcast_ref::<u32>().map(i64::from))
         .or_else(|_| value.downcast_ref::<i32>().map(i64::from))
         .map_err(|e| invalid(format!("Invalid '{key}' parameter: {e}")))?;
      u8::try_from(wide).map_err(|_| invalid(format!("'{key}' out of range: {wide}")))
   }

   /// A mode name such as `anc`, or its wire index 1..=4.
   fn noise_mode(&self, key: &str) -> fdo::Result<NoiseControlMode> {
      if let Ok(index) = self.u8(key) {
         return NoiseControlMode::from_index(index)
            .ok_or_else(|| invalid(format!("Invalid noise mode: {index}")));
      }
      let name = self.str(key)?;
      NoiseControlMode::from_str(&name).map_err(|_| invalid(format!("Invalid noise mode: {name}")))
   }
}

pub struct AapService {
   manager: BluetoothManager,
   config: Mutex<Config>,
   packet_log: Option<PacketLog>,
   relay: Option<RelayHub>,
   policy: Option<Arc<MediaPolicy>>,
}

impl AapService {
   pub fn new(
      manager: BluetoothManager,
      config: Config,
      packet_log: Option<PacketLog>,
      relay: Option<RelayHub>,
      policy: Option<Arc<MediaPolicy>>,
   ) -> Self {
      Self {
         manager,
         config: Mutex::new(config),
         packet_log,
         relay,
         policy,
      }
   }

   fn policy(&self) -> fdo::Result<&Arc<MediaPolicy>> {
      self
         .policy
         .as_ref()
         .ok_or_else(|| fdo::Error::NotSupported("Media policy disabled".into()))
   }

   async fn device(&self, address: &str) -> fdo::Result<AirPods> {
      let addr = parse_address(address)?;
      self.manager.get_device(addr).await.map_err(failed)
   }

   fn packet_log(&self) -> fdo::Result<&PacketLog> {
      self
         .packet_log
         .as_ref()
         .ok_or_else(|| fdo::Error::NotSupported("Packet log disabled".into()))
   }

   fn relay(&self) -> fdo::Result<&RelayHub> {
      self
         .relay
         .as_ref()
         .ok_or_else(|| fdo::Error::NotSupported("Relay disabled".into()))
   }

   async fn run_action(&self, dev: &AirPods, action: &str, params: &Params<'_>) -> fdo::Result<()> {
      match action {
         "set_noise_mode" => {
            dev.set_noise_mode(params.noise_mode("value")?)
               .await
               .map_err(failed)?;
         },
         "set_conversation_awareness" => {
            dev.set_conversation_awareness(params.bool("enabled")?)
               .await
               .map_err(failed)?;
         },
         "set_feature" => {
            let name = params.str("feature")?;
            let feature =
               FeatureId::parse(&name).ok_or_else(|| invalid(format!("Unknown feature: {name}")))?;
            dev.set_feature(feature, params.bool("enabled")?)
               .await
               .map_err(failed)?;
         },
         "set_feature_value" => {
            let name = params.str("feature")?;
            let feature =
               FeatureId::parse(&name).ok_or_else(|| invalid(format!("Unknown feature: {name}")))?;
            dev.set_feature_value(feature, params.u8("value")?)
               .await
               .map_err(failed)?;
         },
         "set_off_listening_mode" => {
            dev.set_feature(FeatureId::ALLOW_OFF, params.bool("enabled")?)
               .await
               .map_err(failed)?;
         },
         "set_tone_volume" => {
            dev.set_tone_volume(params.u8("value")?)
               .await
               .map_err(failed)?;
         },
         "set_personalized_volume" => {
            dev.set_personalized_volume(params.bool("enabled")?)
               .await
               .map_err(failed)?;
         },
         "set_loud_sound_reduction" => {
            dev.set_loud_sound_reduction(params.bool("enabled")?)
               .await
               .map_err(failed)?;
         },
         "set_name" => {
            dev.set_name(&params.str("value")?).await.map_err(failed)?;
         },
         "set_long_press" => {
            let old = LongPressToggles::from_mask(params.u8("old")?);
            let new = LongPressToggles::from_mask(params.u8("new")?);
            let off = match params.bool("off_listening_mode") {
               Ok(off) => off,
               Err(_) => self.config.lock().off_listening_mode,
            };
            let command = dev.update_long_press(old, new, off).await.map_err(failed)?;
            debug!("Long press {old:?} -> {new:?}: {command:?}");
         },
         _ => return Err(invalid(format!("Unknown action: {action}"))),
      }
      Ok(())
   }
}

#[interface(name = "org.aapd.Manager")]
impl AapService {
   async fn get_devices(&self) -> fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .manager
         .all_devices()
         .await
         .into_iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&states).map_err(failed)
   }

   async fn get_device(&self, address: String) -> fdo::Result<String> {
      Ok(self.device(&address).await?.to_json().to_string())
   }

   async fn passthrough(&self, address: String, packet: String) -> fdo::Result<bool> {
      let dev = self.device(&address).await?;
      let packet = hex::decode(packet).map_err(|e| invalid(e.to_string()))?;
      dev.send(&packet).await.map_err(failed)?;
      Ok(true)
   }

   async fn send_command(
      &self,
      address: String,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> fdo::Result<bool> {
      let dev = self.device(&address).await?;
      self.run_action(&dev, &action, &Params(&params)).await?;
      info!("{action} applied to {address}");
      Ok(true)
   }

   async fn connect_device(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.establish_aap(addr).await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.disconnect_aap(addr).await.map_err(failed)?;
      Ok(true)
   }

   /// Tells the ear policy that playback was started by the user, so
   /// putting the buds back in does not fight them.
   async fn note_user_playback(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.policy()?.note_user_played(addr);
      Ok(true)
   }

   /// Switches ear-detection media control at runtime and persists it.
   async fn set_ear_detection(&self, enabled: bool) -> fdo::Result<bool> {
      self.policy()?.set_ear_detection(enabled);
      let mut config = self.config.lock();
      config.ear_detection = enabled;
      if let Err(e) = config.save() {
         warn!("Failed to save configuration: {e}");
      }
      Ok(true)
   }

   /// Logged traffic as JSON. An empty address returns every device.
   async fn get_packet_log(&self, address: String) -> fdo::Result<String> {
      let filter = if address.is_empty() {
         None
      } else {
         Some(parse_address(&address)?)
      };
      let entries: Vec<serde_json::Value> = self
         .packet_log()?
         .entries(filter)
         .map_err(failed)?
         .into_iter()
         .map(|e| {
            json!({
               "address": e.address().to_string(),
               "direction": <&'static str>::from(e.direction),
               "timestamp": e.timestamp,
               "data": hex::encode(&e.bytes),
            })
         })
         .collect();
      serde_json::to_string(&entries).map_err(failed)
   }

   async fn clear_packet_log(&self) -> fdo::Result<bool> {
      self.packet_log()?.clear().map_err(failed)?;
      Ok(true)
   }

   async fn attach_relay(&self) -> fdo::Result<bool> {
      self.relay()?.set_attached(true);
      info!("Relay peer attached");
      Ok(true)
   }

   async fn detach_relay(&self) -> fdo::Result<bool> {
      self.relay()?.set_attached(false);
      info!("Relay peer detached");
      Ok(true)
   }

   /// Hands a notification captured by the relay peer to the device.
   async fn relay_ingest(&self, address: String, packet: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let packet = hex::decode(packet).map_err(|e| invalid(e.to_string()))?;
      self
         .manager
         .ingest_relay(addr, packet)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_control_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      mode: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal, name = "EarDetectionChanged")]
   pub async fn ear_detection_changed_signal(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn conversation_awareness_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      status: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   /// Frame for the relay peer: `direction` is `received` or `command`.
   #[zbus(signal)]
   pub async fn relay_frame(
      emitter: &SignalEmitter<'_>,
      address: &str,
      direction: &str,
      data: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn ear_detection(&self) -> bool {
      match &self.policy {
         Some(policy) => policy.ear_detection(),
         None => false,
      }
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      let n = self.manager.count_devices().await;
      u32::try_from(n).unwrap_or(u32::MAX)
   }
}

/// Lock-free event queue drained into D-Bus signals.
pub struct EventProcessor {
   queue: SegQueue<(AirPods, AirPodsEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(AirPods, AirPodsEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      iface: &InterfaceRef<AapService>,
      (device, event): (AirPods, AirPodsEvent),
   ) -> Result<()> {
      let addr = device.address_str();
      match event {
         AirPodsEvent::DeviceConnected => iface.device_connected(addr).await?,
         AirPodsEvent::DeviceDisconnected => iface.device_disconnected(addr).await?,
         AirPodsEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(addr, &battery.to_json().to_string())
               .await?;
         },
         AirPodsEvent::NoiseControlChanged(mode) => {
            iface.noise_control_changed(addr, mode.to_str()).await?;
         },
         AirPodsEvent::EarDetectionChanged(ear) => {
            iface
               .ear_detection_changed_signal(addr, &ear.to_json().to_string())
               .await?;
         },
         AirPodsEvent::ConversationAwarenessChanged(status) => {
            iface
               .conversation_awareness_changed(addr, status.to_str())
               .await?;
         },
         AirPodsEvent::DeviceNameChanged(name) => iface.device_name_changed(addr, &name).await?,
         AirPodsEvent::DeviceError => iface.device_error(addr).await?,
         // Consumed by the media policy only.
         AirPodsEvent::AudioSourceConnected => {},
      }
      Ok(())
   }

   pub async fn spawn_dispatcher(self: Arc<Self>, connection: &Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, AapService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = Self::dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });
      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &AirPods, event: AirPodsEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}

/// Publishes frames queued for the relay peer as `RelayFrame` signals.
pub async fn spawn_relay_forwarder(
   connection: &Connection,
   mut rx: mpsc::Receiver<RelayFrame>,
) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, AapService>(OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      while let Some(frame) = rx.recv().await {
         let res = iface
            .relay_frame(
               &frame.address.to_string(),
               frame.direction.into(),
               &hex::encode(&frame.data),
            )
            .await;
         if let Err(e) = res {
            warn!("Error forwarding relay frame: {e}");
         }
      }
   });
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   fn params(entries: Vec<(&str, zvariant::Value<'static>)>) -> HashMap<String, zvariant::Value<'static>> {
      entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
   }

   #[test]
   fn test_params_integer_widths() {
      let map = params(vec![
         ("byte", zvariant::Value::from(7u8)),
         ("word", zvariant::Value::from(42u32)),
         ("big", zvariant::Value::from(300u32)),
         ("negative", zvariant::Value::from(-1i32)),
      ]);
      let p = Params(&map);
      assert_eq!(p.u8("byte").unwrap(), 7);
      assert_eq!(p.u8("word").unwrap(), 42);
      assert!(p.u8("big").is_err());
      assert!(p.u8("negative").is_err());
      assert!(p.u8("missing").is_err());
   }

   #[test]
   fn test_params_types() {
      let map = params(vec![
         ("value", zvariant::Value::from("anc")),
         ("enabled", zvariant::Value::from(true)),
      ]);
      let p = Params(&map);
      assert_eq!(p.str("value").unwrap(), "anc");
      assert!(p.bool("enabled").unwrap());
      assert!(p.bool("value").is_err());
   }

   #[test]
   fn test_params_noise_mode() {
      let map = params(vec![
         ("name", zvariant::Value::from("transparency")),
         ("index", zvariant::Value::from(2u8)),
         ("wide", zvariant::Value::from(4u32)),
         ("zero", zvariant::Value::from(0u8)),
         ("bogus", zvariant::Value::from("loud")),
      ]);
      let p = Params(&map);
      assert_eq!(p.noise_mode("name").unwrap(), NoiseControlMode::Transparency);
      assert_eq!(p.noise_mode("index").unwrap(), NoiseControlMode::NoiseCancellation);
      assert_eq!(p.noise_mode("wide").unwrap(), NoiseControlMode::Adaptive);
      assert!(p.noise_mode("zero").is_err());
      assert!(p.noise_mode("bogus").is_err());
   }
}

//! `AirPods` device implementation and connection management.
//!
//! This module provides the core `AirPods` type which owns the AAP link to a
//! device: socket lifecycle, handshake, the packet read loop, and routing of
//! outbound commands to the socket or to a relay peer.

use core::fmt;
use std::{
   sync::{
      Arc, Weak,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::RwLock,
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   airpods::{
      long_press::{LongPressCommand, LongPressToggles, resolve_toggle_command},
      parser::{self, DecodedFrame},
      policy::AudioRoute,
      protocol::{
         BatteryReading, EarPresence, FeatureCmd, FeatureId, HANDSHAKE_SEQUENCE,
         NoiseControlMode, RELAY_DATA_HEADER, loud_sound_reduction_packet,
         personalized_volume_packets, rename_packet, tone_volume_packet, value_packet,
      },
      state::{DeviceState, StateStore},
   },
   bluetooth::l2cap::{self, L2CapReceiver, L2CapSender, Packet, PacketIo},
   error::{AirPodsError, Result},
   event::{AirPodsEvent, EventSender},
   packet_log::{Direction, PacketLog},
   relay::Relay,
};

/// Default delays, measured from the initial handshake, at which the
/// handshake sequence is sent again.
pub const DEFAULT_HANDSHAKE_RETRIES: [Duration; 2] =
   [Duration::from_millis(200), Duration::from_secs(5)];
/// Upper bound on extra handshake rounds.
const MAX_HANDSHAKE_RETRIES: usize = 2;

/// Lifecycle of the AAP link.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
   #[default]
   Disconnected,
   Connecting,
   Handshaking,
   Connected,
   Disconnecting,
}

/// Collaborators injected into each device.
#[derive(Clone)]
pub struct DeviceContext {
   pub relay: Option<Arc<dyn Relay>>,
   pub route: Option<Arc<dyn AudioRoute>>,
   pub packet_log: Option<PacketLog>,
   pub handshake_retries: Vec<Duration>,
}

impl Default for DeviceContext {
   fn default() -> Self {
      Self {
         relay: None,
         route: None,
         packet_log: None,
         handshake_retries: DEFAULT_HANDSHAKE_RETRIES.to_vec(),
      }
   }
}

impl fmt::Debug for DeviceContext {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("DeviceContext")
         .field("relay", &self.relay.is_some())
         .field("route", &self.route.is_some())
         .field("packet_log", &self.packet_log.is_some())
         .field("handshake_retries", &self.handshake_retries)
         .finish()
   }
}

/// Internal state for an active L2CAP connection.
#[derive(Debug)]
struct ConnectionState {
   sender: L2CapSender,
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.sender.shutdown();
      self.jset.abort_all();
   }
}

/// Internal shared state for an `AirPods` device.
#[derive(Debug)]
struct AirPodsInner {
   address: Address,
   address_str: SmolStr,
   state: StateStore,
   link: AtomicCell<LinkState>,
   /// Bumped whenever a connection is replaced or closed, so a stale read
   /// loop does not report a disconnect for a link it no longer owns.
   epoch: AtomicU64,
   conn: RwLock<Option<ConnectionState>>,
   ctx: DeviceContext,
}

/// Represents an `AirPods` device.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct AirPods(Arc<AirPodsInner>);

/// Weak reference to an `AirPods` device.
#[derive(Debug, Clone)]
pub struct WeakAirPods(Weak<AirPodsInner>);

impl WeakAirPods {
   pub fn new(airpods: &AirPods) -> Self {
      Self(Arc::downgrade(&airpods.0))
   }

   pub fn upgrade(&self) -> Option<AirPods> {
      self.0.upgrade().map(AirPods)
   }
}

impl fmt::Debug for AirPods {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AirPods")
         .field("address", &self.0.address_str)
         .field("link", &self.link_state())
         .finish_non_exhaustive()
   }
}

impl AirPods {
   /// Creates a new `AirPods` device instance.
   pub fn new(address: Address, name: impl Into<SmolStr>, ctx: DeviceContext) -> Self {
      Self(Arc::new(AirPodsInner {
         address,
         address_str: address.to_smolstr(),
         state: StateStore::new(name),
         link: AtomicCell::new(LinkState::Disconnected),
         epoch: AtomicU64::new(0),
         conn: RwLock::new(None),
         ctx,
      }))
   }

   /// Gets the address of the Airpod.
   pub fn address(&self) -> Address {
      self.0.address
   }

   /// Gets the address string of the Airpod.
   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   pub fn name(&self) -> SmolStr {
      self.snapshot().name.clone()
   }

   /// Current decoded state.
   pub fn snapshot(&self) -> Arc<DeviceState> {
      self.0.state.snapshot()
   }

   /// Battery readings in left, right, case order. Empty until the first report.
   pub fn battery(&self) -> Vec<BatteryReading> {
      self
         .snapshot()
         .battery
         .as_ref()
         .map(|b| b.to_vec())
         .unwrap_or_default()
   }

   pub fn noise_mode(&self) -> Option<NoiseControlMode> {
      self.snapshot().noise_mode
   }

   pub fn ear_presence(&self) -> Option<EarPresence> {
      self.snapshot().ear
   }

   pub fn link_state(&self) -> LinkState {
      self.0.link.load()
   }

   /// True while a local socket is open.
   pub fn is_connected(&self) -> bool {
      matches!(
         self.link_state(),
         LinkState::Handshaking | LinkState::Connected
      )
   }

   fn set_link(&self, state: LinkState) {
      let prev = self.0.link.swap(state);
      if prev != state {
         debug!("{}: link {prev} -> {state}", self.address());
      }
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = self.snapshot().to_json();
      info["address"] = json!(self.address_str().as_str());
      info["connected"] = json!(self.is_connected());
      info["link"] = json!(<&'static str>::from(self.link_state()));
      info
   }

   /// Establishes an L2CAP connection to the `AirPods` device.
   ///
   /// Returns a join handle that resolves when the connection is closed.
   pub async fn connect(&self, event_tx: &EventSender) -> Result<JoinHandle<Option<AirPodsError>>> {
      info!("Connecting to AirPods at {}", self.address());
      self.set_link(LinkState::Connecting);
      match l2cap::open(self.address(), None).await {
         Ok(socket) => self.attach(Arc::new(socket), event_tx).await,
         Err(e) => {
            warn!("{}: Failed to open AAP channel: {e}", self.address());
            self.set_link(LinkState::Disconnected);
            Err(e)
         },
      }
   }

   /// Runs the AAP session over an already connected transport.
   pub async fn attach<T: PacketIo>(
      &self,
      io: Arc<T>,
      event_tx: &EventSender,
   ) -> Result<JoinHandle<Option<AirPodsError>>> {
      let mut conn = self.0.conn.write().await;
      drop(conn.take());
      let epoch = self.0.epoch.fetch_add(1, Ordering::AcqRel) + 1;
      self.0.state.begin_session();

      let mut jset = JoinSet::new();
      let (receiver, sender) = l2cap::spawn_io(&mut jset, self.address(), io);
      self.set_link(LinkState::Handshaking);

      info!("{}: Starting handshake sequence...", self.address());
      if let Err(e) = self.send_handshake(&sender).await {
         error!("{}: Failed to send handshake: {e:?}", self.address());
         sender.shutdown();
         self.set_link(LinkState::Disconnected);
         return Err(e);
      }
      self.schedule_handshake_retries(&mut jset, sender.clone());

      let jhandle = self.start_packet_processor(receiver, epoch, event_tx.clone());
      *conn = Some(ConnectionState { sender, jset });

      info!("Successfully connected to {}", self.address());
      Ok(jhandle)
   }

   async fn send_handshake(&self, sender: &L2CapSender) -> Result<()> {
      for packet in HANDSHAKE_SEQUENCE {
         sender.send(packet).await?;
         self.log_packet(Direction::Sent, packet);
      }
      Ok(())
   }

   /// Re-sends the handshake at the configured offsets. Some firmware drops
   /// the first burst silently. The task lives in the connection's join set.
   fn schedule_handshake_retries(&self, jset: &mut JoinSet<()>, sender: L2CapSender) {
      let delays: Vec<Duration> = self
         .0
         .ctx
         .handshake_retries
         .iter()
         .take(MAX_HANDSHAKE_RETRIES)
         .copied()
         .collect();
      if delays.is_empty() {
         return;
      }

      let weak = WeakAirPods::new(self);
      let mac = self.address();
      let start = time::Instant::now();
      jset.spawn(async move {
         for (i, delay) in delays.into_iter().enumerate() {
            time::sleep_until(start + delay).await;
            debug!("{mac}: [Retry {}] Re-sending handshake sequence", i + 1);
            for packet in HANDSHAKE_SEQUENCE {
               if let Err(e) = sender.send(packet).await {
                  warn!("{mac}: Handshake retry failed: {e}");
                  return;
               }
               if let Some(this) = weak.upgrade() {
                  this.log_packet(Direction::Sent, packet);
               }
            }
         }
      });
   }

   fn start_packet_processor(
      &self,
      mut rx: L2CapReceiver,
      epoch: u64,
      event_tx: EventSender,
   ) -> JoinHandle<Option<AirPodsError>> {
      let addr = self.address();
      let weak = WeakAirPods::new(self);
      tokio::spawn(async move {
         loop {
            match rx.recv().await {
               Ok(packet) => {
                  if let Some(this) = weak.upgrade() {
                     this.process_packet(&packet, &event_tx);
                  } else {
                     warn!("{addr}: Airpod instance was dropped");
                     return None;
                  }
               },
               Err(e) => {
                  let Some(this) = weak.upgrade() else {
                     warn!("{addr}: Connection closed: {e:?}");
                     return Some(e);
                  };
                  if this.0.epoch.load(Ordering::Acquire) != epoch {
                     debug!("{addr}: Read loop finished after local close");
                     return None;
                  }
                  this.notify_disconnected(epoch, &event_tx).await;
                  return Some(e);
               },
            }
         }
      })
   }

   async fn notify_disconnected(&self, epoch: u64, event_tx: &EventSender) {
      {
         let mut conn = self.0.conn.write().await;
         if self.0.epoch.load(Ordering::Acquire) != epoch {
            return;
         }
         drop(conn.take());
      }
      self.set_link(LinkState::Disconnected);
      info!("Disconnected from {}", self.address());
      event_tx.emit(self, AirPodsEvent::DeviceDisconnected);
   }

   fn process_packet(&self, packet: &Packet, event_tx: &EventSender) {
      self.log_packet(Direction::Received, packet);
      if let Some(relay) = self.available_relay()
         && let Err(e) = relay.forward_received(packet)
      {
         debug!("{}: Relay mirror failed: {e}", self.address());
      }
      self.handle_frame(packet, event_tx);
   }

   fn handle_frame(&self, packet: &[u8], event_tx: &EventSender) {
      let Some(frame) = parser::classify_and_decode(packet) else {
         return;
      };
      if self
         .0
         .link
         .compare_exchange(LinkState::Handshaking, LinkState::Connected)
         .is_ok()
      {
         info!("{}: AAP session established", self.address());
      }
      match &frame {
         DecodedFrame::HandshakeAck => debug!("Received handshake ACK from {}", self.address()),
         DecodedFrame::FeaturesAck => debug!("Received features ACK from {}", self.address()),
         other => debug!("{}: {other:?}", self.address()),
      }
      if let Some(event) = self.0.state.apply(&frame) {
         event_tx.emit(self, event);
      }
   }

   /// Feeds a notification relayed by a companion through the decode path.
   /// Ignored while a local socket is open.
   pub fn ingest_relay(&self, bytes: &[u8], event_tx: &EventSender) {
      if self.is_connected() {
         debug!("{}: Ignoring relayed frame, local link is up", self.address());
         return;
      }
      let frame = bytes.strip_prefix(RELAY_DATA_HEADER).unwrap_or(bytes);
      self.handle_frame(frame, event_tx);
   }

   fn available_relay(&self) -> Option<&Arc<dyn Relay>> {
      self.0.ctx.relay.as_ref().filter(|r| r.is_available())
   }

   fn log_packet(&self, direction: Direction, bytes: &[u8]) {
      if let Some(log) = &self.0.ctx.packet_log
         && let Err(e) = log.append(self.address(), direction, bytes)
      {
         warn!("{}: Failed to record packet: {e}", self.address());
      }
   }

   /// Sends raw bytes to the device.
   ///
   /// Uses the local socket when open, otherwise the relay peer tagged with
   /// the relay header. Never both.
   pub async fn send(&self, packet: &[u8]) -> Result<()> {
      let sender = self.0.conn.read().await.as_ref().map(|c| c.sender.clone());
      if let Some(sender) = sender {
         sender.send(packet).await?;
         self.log_packet(Direction::Sent, packet);
         return Ok(());
      }

      if let Some(relay) = self.available_relay() {
         let mut tagged = Vec::with_capacity(RELAY_DATA_HEADER.len() + packet.len());
         tagged.extend_from_slice(RELAY_DATA_HEADER);
         tagged.extend_from_slice(packet);
         relay.send_remote(&tagged)?;
         debug!("{}: relayed {}", self.address(), hex::encode(packet));
         return Ok(());
      }

      Err(AirPodsError::DeviceNotConnected)
   }

   /// Closes the local link without touching the radio connection.
   pub async fn close(&self) {
      self.0.epoch.fetch_add(1, Ordering::AcqRel);
      let conn = self.0.conn.write().await.take();
      if conn.is_some() {
         drop(conn);
         info!("Closed AAP link to {}", self.address());
      }
      self.set_link(LinkState::Disconnected);
   }

   /// Closes the link and asks the system to drop the radio connection.
   pub async fn disconnect(&self) {
      self.set_link(LinkState::Disconnecting);
      self.0.epoch.fetch_add(1, Ordering::AcqRel);
      drop(self.0.conn.write().await.take());
      if let Some(route) = &self.0.ctx.route
         && let Err(e) = route.disconnect_device(self.address()).await
      {
         warn!("{}: Radio disconnect failed: {e}", self.address());
      }
      self.set_link(LinkState::Disconnected);
      info!("Disconnected from {}", self.address());
   }

   pub async fn set_noise_mode(&self, mode: NoiseControlMode) -> Result<()> {
      self.send(&mode.packet()).await?;
      self.0.state.set_noise_mode(mode);
      Ok(())
   }

   pub async fn set_feature(&self, feature: FeatureId, enabled: bool) -> Result<()> {
      self
         .send(&FeatureCmd::from_bool(enabled).build(feature))
         .await?;
      self.0.state.set_feature(feature, enabled);
      Ok(())
   }

   pub async fn set_conversation_awareness(&self, enabled: bool) -> Result<()> {
      self.set_feature(FeatureId::CONVERSATIONAL, enabled).await
   }

   /// Sends a single-byte control value (press speed, adaptive strength, ...).
   pub async fn set_feature_value(&self, feature: FeatureId, value: u8) -> Result<()> {
      self.send(&value_packet(feature, value)).await
   }

   pub async fn set_tone_volume(&self, volume: u8) -> Result<()> {
      self.send(&tone_volume_packet(volume)).await
   }

   pub async fn set_personalized_volume(&self, enabled: bool) -> Result<()> {
      for packet in personalized_volume_packets(enabled) {
         self.send(&packet).await?;
      }
      self.0.state.set_feature(FeatureId::ADAPTIVE_VOLUME, enabled);
      Ok(())
   }

   pub async fn set_loud_sound_reduction(&self, enabled: bool) -> Result<()> {
      self.send(&loud_sound_reduction_packet(enabled)).await
   }

   pub async fn set_name(&self, name: &str) -> Result<()> {
      let packet = rename_packet(name)
         .ok_or_else(|| AirPodsError::InvalidPacket(format!("name too long: {} bytes", name.len())))?;
      self.send(&packet).await?;
      self.0.state.set_name(name.into());
      Ok(())
   }

   /// Reconfigures the long-press cycle. Returns the command sent, if the
   /// firmware has one for this change.
   pub async fn update_long_press(
      &self,
      old: LongPressToggles,
      new: LongPressToggles,
      off_listening_mode: bool,
   ) -> Result<Option<LongPressCommand>> {
      let command = resolve_toggle_command(old, new, off_listening_mode)?;
      match command {
         Some(command) => {
            debug!("{}: long press {}", self.address(), command.name());
            self.send(&command.packet()).await?;
         },
         None => debug!(
            "{}: no long-press command for {old:?} -> {new:?}",
            self.address()
         ),
      }
      Ok(command)
   }
}

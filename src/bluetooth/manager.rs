//! Bluetooth device manager for `AirPods`.
//!
//! A single actor owns every adapter and device record. It reacts to BlueZ
//! adapter events and periodic health checks, opens the AAP link once the
//! system has connected a recognized accessory, and reconnects a bounded
//! number of times when the link drops while the radio is still up.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{broadcast, mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::{
      self,
      device::{AirPods, DeviceContext},
      policy::AudioRoute,
   },
   bluetooth::audio,
   config::Config,
   error::{AirPodsError, Result},
   event::{AirPodsEvent, DeviceEvent, EventHub, EventSender, Fanout},
   packet_log::PacketLog,
   relay::RelayHub,
};

/// Interval to re-check radio state of tracked devices and look for new ones
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum time to wait for the AAP link to come up
const AAP_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on the AAP reconnect backoff
const MAX_AAP_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Shared collaborators handed to every device the manager creates.
#[derive(Clone, Default)]
pub struct ManagerServices {
   pub relay: Option<RelayHub>,
   pub route: Option<Arc<dyn AudioRoute>>,
   pub packet_log: Option<PacketLog>,
}

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   retry_count: u32,
}

// === Device Management ===

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RadioState {
   Connected,
   Disconnected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AapState {
   Idle,
   Connecting,
   Connected,
   Backoff,
   Failed(&'static str),
   /// Closed on request; left alone until the radio link cycles.
   Parked,
}

struct TrackedDevice {
   device: AirPods,
   radio: RadioState,
   aap: AapState,
   adapter_name: SmolStr,
   aap_attempts: u32,
   aap_handle: Option<JoinHandle<()>>,
}

impl TrackedDevice {
   fn abort_aap(&mut self) {
      if let Some(handle) = self.aap_handle.take() {
         handle.abort();
      }
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String),

   // Device events
   DeviceDiscovered(Address, SmolStr),
   RadioConnected(Address),
   RadioDisconnected(Address),
   AapConnected(Address),
   AapClosed(Address, bool), // address, is_error
   DeviceLost(Address),
   AudioTransportAdded(Address),

   // Requests
   EstablishAap(Address, Option<oneshot::Sender<Result<()>>>),
   DisconnectAap(Address, oneshot::Sender<Result<()>>),
   IngestRelay(Address, Vec<u8>, oneshot::Sender<Result<()>>),
   GetDevice(Address, oneshot::Sender<Option<AirPods>>),
   GetAllDevices(oneshot::Sender<Vec<AirPods>>),
}

// === Main Manager ===

/// Handle to the device manager.
///
/// Cloning is cheap; the actor stops once every handle is dropped.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
   hub: EventHub,
}

impl BluetoothManager {
   pub async fn new(
      session: Session,
      event_tx: EventSender,
      config: Config,
      services: ManagerServices,
   ) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let hub = EventHub::default();
      let events: EventSender = Arc::new(Fanout::new([Arc::new(hub.clone()) as EventSender, event_tx]));

      let actor = ManagerActor::new(session, config, services, events, command_rx);
      tokio::spawn(actor.run());
      Ok(Self {
         inbox: command_tx,
         hub,
      })
   }

   /// Stream of every event emitted by managed devices, in emission order.
   pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
      self.hub.subscribe()
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| AirPodsError::ManagerShutdown)?;
      rx.await.map_err(|_| AirPodsError::ManagerShutdown)
   }

   pub async fn establish_aap(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::EstablishAap(address, Some(tx)))
         .await?
   }

   /// Closes the AAP link and drops the radio connection.
   pub async fn disconnect_aap(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::DisconnectAap(address, tx))
         .await?
   }

   /// Feeds a notification received from a relay peer to the device.
   pub async fn ingest_relay(&self, address: Address, bytes: Vec<u8>) -> Result<()> {
      self
         .request(|tx| ManagerCommand::IngestRelay(address, bytes, tx))
         .await?
   }

   pub async fn get_device(&self, address: Address) -> Result<AirPods> {
      self
         .request(|tx| ManagerCommand::GetDevice(address, tx))
         .await?
         .ok_or(AirPodsError::DeviceNotFound(address))
   }

   pub async fn all_devices(&self) -> Vec<AirPods> {
      self
         .request(ManagerCommand::GetAllDevices)
         .await
         .unwrap_or_default()
   }

   pub async fn count_devices(&self) -> usize {
      self.all_devices().await.len()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   services: ManagerServices,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   session: Session,

   adapters: HashMap<SmolStr, AdapterInfo>,
   devices: HashMap<Address, TrackedDevice>,
   aap_connecting: HashSet<Address>,
}

impl ManagerActor {
   fn new(
      session: Session,
      config: Config,
      services: ManagerServices,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         services,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         session,
         adapters: HashMap::new(),
         devices: HashMap::new(),
         aap_connecting: HashSet::new(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");
      self.initialize_adapters().await;
      let transport_watch = self.start_transport_watch();

      let mut health_check = time::interval(HEALTH_CHECK_INTERVAL);
      health_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let adapter_period = Duration::from_secs(self.config.poll_interval.max(1));
      let mut adapter_check = time::interval(adapter_period);
      adapter_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = health_check.tick() => {
               self.check_radio_state().await;
               self.scan_for_connected_airpods().await;
            }
            _ = adapter_check.tick() => {
               self.discover_new_adapters().await;
            }
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Bluetooth manager shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
         }
      }

      transport_watch.abort();
      self.cleanup().await;
   }

   /// Forwards BlueZ media transport additions into the loopback queue.
   fn start_transport_watch(&self) -> JoinHandle<()> {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let (tx, mut rx) = mpsc::channel(16);
         let forward = async {
            while let Some(addr) = rx.recv().await {
               if loopback
                  .send(ManagerCommand::AudioTransportAdded(addr))
                  .await
                  .is_err()
               {
                  break;
               }
            }
         };
         let (res, ()) = tokio::join!(audio::watch_audio_transports(tx), forward);
         if let Err(e) = res {
            warn!("Media transport watch unavailable: {e}");
         }
      })
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => error!("Failed to get adapter names: {e}"),
      }

      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      let adapter = match self.session.adapter(&name) {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
            return;
         },
      };
      info!("Initializing adapter: {name}");

      if adapter.is_powered().await == Ok(false) {
         if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {name}: {e}");
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               time::sleep(ADAPTER_RECOVERY_DELAY).await;
               let _ = loopback
                  .send(ManagerCommand::AdapterAvailable(name, adapter))
                  .await;
            });
            return;
         }
         info!("Powered on adapter: {name}");
      }

      let monitor = Self::start_adapter_monitor(self.loopback_tx.clone(), name.clone(), adapter.clone());
      self.adapters.insert(
         name.clone(),
         AdapterInfo {
            adapter,
            state: AdapterState::Active,
            monitor_handle: Some(monitor),
            retry_count: 0,
         },
      );
      self.queue_connected_airpods(&name).await;
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            let _ = loopback
               .send(ManagerCommand::AdapterError(
                  name,
                  "Failed to get adapter events".to_string(),
               ))
               .await;
            return;
         };

         while let Some(event) = events.next().await {
            let cmd = match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added on {name}: {addr}");
                  ManagerCommand::DeviceDiscovered(addr, name.clone())
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
                  ManagerCommand::DeviceLost(addr)
               },
               // Connection changes are picked up by the health check.
               _ => continue,
            };
            if loopback.send(cmd).await.is_err() {
               return;
            }
         }

         let _ = loopback.send(ManagerCommand::AdapterLost(name)).await;
      })
   }

   /// Queues discovery of every recognized accessory the system has
   /// connected on `adapter_name` but that has no AAP link yet.
   async fn queue_connected_airpods(&self, adapter_name: &SmolStr) {
      let Some(info) = self.adapters.get(adapter_name) else {
         return;
      };
      if info.state != AdapterState::Active {
         return;
      }
      let Ok(addresses) = info.adapter.device_addresses().await else {
         return;
      };

      for addr in addresses {
         if self.has_aap_link(addr) {
            continue;
         }
         if let Ok(device) = info.adapter.device(addr)
            && device.is_connected().await == Ok(true)
            && self.is_airpods_device(&device).await
         {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name.clone()))
               .await;
         }
      }
   }

   async fn is_airpods_device(&self, device: &bluer::Device) -> bool {
      if self
         .config
         .is_known_device(&device.address().to_string())
         .is_some()
      {
         return true;
      }
      airpods::recognition::is_device_airpods(device).await
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => self.handle_adapter_lost(name),
         ManagerCommand::AdapterError(name, error) => {
            error!("Adapter error on {name}: {error}");
            if let Some(info) = self.adapters.get_mut(&name) {
               info.state = AdapterState::Failed(error);
            }
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::RadioConnected(addr) => self.handle_radio_connected(addr).await,
         ManagerCommand::RadioDisconnected(addr) => self.handle_radio_disconnected(addr).await,
         ManagerCommand::AapConnected(addr) => self.handle_aap_connected(addr),
         ManagerCommand::AapClosed(addr, is_error) => self.handle_aap_closed(addr, is_error),
         ManagerCommand::DeviceLost(addr) => self.handle_device_lost(addr).await,
         ManagerCommand::AudioTransportAdded(addr) => {
            if let Some(tracked) = self.devices.get(&addr)
               && tracked.aap == AapState::Connected
            {
               self
                  .event_tx
                  .emit(&tracked.device, AirPodsEvent::AudioSourceConnected);
            }
         },
         ManagerCommand::EstablishAap(addr, reply) => {
            let result = self.establish_aap_connection(addr).await;
            if let Err(e) = &result {
               debug!("{addr}: not connecting AAP: {e}");
            }
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::DisconnectAap(addr, reply) => {
            let _ = reply.send(self.disconnect_aap(addr).await);
         },
         ManagerCommand::IngestRelay(addr, bytes, reply) => {
            let result = match self.devices.get(&addr) {
               Some(tracked) => {
                  tracked.device.ingest_relay(&bytes, &self.event_tx);
                  Ok(())
               },
               None => Err(AirPodsError::DeviceNotFound(addr)),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::GetDevice(addr, reply) => {
            let _ = reply.send(self.devices.get(&addr).map(|d| d.device.clone()));
         },
         ManagerCommand::GetAllDevices(reply) => {
            let _ = reply.send(self.devices.values().map(|d| d.device.clone()).collect());
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         self.initialize_adapter(name).await;
         return;
      };
      info.adapter = adapter;
      info.state = AdapterState::Active;
      info.retry_count = 0;
      if info.monitor_handle.is_none() {
         info.monitor_handle = Some(Self::start_adapter_monitor(
            self.loopback_tx.clone(),
            name.clone(),
            info.adapter.clone(),
         ));
      }

      self.queue_connected_airpods(&name).await;

      let stalled: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| {
            d.adapter_name == name
               && d.radio == RadioState::Connected
               && matches!(d.aap, AapState::Failed(_) | AapState::Idle)
         })
         .map(|(addr, _)| *addr)
         .collect();
      for addr in stalled {
         if let Err(e) = self.establish_aap_connection(addr).await {
            debug!("{addr}: reconnect after adapter recovery failed: {e}");
         }
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;
      if let Some(handle) = info.monitor_handle.take() {
         handle.abort();
      }

      for tracked in self.devices.values_mut() {
         if tracked.adapter_name == name {
            tracked.aap = AapState::Failed("adapter lost");
            tracked.abort_aap();
            self.event_tx.emit(&tracked.device, AirPodsEvent::DeviceError);
         }
      }

      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(ADAPTER_RECOVERY_DELAY, info.retry_count);
      tokio::spawn(async move {
         time::sleep(delay).await;
         let cmd = match session.adapter(&name) {
            Ok(adapter) => ManagerCommand::AdapterAvailable(name, adapter),
            Err(e) => ManagerCommand::AdapterError(name, format!("Recovery failed: {e}")),
         };
         let _ = loopback.send(cmd).await;
      });
   }

   fn device_context(&self, addr: Address) -> DeviceContext {
      DeviceContext {
         relay: self.services.relay.as_ref().map(|hub| hub.for_device(addr)),
         route: self.services.route.clone(),
         packet_log: self
            .config
            .packet_log
            .then(|| self.services.packet_log.clone())
            .flatten(),
         handshake_retries: self.config.handshake_retries(),
      }
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.devices.contains_key(&addr) {
         return;
      }
      let Some(info) = self.adapters.get(&adapter_name) else {
         return;
      };
      let Ok(device) = info.adapter.device(addr) else {
         return;
      };
      if !self.is_airpods_device(&device).await {
         return;
      }
      if !device.is_connected().await.unwrap_or(false) {
         debug!("Discovered AirPods at {addr} but not connected by system");
         return;
      }

      let name = match self.config.is_known_device(&addr.to_string()) {
         Some(name) => name.to_string(),
         None => device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| addr.to_string()),
      };
      info!("Found connected AirPods: {name} ({addr})");

      let airpods = AirPods::new(addr, name, self.device_context(addr));
      self.devices.insert(
         addr,
         TrackedDevice {
            device: airpods,
            radio: RadioState::Connected,
            aap: AapState::Idle,
            adapter_name,
            aap_attempts: 0,
            aap_handle: None,
         },
      );

      if let Err(e) = self.establish_aap_connection(addr).await {
         warn!("{addr}: {e}");
      }
   }

   async fn handle_radio_connected(&mut self, addr: Address) {
      let Some(tracked) = self.devices.get_mut(&addr) else {
         return;
      };
      info!("{addr}: radio link up");
      tracked.radio = RadioState::Connected;
      tracked.aap_attempts = 0;
      if let Err(e) = self.establish_aap_connection(addr).await {
         warn!("{addr}: {e}");
      }
   }

   async fn handle_radio_disconnected(&mut self, addr: Address) {
      let Some(tracked) = self.devices.get_mut(&addr) else {
         return;
      };
      info!("{addr}: radio link down");
      tracked.radio = RadioState::Disconnected;
      tracked.abort_aap();
      tracked.device.close().await;
      let was_up = matches!(tracked.aap, AapState::Connected | AapState::Connecting);
      tracked.aap = AapState::Idle;
      if was_up {
         self
            .event_tx
            .emit(&tracked.device, AirPodsEvent::DeviceDisconnected);
      }
      self.aap_connecting.remove(&addr);
   }

   fn handle_aap_connected(&mut self, addr: Address) {
      if let Some(tracked) = self.devices.get_mut(&addr) {
         tracked.aap = AapState::Connected;
         tracked.aap_attempts = 0;
         self
            .event_tx
            .emit(&tracked.device, AirPodsEvent::DeviceConnected);
      }
      self.aap_connecting.remove(&addr);
   }

   fn handle_aap_closed(&mut self, addr: Address, is_error: bool) {
      self.aap_connecting.remove(&addr);
      let Some(tracked) = self.devices.get_mut(&addr) else {
         return;
      };
      tracked.aap_handle = None;

      if !is_error || tracked.radio != RadioState::Connected {
         tracked.aap = AapState::Idle;
         tracked.aap_attempts = 0;
         return;
      }
      if tracked.aap_attempts >= self.config.connection_retry_count {
         warn!(
            "{addr}: giving up on AAP after {} attempts",
            tracked.aap_attempts
         );
         tracked.aap = AapState::Failed("retries exhausted");
         self.event_tx.emit(&tracked.device, AirPodsEvent::DeviceError);
         return;
      }

      tracked.aap = AapState::Backoff;
      tracked.aap_attempts += 1;
      let delay = calc_retry_delay(self.config.reconnect_delay(), tracked.aap_attempts);
      info!(
         "{addr}: AAP link lost, retry {}/{} in {delay:?}",
         tracked.aap_attempts, self.config.connection_retry_count
      );
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback
            .send(ManagerCommand::EstablishAap(addr, None))
            .await;
      });
   }

   async fn handle_device_lost(&mut self, addr: Address) {
      if let Some(mut tracked) = self.devices.remove(&addr) {
         tracked.abort_aap();
         tracked.device.close().await;
         self
            .event_tx
            .emit(&tracked.device, AirPodsEvent::DeviceDisconnected);
      }
      self.aap_connecting.remove(&addr);
   }

   async fn establish_aap_connection(&mut self, addr: Address) -> Result<()> {
      if self.aap_connecting.contains(&addr) {
         return Err(AirPodsError::AlreadyConnecting);
      }
      let tracked = self
         .devices
         .get_mut(&addr)
         .ok_or(AirPodsError::DeviceNotFound(addr))?;
      if tracked.aap == AapState::Connected && tracked.device.is_connected() {
         return Ok(());
      }

      let info = self
         .adapters
         .get(&tracked.adapter_name)
         .filter(|info| info.state == AdapterState::Active)
         .ok_or(AirPodsError::AdapterNotAvailable)?;
      if tracked.radio != RadioState::Connected {
         return Err(AirPodsError::DeviceNotConnected);
      }
      if !info.adapter.device(addr)?.is_paired().await.unwrap_or(false) {
         return Err(AirPodsError::DeviceNotPaired(addr));
      }

      let airpods = tracked.device.clone();
      let event_tx = self.event_tx.clone();
      let loopback = self.loopback_tx.clone();
      tracked.abort_aap();
      tracked.aap_handle = Some(tokio::spawn(async move {
         let err = match time::timeout(AAP_CONNECTION_TIMEOUT, airpods.connect(&event_tx)).await {
            Ok(Err(e)) => {
               warn!("Failed to establish AAP connection to {addr}: {e}");
               Some(e)
            },
            Err(_) => {
               warn!("AAP connection to {addr} timed out");
               airpods.close().await;
               Some(AirPodsError::RequestTimeout)
            },
            Ok(Ok(jhandle)) => {
               if loopback.send(ManagerCommand::AapConnected(addr)).await.is_err() {
                  return;
               }
               let err = jhandle.await.unwrap_or_else(|e| Some(AirPodsError::ActorPanicked(e)));
               match &err {
                  Some(err) => warn!("AAP connection to {addr} terminated: {err}"),
                  None => info!("AAP connection to {addr} closed cleanly"),
               }
               err
            },
         };
         let _ = loopback
            .send(ManagerCommand::AapClosed(addr, err.is_some()))
            .await;
      }));
      tracked.aap = AapState::Connecting;
      self.aap_connecting.insert(addr);
      Ok(())
   }

   async fn disconnect_aap(&mut self, addr: Address) -> Result<()> {
      let tracked = self
         .devices
         .get_mut(&addr)
         .ok_or(AirPodsError::DeviceNotFound(addr))?;

      tracked.abort_aap();
      tracked.aap = AapState::Parked;
      tracked.device.disconnect().await;
      self.aap_connecting.remove(&addr);
      self
         .event_tx
         .emit(&tracked.device, AirPodsEvent::DeviceDisconnected);
      Ok(())
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up Bluetooth manager");

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            let _ = time::timeout(Duration::from_secs(1), handle).await;
         }
      }

      // Leave the radio link alone; only our own channel is torn down.
      for tracked in self.devices.values_mut() {
         if let Some(handle) = tracked.aap_handle.take() {
            handle.abort();
            let _ = time::timeout(Duration::from_secs(1), handle).await;
         }
         tracked.device.close().await;
      }
   }

   async fn discover_new_adapters(&mut self) {
      let names = match self.session.adapter_names().await {
         Ok(names) => names,
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
            return;
         },
      };
      for name in names.into_iter().map(SmolStr::from) {
         let known_good = self
            .adapters
            .get(&name)
            .is_some_and(|info| info.state == AdapterState::Active);
         if !known_good {
            self.initialize_adapter(name).await;
         }
      }
   }

   async fn scan_for_connected_airpods(&self) {
      let names: Vec<SmolStr> = self.adapters.keys().cloned().collect();
      for name in &names {
         self.queue_connected_airpods(name).await;
      }
   }

   fn has_aap_link(&self, addr: Address) -> bool {
      self.devices.get(&addr).is_some_and(|d| {
         matches!(
            d.aap,
            AapState::Connected
               | AapState::Connecting
               | AapState::Backoff
               | AapState::Failed(_)
               | AapState::Parked
         )
      })
   }

   /// Compares the radio state BlueZ reports with what we track.
   async fn check_radio_state(&self) {
      for (addr, tracked) in &self.devices {
         let Some(info) = self.adapters.get(&tracked.adapter_name) else {
            continue;
         };
         let Ok(device) = info.adapter.device(*addr) else {
            continue;
         };
         let connected = device.is_connected().await.unwrap_or(false);
         let cmd = match (tracked.radio, connected) {
            (RadioState::Connected, false) => ManagerCommand::RadioDisconnected(*addr),
            (RadioState::Disconnected, true) => ManagerCommand::RadioConnected(*addr),
            _ => continue,
         };
         let _ = self.loopback_tx.send(cmd).await;
      }
   }
}

/// Exponential backoff from `base`, capped, with up to a second of jitter.
fn calc_retry_delay(base: Duration, attempt: u32) -> Duration {
   let exponential = base.saturating_mul(1 << attempt.saturating_sub(1).min(4));
   let jitter = rand::thread_rng().gen_range(0..1000);
   exponential.min(MAX_AAP_RETRY_DELAY) + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_retry_delay_grows_and_caps() {
      let base = Duration::from_secs(10);
      let first = calc_retry_delay(base, 1);
      assert!(first >= base && first < base + Duration::from_secs(1));
      let third = calc_retry_delay(base, 3);
      assert!(third >= Duration::from_secs(40));
      let late = calc_retry_delay(base, 30);
      assert!(late >= MAX_AAP_RETRY_DELAY && late < MAX_AAP_RETRY_DELAY + Duration::from_secs(1));
   }
}

//! `aapd`: AirPods accessory protocol daemon.

use std::sync::Arc;

use aapd::{
   airpods::policy::{AudioRoute, MediaController, MediaPolicy},
   bluetooth::{
      audio::BluezAudioRoute,
      manager::{BluetoothManager, ManagerServices},
   },
   config::Config,
   dbus::{self, AapService, EventProcessor},
   error::Result,
   event::{EventSender, Fanout},
   mpris::MprisController,
   packet_log::PacketLog,
   relay::RelayHub,
};
use log::{info, warn};
use tokio::signal;
use zbus::connection;

const RELAY_QUEUE_SIZE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting aapd...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let session = bluer::Session::new().await?;

   let packet_log = if config.packet_log {
      let log = PacketLog::open()?;
      if !log.is_empty()? {
         info!("Dropping {} packets logged by the previous run", log.len()?);
         log.clear()?;
      }
      Some(log)
   } else {
      None
   };

   let (relay, relay_rx) = RelayHub::new(RELAY_QUEUE_SIZE);
   let route: Arc<dyn AudioRoute> = Arc::new(BluezAudioRoute::new(session.clone()));

   let event_bus = EventProcessor::new();
   let mut sinks: Vec<EventSender> = vec![event_bus.clone() as EventSender];
   let policy = match MprisController::new().await {
      Ok(mpris) => {
         let media: Arc<dyn MediaController> = Arc::new(mpris);
         let (policy, _worker) = MediaPolicy::spawn(config.ear_detection, route.clone(), media);
         sinks.push(policy.clone());
         Some(policy)
      },
      Err(e) => {
         warn!("Media control unavailable, ear detection policy disabled: {e}");
         None
      },
   };
   let events: EventSender = Arc::new(Fanout::new(sinks));

   let services = ManagerServices {
      relay: Some(relay.clone()),
      route: Some(route),
      packet_log: packet_log.clone(),
   };
   let manager = BluetoothManager::new(session, events, config.clone(), services).await?;

   let service = AapService::new(manager, config, packet_log, Some(relay), policy);
   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("aapd D-Bus service started at {}", dbus::SERVICE_NAME);

   event_bus.spawn_dispatcher(&connection).await?;
   dbus::spawn_relay_forwarder(&connection, relay_rx).await?;

   signal::ctrl_c().await?;
   info!("Shutting down aapd...");
   Ok(())
}

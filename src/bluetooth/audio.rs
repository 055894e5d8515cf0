//! Audio route control through BlueZ.

use std::{collections::HashMap, str::FromStr};

use bluer::{Address, Session};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use zbus::{
   Connection, MatchRule, MessageStream,
   zvariant::{OwnedObjectPath, OwnedValue},
};

use crate::airpods::policy::{AudioRoute, RouteError};

/// A2DP sink.
const A2DP_SINK: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
/// Hands-free.
const HANDSFREE: Uuid = Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb);

const MEDIA_TRANSPORT_IFACE: &str = "org.bluez.MediaTransport1";

const AUDIO_PROFILES: [(Uuid, &str); 2] = [(A2DP_SINK, "A2DP"), (HANDSFREE, "HFP")];

/// [`AudioRoute`] that connects the media and hands-free profiles of a device
/// on the default adapter.
#[derive(Clone)]
pub struct BluezAudioRoute {
   session: Session,
}

impl BluezAudioRoute {
   pub const fn new(session: Session) -> Self {
      Self { session }
   }

   async fn device(&self, address: Address) -> Result<bluer::Device, RouteError> {
      let adapter = self.session.default_adapter().await?;
      Ok(adapter.device(address)?)
   }

   async fn connect_profiles(&self, address: Address) -> Result<(), RouteError> {
      let device = self.device(address).await?;
      if !device.is_connected().await? {
         return Err(RouteError::Unavailable(address));
      }
      for (uuid, name) in AUDIO_PROFILES {
         debug!("{address}: connecting {name}");
         device.connect_profile(&uuid).await?;
      }
      info!("{address}: audio route connected");
      Ok(())
   }

   async fn disconnect_profiles(&self, address: Address) -> Result<(), RouteError> {
      let device = self.device(address).await?;
      for (uuid, name) in AUDIO_PROFILES {
         debug!("{address}: disconnecting {name}");
         device.disconnect_profile(&uuid).await?;
      }
      info!("{address}: audio route released");
      Ok(())
   }
}

impl AudioRoute for BluezAudioRoute {
   fn connect_audio_route(&self, address: Address) -> BoxFuture<'_, Result<(), RouteError>> {
      self.connect_profiles(address).boxed()
   }

   fn disconnect_audio_route(&self, address: Address) -> BoxFuture<'_, Result<(), RouteError>> {
      self.disconnect_profiles(address).boxed()
   }

   fn disconnect_device(&self, address: Address) -> BoxFuture<'_, Result<(), RouteError>> {
      async move {
         self.device(address).await?.disconnect().await?;
         info!("{address}: radio link dropped");
         Ok(())
      }
      .boxed()
   }
}

/// Extracts the device address from a BlueZ object path such as
/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1/fd0`.
pub fn address_from_path(path: &str) -> Option<Address> {
   let dev = path.split('/').find_map(|seg| seg.strip_prefix("dev_"))?;
   Address::from_str(&dev.replace('_', ":")).ok()
}

type InterfacesAdded = (OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>);

/// Reports every device for which BlueZ exposes a new media transport, i.e.
/// whenever an audio stream route comes up. Runs until the bus or the
/// receiver goes away.
pub async fn watch_audio_transports(tx: mpsc::Sender<Address>) -> zbus::Result<()> {
   let conn = Connection::system().await?;
   let rule = MatchRule::builder()
      .msg_type(zbus::message::Type::Signal)
      .sender("org.bluez")?
      .interface("org.freedesktop.DBus.ObjectManager")?
      .member("InterfacesAdded")?
      .build();
   let mut stream = MessageStream::for_match_rule(rule, &conn, None).await?;
   debug!("Watching BlueZ media transports");

   while let Some(msg) = stream.next().await {
      let msg = match msg {
         Ok(msg) => msg,
         Err(e) => {
            warn!("Transport watcher: {e}");
            continue;
         },
      };
      let Ok((path, ifaces)) = msg.body().deserialize::<InterfacesAdded>() else {
         continue;
      };
      if !ifaces.contains_key(MEDIA_TRANSPORT_IFACE) {
         continue;
      }
      if let Some(address) = address_from_path(path.as_str()) {
         debug!("{address}: media transport added");
         if tx.send(address).await.is_err() {
            break;
         }
      }
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_address_from_path() {
      assert_eq!(
         address_from_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1/fd0"),
         Some(Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
      );
      assert_eq!(address_from_path("/org/bluez/hci0"), None);
      assert_eq!(address_from_path("/org/bluez/hci0/dev_nonsense"), None);
   }
}

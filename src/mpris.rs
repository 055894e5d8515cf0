//! Media control over MPRIS on the session bus.

use futures::{FutureExt, future::BoxFuture};
use log::{debug, info};
use parking_lot::Mutex;
use zbus::{Connection, fdo::DBusProxy, zvariant::OwnedValue};

use crate::airpods::policy::{MediaController, RouteError};

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// Fraction of the current volume kept while the user is speaking.
const DUCK_FACTOR: f64 = 0.25;

/// [`MediaController`] driving whichever MPRIS player is active.
pub struct MprisController {
   conn: Connection,
   /// Player we paused last, resumed first.
   paused: Mutex<Option<String>>,
   /// Player and volume before ducking.
   ducked: Mutex<Option<(String, f64)>>,
}

impl MprisController {
   pub async fn new() -> zbus::Result<Self> {
      Ok(Self {
         conn: Connection::session().await?,
         paused: Mutex::new(None),
         ducked: Mutex::new(None),
      })
   }

   async fn players(&self) -> Result<Vec<String>, RouteError> {
      let dbus = DBusProxy::new(&self.conn).await?;
      Ok(dbus
         .list_names()
         .await
         .map_err(zbus::Error::from)?
         .into_iter()
         .map(|n| n.to_string())
         .filter(|n| n.starts_with(MPRIS_PREFIX))
         .collect())
   }

   async fn get_property(&self, player: &str, name: &str) -> Result<OwnedValue, RouteError> {
      let reply = self
         .conn
         .call_method(
            Some(player),
            MPRIS_PATH,
            Some(PROPERTIES_IFACE),
            "Get",
            &(PLAYER_IFACE, name),
         )
         .await?;
      Ok(reply.body().deserialize::<OwnedValue>()?)
   }

   async fn is_playing(&self, player: &str) -> bool {
      match self.get_property(player, "PlaybackStatus").await {
         Ok(value) => String::try_from(value).is_ok_and(|s| s == "Playing"),
         Err(e) => {
            debug!("{player}: PlaybackStatus unavailable: {e}");
            false
         },
      }
   }

   async fn playing_player(&self) -> Result<Option<String>, RouteError> {
      for player in self.players().await? {
         if self.is_playing(&player).await {
            return Ok(Some(player));
         }
      }
      Ok(None)
   }

   async fn call_player(&self, player: &str, method: &str) -> Result<(), RouteError> {
      self
         .conn
         .call_method(Some(player), MPRIS_PATH, Some(PLAYER_IFACE), method, &())
         .await?;
      debug!("{player}: {method}");
      Ok(())
   }

   async fn set_volume(&self, player: &str, volume: f64) -> Result<(), RouteError> {
      self
         .conn
         .call_method(
            Some(player),
            MPRIS_PATH,
            Some(PROPERTIES_IFACE),
            "Set",
            &(PLAYER_IFACE, "Volume", zbus::zvariant::Value::from(volume)),
         )
         .await?;
      Ok(())
   }

   async fn do_play(&self) -> Result<(), RouteError> {
      let remembered = self.paused.lock().take();
      let player = match remembered {
         Some(player) => player,
         None => self
            .players()
            .await?
            .into_iter()
            .next()
            .ok_or(RouteError::NoPlayer)?,
      };
      self.call_player(&player, "Play").await
   }

   async fn do_pause(&self) -> Result<(), RouteError> {
      let Some(player) = self.playing_player().await? else {
         debug!("Nothing playing, skipping pause");
         return Ok(());
      };
      self.call_player(&player, "Pause").await?;
      *self.paused.lock() = Some(player);
      Ok(())
   }

   async fn do_duck(&self) -> Result<(), RouteError> {
      if self.ducked.lock().is_some() {
         return Ok(());
      }
      let Some(player) = self.playing_player().await? else {
         return Ok(());
      };
      let volume = f64::try_from(self.get_property(&player, "Volume").await?)
         .map_err(|e| RouteError::DBus(e.into()))?;
      self.set_volume(&player, volume * DUCK_FACTOR).await?;
      info!("{player}: volume ducked from {volume:.2}");
      *self.ducked.lock() = Some((player, volume));
      Ok(())
   }

   async fn do_restore(&self) -> Result<(), RouteError> {
      let Some((player, volume)) = self.ducked.lock().take() else {
         return Ok(());
      };
      self.set_volume(&player, volume).await?;
      info!("{player}: volume restored to {volume:.2}");
      Ok(())
   }
}

impl MediaController for MprisController {
   fn play(&self) -> BoxFuture<'_, Result<(), RouteError>> {
      self.do_play().boxed()
   }

   fn pause(&self) -> BoxFuture<'_, Result<(), RouteError>> {
      self.do_pause().boxed()
   }

   fn duck_volume(&self) -> BoxFuture<'_, Result<(), RouteError>> {
      self.do_duck().boxed()
   }

   fn restore_volume(&self) -> BoxFuture<'_, Result<(), RouteError>> {
      self.do_restore().boxed()
   }
}

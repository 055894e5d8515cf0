//! Cross-device relay seam.
//!
//! When the accessory is connected to a companion process instead of this
//! host, commands are handed to the relay tagged with
//! [`RELAY_DATA_HEADER`](crate::airpods::protocol::RELAY_DATA_HEADER), and
//! notifications the companion relays back are fed through
//! [`AirPods::ingest_relay`](crate::airpods::device::AirPods::ingest_relay).

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bluer::Address;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
   #[error("Relay peer not attached")]
   Detached,

   #[error("Relay queue full")]
   Full,
}

/// Alternate packet sink and source.
pub trait Relay: Send + Sync {
   /// True when a companion is attached and able to take frames.
   fn is_available(&self) -> bool;

   /// Mirrors a notification received on the local link.
   fn forward_received(&self, frame: &[u8]) -> Result<(), RelayError>;

   /// Hands a header-tagged command to the companion.
   fn send_remote(&self, frame: &[u8]) -> Result<(), RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum RelayDirection {
   Received,
   Command,
}

/// A frame queued for the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
   pub address: Address,
   pub direction: RelayDirection,
   pub data: Vec<u8>,
}

/// Shared queue towards a companion process. One hub serves every device.
#[derive(Debug, Clone)]
pub struct RelayHub {
   tx: mpsc::Sender<RelayFrame>,
   attached: Arc<AtomicBool>,
}

impl RelayHub {
   pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RelayFrame>) {
      let (tx, rx) = mpsc::channel(capacity);
      let hub = Self {
         tx,
         attached: Arc::new(AtomicBool::new(false)),
      };
      (hub, rx)
   }

   pub fn set_attached(&self, attached: bool) {
      self.attached.store(attached, Ordering::Relaxed);
   }

   pub fn is_attached(&self) -> bool {
      self.attached.load(Ordering::Relaxed) && !self.tx.is_closed()
   }

   /// Relay handle bound to one device.
   pub fn for_device(&self, address: Address) -> Arc<dyn Relay> {
      Arc::new(ChannelRelay {
         address,
         hub: self.clone(),
      })
   }
}

/// [`Relay`] backed by a [`RelayHub`] queue.
#[derive(Debug)]
pub struct ChannelRelay {
   address: Address,
   hub: RelayHub,
}

impl ChannelRelay {
   fn push(&self, direction: RelayDirection, frame: &[u8]) -> Result<(), RelayError> {
      if !self.hub.is_attached() {
         return Err(RelayError::Detached);
      }
      self
         .hub
         .tx
         .try_send(RelayFrame {
            address: self.address,
            direction,
            data: frame.to_vec(),
         })
         .map_err(|e| match e {
            TrySendError::Full(_) => RelayError::Full,
            TrySendError::Closed(_) => RelayError::Detached,
         })
   }
}

impl Relay for ChannelRelay {
   fn is_available(&self) -> bool {
      self.hub.is_attached()
   }

   fn forward_received(&self, frame: &[u8]) -> Result<(), RelayError> {
      self.push(RelayDirection::Received, frame)
   }

   fn send_remote(&self, frame: &[u8]) -> Result<(), RelayError> {
      self.push(RelayDirection::Command, frame)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_detached_hub_rejects() {
      let (hub, _rx) = RelayHub::new(4);
      let relay = hub.for_device(Address::any());
      assert!(!relay.is_available());
      assert_eq!(relay.send_remote(&[1]), Err(RelayError::Detached));
   }

   #[test]
   fn test_frames_are_tagged_with_device() {
      let (hub, mut rx) = RelayHub::new(1);
      hub.set_attached(true);
      let addr = Address::new([1, 2, 3, 4, 5, 6]);
      let relay = hub.for_device(addr);
      relay.send_remote(&[0xAA]).unwrap();
      assert_eq!(relay.forward_received(&[0xBB]), Err(RelayError::Full));
      let frame = rx.try_recv().unwrap();
      assert_eq!(frame.address, addr);
      assert_eq!(frame.direction, RelayDirection::Command);
      assert_eq!(frame.data, [0xAA]);

      drop(rx);
      assert!(!relay.is_available());
   }
}

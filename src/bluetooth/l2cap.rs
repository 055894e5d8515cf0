//! L2CAP socket implementation for `AirPods` communication.
//!
//! A connected socket is split into a reader task and a writer task. The
//! reader is the only consumer of inbound packets; all writes go through the
//! writer's command queue so frames from concurrent callers never interleave.

use std::{
   fmt, io,
   net::Shutdown,
   sync::Arc,
   time::Duration,
};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{AirPodsError, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) for `AirPods` control channel
pub const PSM_CONTROL: u16 = 0x1001;
/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected, message-oriented transport.
///
/// Implemented for the `bluer` sequential-packet socket and for the
/// in-memory transport used by tests.
pub trait PacketIo: Send + Sync + 'static {
   fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

   fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

   /// Shuts down both directions, waking a pending `recv`.
   fn shutdown(&self) -> io::Result<()>;
}

impl PacketIo for SeqPacket {
   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      SeqPacket::recv(self, buf).await
   }

   async fn send(&self, buf: &[u8]) -> io::Result<usize> {
      SeqPacket::send(self, buf).await
   }

   fn shutdown(&self) -> io::Result<()> {
      SeqPacket::shutdown(self, Shutdown::Both)
   }
}

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(AirPodsError::ConnectionClosed)?
   }
}

type Closer = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
   closer: Closer,
}

impl fmt::Debug for L2CapSender {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("L2CapSender")
         .field("connected", &self.is_connected())
         .finish_non_exhaustive()
   }
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(AirPodsError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| AirPodsError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| AirPodsError::RequestTimeout)?
         .map_err(|_| AirPodsError::ConnectionClosed)?
   }

   /// Shuts the socket down so the reader observes end-of-stream.
   pub fn shutdown(&self) {
      if let Err(e) = (self.closer)() {
         debug!("Socket shutdown: {e}");
      }
   }
}

/// Opens the AAP control channel to `address`.
pub async fn open(address: Address, psm: Option<u16>) -> Result<SeqPacket> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   let psm = psm.unwrap_or(PSM_CONTROL);
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| AirPodsError::RequestTimeout)??;
   Ok(seq_packet)
}

/// Starts the reader and writer tasks for a connected transport.
pub fn spawn_io<T: PacketIo>(
   jset: &mut JoinSet<()>,
   address: Address,
   io: Arc<T>,
) -> (L2CapReceiver, L2CapSender) {
   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   jset.spawn(recv_thread(address, in_tx, io.clone()));
   jset.spawn(send_thread(address, cmd_rx, io.clone()));

   let closer: Closer = Arc::new(move || io.shutdown());
   (L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx, closer })
}

async fn recv_thread<T: PacketIo>(adr: Address, tx: mpsc::Sender<Result<Packet>>, io: Arc<T>) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      let n = match io.recv(&mut stack).await {
         Ok(0) => {
            warn!("{adr}: Connection lost");
            let _ = tx.send(Err(AirPodsError::ConnectionLost)).await;
            return;
         },
         Ok(n) => n,
         Err(e) => {
            warn!("{adr}: Receive failed: {e}");
            let _ = tx.send(Err(AirPodsError::Io(e))).await;
            return;
         },
      };
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      if let Err(e) = tx.send(Ok(Packet::from_slice(recvd))).await {
         warn!("Failed to forward data: {e:?}");
         return;
      }
      stack[..n].fill(0);
   }
}

async fn send_thread<T: PacketIo>(adr: Address, mut rx: mpsc::Receiver<Command>, io: Arc<T>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = io.send(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(AirPodsError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: Writer shut down");
}

#[cfg(test)]
pub(crate) mod testing {
   //! In-memory transport driven from the test body.

   use std::sync::atomic::{AtomicBool, Ordering};

   use tokio::sync::{Mutex, Notify};

   use super::*;

   pub struct MockIo {
      inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
      sent: parking_lot::Mutex<Vec<Packet>>,
      closed: AtomicBool,
      close_notify: Notify,
   }

   impl PacketIo for MockIo {
      async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
         let closed = self.close_notify.notified();
         if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
         }
         let mut rx = self.inbound.lock().await;
         tokio::select! {
            pkt = rx.recv() => match pkt {
               Some(pkt) => {
                  buf[..pkt.len()].copy_from_slice(&pkt);
                  Ok(pkt.len())
               },
               None => Ok(0),
            },
            () = closed => Ok(0),
         }
      }

      async fn send(&self, buf: &[u8]) -> io::Result<usize> {
         if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::NotConnected.into());
         }
         self.sent.lock().push(Packet::from_slice(buf));
         Ok(buf.len())
      }

      fn shutdown(&self) -> io::Result<()> {
         self.closed.store(true, Ordering::SeqCst);
         self.close_notify.notify_waiters();
         Ok(())
      }
   }

   /// Remote end of a [`MockIo`].
   pub struct MockPeer {
      tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Packet>>>,
      io: Arc<MockIo>,
   }

   impl MockPeer {
      pub fn push(&self, bytes: &[u8]) {
         if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Packet::from_slice(bytes));
         }
      }

      /// Closes the inbound stream; the reader sees a zero-length read.
      pub fn hang_up(&self) {
         self.tx.lock().take();
      }

      pub fn sent(&self) -> Vec<Packet> {
         self.io.sent.lock().clone()
      }

      pub fn is_shut_down(&self) -> bool {
         self.io.closed.load(Ordering::SeqCst)
      }
   }

   pub fn pair() -> (Arc<MockIo>, MockPeer) {
      let (tx, rx) = mpsc::unbounded_channel();
      let io = Arc::new(MockIo {
         inbound: Mutex::new(rx),
         sent: parking_lot::Mutex::new(Vec::new()),
         closed: AtomicBool::new(false),
         close_notify: Notify::new(),
      });
      let peer = MockPeer {
         tx: parking_lot::Mutex::new(Some(tx)),
         io: io.clone(),
      };
      (io, peer)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_reader_and_writer() {
      let (io, peer) = testing::pair();
      let mut jset = JoinSet::new();
      let (mut rx, tx) = spawn_io(&mut jset, Address::any(), io);

      peer.push(&[0x04, 0x00, 0x04, 0x00]);
      assert_eq!(rx.recv().await.unwrap().as_slice(), &[0x04, 0x00, 0x04, 0x00]);

      tx.send(&[0x01, 0x02]).await.unwrap();
      tx.send(&[0x03]).await.unwrap();
      let sent: Vec<Vec<u8>> = peer.sent().iter().map(|p| p.to_vec()).collect();
      assert_eq!(sent, [vec![0x01u8, 0x02], vec![0x03]]);
   }

   #[tokio::test]
   async fn test_shutdown_unblocks_reader() {
      let (io, peer) = testing::pair();
      let mut jset = JoinSet::new();
      let (mut rx, tx) = spawn_io(&mut jset, Address::any(), io);

      let pending = tokio::spawn(async move { rx.recv().await });
      tokio::task::yield_now().await;
      tx.shutdown();
      let res = time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
      assert!(matches!(res, Err(AirPodsError::ConnectionLost)));
      assert!(peer.is_shut_down());
   }

   #[tokio::test]
   async fn test_peer_hang_up() {
      let (io, peer) = testing::pair();
      let mut jset = JoinSet::new();
      let (mut rx, _tx) = spawn_io(&mut jset, Address::any(), io);
      peer.hang_up();
      assert!(matches!(rx.recv().await, Err(AirPodsError::ConnectionLost)));
   }
}

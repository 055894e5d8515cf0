//! Persistent diagnostic log of raw AAP traffic using heed (LMDB).
//!
//! Entries are keyed by a monotonically increasing sequence number, so
//! iteration order is arrival order. Once the log holds its maximum number of
//! entries, each append drops the oldest ones in the same transaction.

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::SystemTime,
};

use bluer::Address;
use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in packet log operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create packet log directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
   Received,
   Sent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
   pub address: [u8; 6],
   pub direction: Direction,
   /// Unix timestamp in milliseconds
   pub timestamp: u64,
   pub bytes: Vec<u8>,
}

impl LogEntry {
   pub fn address(&self) -> Address {
      Address(self.address)
   }
}

/// Big-endian sequence keys sort in insertion order.
struct SeqCodec;

impl<'a> heed::BytesEncode<'a> for SeqCodec {
   type EItem = u64;
   fn bytes_encode(item: &'a Self::EItem) -> Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Owned(item.to_be_bytes().to_vec()))
   }
}

impl<'a> heed::BytesDecode<'a> for SeqCodec {
   type DItem = u64;
   fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid sequence key",
         )));
      };
      Ok(u64::from_be_bytes(s))
   }
}

/// Entries kept by default. Packets are at most one L2CAP MTU, so a full log
/// stays well inside the map.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;
const MAP_SIZE: usize = 16 * 1024 * 1024;

fn unix_millis() -> u64 {
   SystemTime::UNIX_EPOCH
      .elapsed()
      .map_or(0, |d| d.as_millis().try_into().unwrap_or(u64::MAX))
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// Sequence -> `LogEntry`
   packets: Database<SeqCodec, SerdeBincode<LogEntry>>,
   next_seq: AtomicU64,
   max_entries: u64,
}

/// Thread-safe handle to the packet log.
#[derive(Clone, Debug)]
pub struct PacketLog {
   db: Arc<Db>,
}

impl PacketLog {
   /// Opens the log at the default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   /// Opens or creates the log in `path`.
   pub fn open_at(path: &Path) -> Result<Self> {
      Self::open_with_limit(path, DEFAULT_MAX_ENTRIES)
   }

   /// Opens or creates a log in `path` that keeps at most `max_entries`.
   pub fn open_with_limit(path: &Path, max_entries: u64) -> Result<Self> {
      std::fs::create_dir_all(path)?;
      let max_entries = max_entries.max(1);

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(MAP_SIZE)
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let packets: Database<SeqCodec, SerdeBincode<LogEntry>> = env
         .create_database(&mut wtxn, Some("packets"))
         .map_err(Error::DatabaseOperation)?;
      let next_seq = packets
         .last(&wtxn)
         .map_err(Error::DatabaseOperation)?
         .map_or(0, |(seq, _)| seq + 1);
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Packet log opened at {} (next sequence {next_seq})", path.display());
      Ok(Self {
         db: Arc::new(Db {
            env,
            packets,
            next_seq: AtomicU64::new(next_seq),
            max_entries,
         }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("AIRPODS_PACKET_LOG_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/aapd/packet_log
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("aapd").join("packet_log"))
   }

   pub fn append(&self, address: Address, direction: Direction, bytes: &[u8]) -> Result<()> {
      let entry = LogEntry {
         address: address.0,
         direction,
         timestamp: unix_millis(),
         bytes: bytes.to_vec(),
      };
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let seq = self.db.next_seq.fetch_add(1, Ordering::Relaxed);
      self
         .db
         .packets
         .put(&mut wtxn, &seq, &entry)
         .map_err(Error::DatabaseOperation)?;

      if let Some(cutoff) = (seq + 1).checked_sub(self.db.max_entries)
         && cutoff > 0
      {
         self
            .db
            .packets
            .delete_range(&mut wtxn, &(..cutoff))
            .map_err(Error::DatabaseOperation)?;
      }
      wtxn.commit().map_err(Error::Transaction)
   }

   /// All entries in arrival order, optionally restricted to one device.
   pub fn entries(&self, address: Option<Address>) -> Result<Vec<LogEntry>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let mut out = Vec::new();
      for item in self
         .db
         .packets
         .iter(&rtxn)
         .map_err(Error::DatabaseOperation)?
      {
         let (_, entry) = item.map_err(Error::DatabaseOperation)?;
         if address.is_none_or(|a| a.0 == entry.address) {
            out.push(entry);
         }
      }
      Ok(out)
   }

   pub fn len(&self) -> Result<u64> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      self.db.packets.len(&rtxn).map_err(Error::DatabaseOperation)
   }

   pub fn is_empty(&self) -> Result<bool> {
      Ok(self.len()? == 0)
   }

   pub fn clear(&self) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .packets
         .clear(&mut wtxn)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      info!("Packet log cleared");
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const OTHER_ADDRESS: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   #[test]
   fn test_append_and_read_in_order() -> Result<()> {
      let dir = TempDir::new()?;
      let log = PacketLog::open_at(dir.path())?;
      assert!(log.is_empty()?);

      log.append(TEST_ADDRESS, Direction::Sent, &[0x00, 0x00, 0x04, 0x00])?;
      log.append(TEST_ADDRESS, Direction::Received, &[0x04, 0x00, 0x04, 0x00, 0x06, 0x00])?;
      log.append(OTHER_ADDRESS, Direction::Received, &[0x01])?;

      let entries = log.entries(Some(TEST_ADDRESS))?;
      assert_eq!(entries.len(), 2);
      assert_eq!(entries[0].direction, Direction::Sent);
      assert_eq!(entries[1].direction, Direction::Received);
      assert_eq!(entries[1].address(), TEST_ADDRESS);
      assert_eq!(log.len()?, 3);
      Ok(())
   }

   #[test]
   fn test_sequence_survives_reopen() -> Result<()> {
      let dir = TempDir::new()?;
      {
         let log = PacketLog::open_at(dir.path())?;
         log.append(TEST_ADDRESS, Direction::Sent, &[1])?;
         log.append(TEST_ADDRESS, Direction::Sent, &[2])?;
      }
      let log = PacketLog::open_at(dir.path())?;
      log.append(TEST_ADDRESS, Direction::Sent, &[3])?;
      let bytes: Vec<_> = log.entries(None)?.into_iter().map(|e| e.bytes).collect();
      assert_eq!(bytes, [vec![1u8], vec![2], vec![3]]);
      Ok(())
   }

   #[test]
   fn test_oldest_entries_dropped_past_limit() -> Result<()> {
      let dir = TempDir::new()?;
      let log = PacketLog::open_with_limit(dir.path(), 4)?;
      for i in 0..10u8 {
         log.append(TEST_ADDRESS, Direction::Received, &[i])?;
      }
      assert_eq!(log.len()?, 4);
      let bytes: Vec<_> = log.entries(None)?.into_iter().map(|e| e.bytes).collect();
      assert_eq!(bytes, [vec![6u8], vec![7], vec![8], vec![9]]);

      drop(log);
      let log = PacketLog::open_with_limit(dir.path(), 4)?;
      log.append(TEST_ADDRESS, Direction::Sent, &[10])?;
      let bytes: Vec<_> = log.entries(None)?.into_iter().map(|e| e.bytes).collect();
      assert_eq!(bytes, [vec![7u8], vec![8], vec![9], vec![10]]);
      Ok(())
   }

   #[test]
   fn test_clear() -> Result<()> {
      let dir = TempDir::new()?;
      let log = PacketLog::open_at(dir.path())?;
      log.append(TEST_ADDRESS, Direction::Received, &[0xFF])?;
      log.clear()?;
      assert!(log.is_empty()?);
      assert!(log.entries(None)?.is_empty());
      Ok(())
   }
}

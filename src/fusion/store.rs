//! Persistent advertising interval store using heed (LMDB).
//!
//! Learned intervals survive restarts so stale thresholds are right from the
//! first advertisement instead of after a full sampling window.

use std::{borrow::Cow, path::PathBuf, sync::Arc, time::SystemTime};

use bluer::Address;
use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::error::Result;

/// Errors that can occur in tracker store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = Address;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Borrowed(&item.0))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = Address;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(s) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid address",
         )));
      };
      Ok(Address(s))
   }
}

/// Current unix time in seconds, the clock `last_updated` is kept in.
pub fn unix_now() -> u64 {
   SystemTime::UNIX_EPOCH
      .elapsed()
      .map_or(0, |d| d.as_secs())
}

/// A learned interval as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInterval {
   pub source: SmolStr,
   pub interval: f64,
   pub last_updated: u64, // Unix timestamp
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// MAC address -> `StoredInterval`
   intervals: Database<KeyCodec, SerdeBincode<StoredInterval>>,
}

/// Thread-safe handle to the interval database.
#[derive(Clone, Debug)]
pub struct TrackerStore {
   db: Arc<Db>,
}

impl TrackerStore {
   /// Opens or creates the store at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(Self::db_path()?)
   }

   pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
      let path = path.into();
      std::fs::create_dir_all(&path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(1)
            .open(&path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let intervals = env
         .create_database(&mut wtxn, Some("intervals"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Opened tracker store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, intervals }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BLEFUSE_TRACKER_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/blefuse/tracker.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("blefuse").join("tracker.db"))
   }

   /// Writes every interval in one transaction.
   pub fn save(&self, intervals: impl IntoIterator<Item = (Address, StoredInterval)>) -> Result<usize> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let mut count = 0;
      for (address, record) in intervals {
         self
            .db
            .intervals
            .put(&mut wtxn, &address, &record)
            .map_err(Error::DatabaseOperation)?;
         count += 1;
      }
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(count)
   }

   /// Loads intervals updated within `max_age_secs`, deleting older ones.
   pub fn load(&self, max_age_secs: u64) -> Result<Vec<(Address, StoredInterval)>> {
      let cutoff = unix_now().saturating_sub(max_age_secs);
      let mut fresh = Vec::new();
      let mut expired = Vec::new();
      {
         let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
         let iter = self
            .db
            .intervals
            .iter(&rtxn)
            .map_err(Error::DatabaseOperation)?;
         for entry in iter {
            let (address, record) = entry.map_err(Error::DatabaseOperation)?;
            if record.last_updated < cutoff {
               expired.push(address);
            } else {
               fresh.push((address, record));
            }
         }
      }

      if !expired.is_empty() {
         let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
         for address in &expired {
            self
               .db
               .intervals
               .delete(&mut wtxn, address)
               .map_err(Error::DatabaseOperation)?;
         }
         wtxn.commit().map_err(Error::Transaction)?;
         info!("Pruned {} expired advertising intervals", expired.len());
      }
      Ok(fresh)
   }

   /// Deletes the given addresses, returning how many were stored.
   pub fn forget(&self, addresses: &[Address]) -> Result<usize> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let mut removed = 0;
      for address in addresses {
         if self
            .db
            .intervals
            .delete(&mut wtxn, address)
            .map_err(Error::DatabaseOperation)?
         {
            removed += 1;
         }
      }
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(removed)
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const OTHER_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x00]);

   fn record(source: &'static str, interval: f64, age_secs: u64) -> StoredInterval {
      StoredInterval {
         source: SmolStr::new_static(source),
         interval,
         last_updated: unix_now() - age_secs,
      }
   }

   fn create_test_store() -> Result<(TrackerStore, TempDir)> {
      let temp_dir = TempDir::new().unwrap();
      let store = TrackerStore::open_at(temp_dir.path().join("tracker.db"))?;
      Ok((store, temp_dir))
   }

   #[test]
   fn test_save_and_load() -> Result<()> {
      let (store, _dir) = create_test_store()?;
      let saved = store.save([
         (TEST_ADDRESS, record("hci0", 2.5, 0)),
         (OTHER_ADDRESS, record("hci0", 10.0, 0)),
      ])?;
      assert_eq!(saved, 2);

      let mut loaded = store.load(60)?;
      loaded.sort_by_key(|(address, _)| address.0);
      assert_eq!(loaded.len(), 2);
      assert_eq!(loaded[0].0, OTHER_ADDRESS);
      assert_eq!(loaded[1].1.source, "hci0");
      assert_eq!(loaded[1].1.interval, 2.5);
      Ok(())
   }

   #[test]
   fn test_overwrite_and_forget() -> Result<()> {
      let (store, _dir) = create_test_store()?;
      store.save([(TEST_ADDRESS, record("hci0", 2.5, 0))])?;
      store.save([(TEST_ADDRESS, record("hci1", 4.0, 0))])?;

      let loaded = store.load(60)?;
      assert_eq!(loaded.len(), 1);
      assert_eq!(loaded[0].1.source, "hci1");

      assert_eq!(store.forget(&[TEST_ADDRESS, OTHER_ADDRESS])?, 1);
      assert_eq!(store.forget(&[TEST_ADDRESS])?, 0);
      assert!(store.load(60)?.is_empty());
      Ok(())
   }

   #[test]
   fn test_load_prunes_old_records() -> Result<()> {
      let (store, _dir) = create_test_store()?;
      store.save([
         (TEST_ADDRESS, record("hci0", 2.5, 600)),
         (OTHER_ADDRESS, record("hci0", 10.0, 30)),
      ])?;

      let loaded = store.load(300)?;
      assert_eq!(loaded.len(), 1);
      assert_eq!(loaded[0].0, OTHER_ADDRESS);
      assert_eq!(store.forget(&[TEST_ADDRESS])?, 0);
      Ok(())
   }
}

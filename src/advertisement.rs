//! Decoded BLE advertisement as seen by one scanner.
//!
//! An `Advertisement` is immutable once built; the manager shares it as
//! `Arc<Advertisement>` between the fused device views, the per-scanner
//! snapshots and listener callbacks.

use std::{
   collections::{BTreeMap, BTreeSet},
   fmt,
   sync::Arc,
};

use bluer::Address;
use smol_str::SmolStr;
use uuid::Uuid;

/// RSSI used for comparisons when a scanner reports `0` (unknown).
pub const NO_RSSI_VALUE: i16 = -127;

/// Apple company ID for manufacturer data
const APPLE_MFR_ID: u16 = 0x004C;
/// Leading bytes of Apple manufacturer payloads worth keeping
const APPLE_WANTED_START_BYTES: &[u8] = &[
   0x02, // iBeacon
   0x06, // HomeKit
   0x10, // Device id
   0x11, // HomeKit notify
];

/// Shared handle to an immutable advertisement.
pub type SharedAdvertisement = Arc<Advertisement>;

/// A single decoded advertisement from one scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
   pub address: Address,
   /// Signal strength in dBm, `0` when unknown.
   pub rssi: i16,
   pub name: Option<SmolStr>,
   pub service_uuids: BTreeSet<Uuid>,
   pub service_data: BTreeMap<Uuid, Vec<u8>>,
   pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
   pub tx_power: Option<i16>,
   /// Scanner-specific extras, opaque to the fusion layer.
   pub extra: BTreeMap<SmolStr, serde_json::Value>,
   pub source: SmolStr,
   pub connectable: bool,
   /// Monotonic reception time in seconds.
   pub time: f64,
}

impl Advertisement {
   /// Creates an empty advertisement received by `source` at `time`.
   pub fn new(address: Address, source: impl Into<SmolStr>, time: f64) -> Self {
      Self {
         address,
         rssi: 0,
         name: None,
         service_uuids: BTreeSet::new(),
         service_data: BTreeMap::new(),
         manufacturer_data: BTreeMap::new(),
         tx_power: None,
         extra: BTreeMap::new(),
         source: source.into(),
         connectable: true,
         time,
      }
   }

   pub const fn with_rssi(mut self, rssi: i16) -> Self {
      self.rssi = rssi;
      self
   }

   pub fn with_name(mut self, name: impl Into<SmolStr>) -> Self {
      self.name = Some(name.into());
      self
   }

   pub const fn with_connectable(mut self, connectable: bool) -> Self {
      self.connectable = connectable;
      self
   }

   pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
      self.service_uuids.insert(uuid);
      self
   }

   pub fn with_service_data(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
      self.service_data.insert(uuid, data.into());
      self
   }

   pub fn with_manufacturer_data(mut self, id: u16, data: impl Into<Vec<u8>>) -> Self {
      self.manufacturer_data.insert(id, data.into());
      self
   }

   pub const fn with_tx_power(mut self, tx_power: i16) -> Self {
      self.tx_power = Some(tx_power);
      self
   }

   pub fn into_shared(self) -> SharedAdvertisement {
      Arc::new(self)
   }

   /// RSSI for ranking purposes; unknown values rank below any real signal.
   pub const fn effective_rssi(&self) -> i16 {
      if self.rssi == 0 {
         NO_RSSI_VALUE
      } else {
         self.rssi
      }
   }

   /// Whether `other` carries the same payload (ignoring RSSI and time).
   pub fn same_payload(&self, other: &Self) -> bool {
      self.name == other.name
         && self.service_uuids == other.service_uuids
         && self.service_data == other.service_data
         && self.manufacturer_data == other.manufacturer_data
   }

   /// Apple devices flood the air with continuity frames nobody consumes.
   pub fn is_noisy_apple(&self) -> bool {
      if self.manufacturer_data.len() != 1 {
         return false;
      }
      match self.manufacturer_data.get(&APPLE_MFR_ID) {
         Some(data) => data
            .first()
            .is_none_or(|b| !APPLE_WANTED_START_BYTES.contains(b)),
         None => false,
      }
   }
}

impl fmt::Display for Advertisement {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "{} [{}] via {} rssi={} connectable={}",
         self.address,
         self.name.as_deref().unwrap_or("?"),
         self.source,
         self.rssi,
         self.connectable
      )?;
      for (id, data) in &self.manufacturer_data {
         write!(f, " mfr[{id:#06x}]={}", hex::encode(data))?;
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR: Address = Address([0x44, 0x44, 0x33, 0x11, 0x23, 0x45]);

   #[test]
   fn test_unknown_rssi_ranks_lowest() {
      let adv = Advertisement::new(ADDR, "hci0", 0.0);
      assert_eq!(adv.effective_rssi(), NO_RSSI_VALUE);
      assert_eq!(adv.with_rssi(-100).effective_rssi(), -100);
   }

   #[test]
   fn test_same_payload_ignores_signal_and_time() {
      let a = Advertisement::new(ADDR, "hci0", 1.0)
         .with_name("wohand")
         .with_rssi(-60)
         .with_manufacturer_data(1, [0x01]);
      let b = Advertisement::new(ADDR, "hci1", 9.0)
         .with_name("wohand")
         .with_rssi(-90)
         .with_manufacturer_data(1, [0x01]);
      assert!(a.same_payload(&b));

      let c = b.with_manufacturer_data(1, [0x02]);
      assert!(!a.same_payload(&c));
   }

   #[test]
   fn test_noisy_apple_filter() {
      let noisy = Advertisement::new(ADDR, "hci0", 0.0)
         .with_manufacturer_data(APPLE_MFR_ID, [0xd8, 0x2e, 0xad]);
      assert!(noisy.is_noisy_apple());

      for start in [0x02, 0x06, 0x10] {
         let wanted =
            Advertisement::new(ADDR, "hci0", 0.0).with_manufacturer_data(APPLE_MFR_ID, [start, 0, 0]);
         assert!(!wanted.is_noisy_apple(), "start byte {start:#04x}");
      }

      let mixed = noisy.clone().with_manufacturer_data(21, [0x02]);
      assert!(!mixed.is_noisy_apple());

      let empty = Advertisement::new(ADDR, "hci0", 0.0).with_name("empty");
      assert!(!empty.is_noisy_apple());
   }
}

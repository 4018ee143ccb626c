//! Serializable snapshots of the fusion state for the D-Bus interface.

use std::collections::BTreeMap;

use bluer::Address;
use serde::Serialize;
use smol_str::SmolStr;

use super::{
   scanner::{ScannerKind, ScannerSource},
   state::DeviceView,
};
use crate::advertisement::Advertisement;

#[derive(Debug, Clone, Serialize)]
pub struct AdvertisementSummary {
   pub address: String,
   pub name: Option<SmolStr>,
   pub rssi: i16,
   pub tx_power: Option<i16>,
   pub source: SmolStr,
   pub connectable: bool,
   /// Seconds since the advertisement was received.
   pub age: f64,
   pub service_uuids: Vec<String>,
   pub service_data: BTreeMap<String, String>,
   pub manufacturer_data: BTreeMap<u16, String>,
}

impl AdvertisementSummary {
   pub fn new(adv: &Advertisement, now: f64) -> Self {
      Self {
         address: adv.address.to_string(),
         name: adv.name.clone(),
         rssi: adv.rssi,
         tx_power: adv.tx_power,
         source: adv.source.clone(),
         connectable: adv.connectable,
         age: (now - adv.time).max(0.0),
         service_uuids: adv.service_uuids.iter().map(ToString::to_string).collect(),
         service_data: adv
            .service_data
            .iter()
            .map(|(uuid, data)| (uuid.to_string(), hex::encode(data)))
            .collect(),
         manufacturer_data: adv
            .manufacturer_data
            .iter()
            .map(|(id, data)| (*id, hex::encode(data)))
            .collect(),
      }
   }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerDiagnostics {
   pub source: SmolStr,
   pub adapter: SmolStr,
   pub kind: ScannerKind,
   pub connectable: bool,
   pub scanning: bool,
   pub stalled: bool,
   pub last_detection_age: Option<f64>,
   pub discovered_devices: Vec<String>,
}

impl ScannerDiagnostics {
   pub fn new(scanner: &ScannerSource, now: f64) -> Self {
      Self {
         source: scanner.info.source.clone(),
         adapter: scanner.info.adapter.clone(),
         kind: scanner.info.kind,
         connectable: scanner.info.connectable,
         scanning: scanner.scanning,
         stalled: scanner.is_stalled(),
         last_detection_age: scanner.last_detection.map(|t| now - t),
         discovered_devices: {
            let mut addresses: Vec<String> = scanner
               .discovered_all()
               .map(|adv| adv.address.to_string())
               .collect();
            addresses.sort();
            addresses
         },
      }
   }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiagnostics {
   pub address: String,
   pub best_connectable: Option<AdvertisementSummary>,
   pub best_any: Option<AdvertisementSummary>,
   pub stale_threshold: Option<f64>,
   /// Seconds until the freshest view goes unavailable.
   pub unavailable_in: Option<f64>,
   pub learned_interval: Option<f64>,
}

impl DeviceDiagnostics {
   pub fn new(
      address: Address,
      view: &DeviceView,
      now: f64,
      stale_threshold: Option<f64>,
      learned_interval: Option<f64>,
   ) -> Self {
      let newest = [view.best_connectable.as_ref(), view.best_any.as_ref()]
         .into_iter()
         .flatten()
         .map(|adv| adv.time)
         .reduce(f64::max);
      Self {
         address: address.to_string(),
         best_connectable: view
            .best_connectable
            .as_deref()
            .map(|adv| AdvertisementSummary::new(adv, now)),
         best_any: view
            .best_any
            .as_deref()
            .map(|adv| AdvertisementSummary::new(adv, now)),
         stale_threshold,
         unavailable_in: newest
            .zip(stale_threshold)
            .map(|(time, threshold)| time + threshold - now),
         learned_interval,
      }
   }
}

/// Full state dump.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
   pub scanners: Vec<ScannerDiagnostics>,
   pub devices: Vec<DeviceDiagnostics>,
   pub listeners: usize,
   pub unavailable_subscriptions: usize,
   /// Address -> learned advertising interval.
   pub learned_intervals: BTreeMap<String, f64>,
   /// Address -> fallback availability interval.
   pub fallback_intervals: BTreeMap<String, f64>,
}

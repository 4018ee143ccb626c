//! Scanner registry and the per-scanner handles given to scanner drivers.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};
use serde::Serialize;
use smol_str::SmolStr;

use super::manager::{Control, ManagerLink};
use crate::{
   advertisement::{Advertisement, SharedAdvertisement},
   config::FusionConfig,
   error::{FusionError, Result},
   event::StalledScanner,
};

/// Where a scanner's radio lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScannerKind {
   /// An adapter on this host.
   Local,
   /// A proxy forwarding advertisements over the network.
   Remote,
}

/// Registration request for a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerInfo {
   pub source: SmolStr,
   pub adapter: SmolStr,
   pub connectable: bool,
   pub kind: ScannerKind,
}

impl ScannerInfo {
   pub fn local(source: impl Into<SmolStr>, adapter: impl Into<SmolStr>, connectable: bool) -> Self {
      Self {
         source: source.into(),
         adapter: adapter.into(),
         connectable,
         kind: ScannerKind::Local,
      }
   }

   pub fn remote(source: impl Into<SmolStr>, adapter: impl Into<SmolStr>, connectable: bool) -> Self {
      Self {
         kind: ScannerKind::Remote,
         ..Self::local(source, adapter, connectable)
      }
   }
}

/// A registered scanner as seen by the manager.
#[derive(Debug)]
pub struct ScannerSource {
   pub info: ScannerInfo,
   pub scanning: bool,
   pub registered_at: f64,
   pub last_detection: Option<f64>,
   registration: u64,
   stalled: bool,
   discovered: HashMap<Address, SharedAdvertisement>,
}

impl ScannerSource {
   pub const fn registration(&self) -> u64 {
      self.registration
   }

   pub const fn is_stalled(&self) -> bool {
      self.stalled
   }

   /// Latest advertisement this scanner heard from `address`.
   pub fn discovered(&self, address: &Address) -> Option<&SharedAdvertisement> {
      self.discovered.get(address)
   }

   pub fn discovered_all(&self) -> impl Iterator<Item = &SharedAdvertisement> + '_ {
      self.discovered.values()
   }
}

/// All registered scanners, split by connectability.
#[derive(Debug, Default)]
pub struct ScannerRegistry {
   connectable: HashMap<SmolStr, ScannerSource>,
   non_connectable: HashMap<SmolStr, ScannerSource>,
   next_registration: u64,
}

impl ScannerRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   fn class_mut(&mut self, connectable: bool) -> &mut HashMap<SmolStr, ScannerSource> {
      if connectable {
         &mut self.connectable
      } else {
         &mut self.non_connectable
      }
   }

   /// Adds a scanner, returning its registration id.
   ///
   /// Advertisements carry only the source id, so a source may live in one
   /// class at a time.
   pub fn register(&mut self, info: ScannerInfo, now: f64) -> Result<u64> {
      if let Some(existing) = self.get(&info.source) {
         return Err(FusionError::DuplicateSource {
            source_id: info.source,
            connectable: existing.info.connectable,
         });
      }

      self.next_registration += 1;
      let registration = self.next_registration;
      info!(
         "Registered {} scanner {} on {} (connectable: {})",
         info.kind, info.source, info.adapter, info.connectable
      );
      let connectable = info.connectable;
      self.class_mut(connectable).insert(
         info.source.clone(),
         ScannerSource {
            info,
            scanning: true,
            registered_at: now,
            last_detection: None,
            registration,
            stalled: false,
            discovered: HashMap::new(),
         },
      );
      Ok(registration)
   }

   /// Removes the scanner registered under `registration`.
   ///
   /// A stale id (the source was re-registered since) is ignored.
   pub fn unregister(&mut self, source: &str, registration: u64) -> Option<ScannerSource> {
      for connectable in [true, false] {
         let map = self.class_mut(connectable);
         if map.get(source).is_some_and(|s| s.registration == registration) {
            let removed = map.remove(source);
            info!("Unregistered scanner {source}");
            return removed;
         }
      }
      debug!("Ignoring unregister for unknown scanner {source}#{registration}");
      None
   }

   pub fn get(&self, source: &str) -> Option<&ScannerSource> {
      self
         .connectable
         .get(source)
         .or_else(|| self.non_connectable.get(source))
   }

   fn get_mut(&mut self, source: &str) -> Option<&mut ScannerSource> {
      if self.connectable.contains_key(source) {
         self.connectable.get_mut(source)
      } else {
         self.non_connectable.get_mut(source)
      }
   }

   pub fn contains(&self, source: &str) -> bool {
      self.get(source).is_some()
   }

   /// Whether `source` is registered and currently scanning.
   pub fn is_live(&self, source: &str) -> bool {
      self.get(source).is_some_and(|s| s.scanning)
   }

   pub fn kind(&self, source: &str) -> Option<ScannerKind> {
      self.get(source).map(|s| s.info.kind)
   }

   /// Number of connectable scanners, or of all scanners.
   pub fn count(&self, connectable: bool) -> usize {
      if connectable {
         self.connectable.len()
      } else {
         self.connectable.len() + self.non_connectable.len()
      }
   }

   pub fn iter(&self) -> impl Iterator<Item = &ScannerSource> + '_ {
      self.connectable.values().chain(self.non_connectable.values())
   }

   /// Scanners allowed to serve the given class.
   pub fn iter_class(&self, connectable: bool) -> Box<dyn Iterator<Item = &ScannerSource> + '_> {
      if connectable {
         Box::new(self.connectable.values())
      } else {
         Box::new(self.iter())
      }
   }

   pub fn set_scanning(&mut self, source: &str, scanning: bool) -> bool {
      let Some(scanner) = self.get_mut(source) else {
         return false;
      };
      if scanner.scanning != scanning {
         info!("Scanner {source} {} scanning", if scanning { "resumed" } else { "stopped" });
      }
      scanner.scanning = scanning;
      true
   }

   /// Stores `adv` in its scanner's snapshot. Returns `false` for unknown
   /// sources.
   pub fn record(&mut self, adv: &SharedAdvertisement) -> bool {
      let Some(scanner) = self.get_mut(&adv.source) else {
         return false;
      };
      if scanner.stalled {
         info!("Scanner {} is receiving advertisements again", adv.source);
         scanner.stalled = false;
      }
      scanner.last_detection = Some(adv.time);
      scanner.discovered.insert(adv.address, Arc::clone(adv));
      true
   }

   /// Drops snapshot entries for `address` older than `cutoff`.
   pub fn forget_before(&mut self, address: &Address, cutoff: f64) {
      for scanner in self
         .connectable
         .values_mut()
         .chain(self.non_connectable.values_mut())
      {
         if scanner
            .discovered
            .get(address)
            .is_some_and(|adv| adv.time < cutoff)
         {
            scanner.discovered.remove(address);
         }
      }
   }

   /// Marks scanners that have been silent for longer than their timeout.
   ///
   /// Each scanner is reported once per stall; hearing anything resets it.
   pub fn check_stalled(&mut self, now: f64, config: &FusionConfig) -> Vec<StalledScanner> {
      let mut stalled = Vec::new();
      for scanner in self
         .connectable
         .values_mut()
         .chain(self.non_connectable.values_mut())
      {
         if !scanner.scanning || scanner.stalled {
            continue;
         }
         let timeout = match scanner.info.kind {
            ScannerKind::Local => config.scanner_watchdog_timeout_secs,
            ScannerKind::Remote => config.remote_scanner_watchdog_timeout_secs,
         };
         let silent_for = now - scanner.last_detection.unwrap_or(scanner.registered_at);
         if silent_for <= timeout {
            continue;
         }
         warn!(
            "Scanner {} on {} has not seen anything for {silent_for:.0}s",
            scanner.info.source, scanner.info.adapter
         );
         scanner.stalled = true;
         stalled.push(StalledScanner {
            source: scanner.info.source.clone(),
            adapter: scanner.info.adapter.clone(),
            kind: scanner.info.kind,
            silent_for,
         });
      }
      stalled
   }
}

// === Handles ===

struct HandleInner {
   info: ScannerInfo,
   registration: u64,
   link: ManagerLink,
}

impl Drop for HandleInner {
   fn drop(&mut self) {
      self.link.control(Control::UnregisterScanner {
         source: self.info.source.clone(),
         registration: self.registration,
      });
   }
}

/// Handle a scanner driver uses to feed the manager.
///
/// Dropping the last clone unregisters the scanner.
#[derive(Clone)]
pub struct ScannerHandle {
   inner: Arc<HandleInner>,
}

impl ScannerHandle {
   pub(crate) fn new(info: ScannerInfo, registration: u64, link: ManagerLink) -> Self {
      Self {
         inner: Arc::new(HandleInner {
            info,
            registration,
            link,
         }),
      }
   }

   pub fn source(&self) -> &SmolStr {
      &self.inner.info.source
   }

   pub fn info(&self) -> &ScannerInfo {
      &self.inner.info
   }

   /// Manager time to stamp advertisements with.
   pub fn now(&self) -> f64 {
      self.inner.link.now()
   }

   /// Submits an advertisement heard by this scanner.
   ///
   /// The source is overwritten with this scanner's id; a non-connectable
   /// scanner never produces connectable advertisements.
   pub fn on_advertisement(&self, mut adv: Advertisement) {
      adv.source = self.inner.info.source.clone();
      adv.connectable &= self.inner.info.connectable;
      self.inner.link.submit(adv.into_shared());
   }

   /// Reports whether the scanner is currently scanning.
   pub fn set_scanning(&self, scanning: bool) {
      self.inner.link.control(Control::SetScanning {
         source: self.inner.info.source.clone(),
         registration: self.inner.registration,
         scanning,
      });
   }

   /// Latest advertisement per device heard by this scanner.
   pub async fn discovered(&self) -> Result<Vec<SharedAdvertisement>> {
      self.inner.link.scanner_discovered(self.source().clone()).await
   }
}

impl std::fmt::Debug for ScannerHandle {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ScannerHandle")
         .field("source", &self.inner.info.source)
         .field("registration", &self.inner.registration)
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR: Address = Address([0x44, 0x44, 0x33, 0x11, 0x23, 0x45]);

   fn adv(source: &str, time: f64) -> SharedAdvertisement {
      Advertisement::new(ADDR, source, time).with_rssi(-60).into_shared()
   }

   #[test]
   fn test_duplicate_source_rejected_per_class() {
      let mut registry = ScannerRegistry::new();
      registry
         .register(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      let err = registry
         .register(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap_err();
      assert!(matches!(err, FusionError::DuplicateSource { connectable: true, .. }));
      assert_eq!(registry.count(true), 1);
      assert_eq!(registry.count(false), 1);
   }

   #[test]
   fn test_source_cannot_join_the_other_class() {
      let mut registry = ScannerRegistry::new();
      let id = registry
         .register(ScannerInfo::remote("proxy", "esp32", true), 0.0)
         .unwrap();
      let err = registry
         .register(ScannerInfo::remote("proxy", "esp32", false), 0.0)
         .unwrap_err();
      assert!(matches!(err, FusionError::DuplicateSource { connectable: true, .. }));
      assert_eq!(registry.count(false), 1);

      registry.record(&adv("proxy", 5.0));
      let scanner = registry.get("proxy").unwrap();
      assert!(scanner.info.connectable);
      assert_eq!(scanner.last_detection, Some(5.0));

      assert!(registry.unregister("proxy", id).is_some());
      registry
         .register(ScannerInfo::remote("proxy", "esp32", false), 1.0)
         .unwrap();
      assert_eq!(registry.count(true), 0);
      assert_eq!(registry.count(false), 1);
   }

   #[test]
   fn test_counts_by_class() {
      let mut registry = ScannerRegistry::new();
      registry
         .register(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      let id = registry
         .register(ScannerInfo::remote("proxy", "esp32", false), 0.0)
         .unwrap();
      assert_eq!(registry.count(true), 1);
      assert_eq!(registry.count(false), 2);

      assert!(registry.unregister("proxy", id + 1).is_none());
      assert!(registry.unregister("proxy", id).is_some());
      assert_eq!(registry.count(false), 1);
   }

   #[test]
   fn test_record_updates_snapshot() {
      let mut registry = ScannerRegistry::new();
      registry
         .register(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      assert!(registry.record(&adv("hci0", 5.0)));
      assert!(!registry.record(&adv("hci9", 5.0)));

      let scanner = registry.get("hci0").unwrap();
      assert_eq!(scanner.last_detection, Some(5.0));
      assert_eq!(scanner.discovered(&ADDR).map(|a| a.time), Some(5.0));

      registry.forget_before(&ADDR, 6.0);
      assert!(registry.get("hci0").unwrap().discovered(&ADDR).is_none());
   }

   #[test]
   fn test_watchdog_reports_once_per_stall() {
      let config = FusionConfig::default();
      let mut registry = ScannerRegistry::new();
      registry
         .register(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      registry
         .register(ScannerInfo::remote("proxy", "esp32", false), 0.0)
         .unwrap();

      assert!(registry.check_stalled(60.0, &config).is_empty());

      let stalled = registry.check_stalled(100.0, &config);
      assert_eq!(stalled.len(), 1);
      assert_eq!(stalled[0].source, "hci0");
      assert!(registry.check_stalled(120.0, &config).is_empty());

      // Remote proxies get a longer leash.
      let stalled = registry.check_stalled(301.0, &config);
      assert_eq!(stalled.len(), 1);
      assert_eq!(stalled[0].kind, ScannerKind::Remote);

      registry.record(&adv("hci0", 302.0));
      assert!(!registry.get("hci0").unwrap().is_stalled());
      assert_eq!(registry.count(false), 2);
   }

   #[test]
   fn test_stopped_scanner_is_not_live() {
      let mut registry = ScannerRegistry::new();
      registry
         .register(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      assert!(registry.is_live("hci0"));
      registry.set_scanning("hci0", false);
      assert!(!registry.is_live("hci0"));
      assert!(registry.check_stalled(1000.0, &FusionConfig::default()).is_empty());
   }
}

//! Fusion state: best-view selection, listener dispatch and availability.
//!
//! `FusionState` is owned by the manager actor and never touched from more
//! than one task. Every operation takes the current monotonic time
//! explicitly so the whole selection algorithm can be driven with a fake
//! clock.

use std::{
   collections::{BTreeMap, HashMap},
   panic::{self, AssertUnwindSafe},
   sync::Arc,
};

use bluer::Address;
use log::{debug, error, info};
use smol_str::SmolStr;

use super::{
   diagnostics::{DeviceDiagnostics, Diagnostics, ScannerDiagnostics},
   matcher::Matcher,
   scanner::{ScannerInfo, ScannerKind, ScannerRegistry},
   tracker::AdvertisementTracker,
};
use crate::{
   advertisement::{Advertisement, SharedAdvertisement},
   config::FusionConfig,
   error::Result,
   event::{AdvertisementChange, FusionEvent},
};

/// Listener callback for fused advertisements.
pub type AdvertisementCallback = Box<dyn FnMut(&SharedAdvertisement, AdvertisementChange) + Send>;

/// Callback fired with the last known advertisement of a vanished device.
pub type UnavailableCallback = Box<dyn FnMut(&SharedAdvertisement) + Send>;

/// The two classes a device view is tracked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceClass {
   /// Served only by connectable scanners.
   Connectable,
   /// Served by any scanner.
   Any,
}

impl DeviceClass {
   pub const ALL: [Self; 2] = [Self::Connectable, Self::Any];

   pub const fn for_listener(connectable: bool) -> Self {
      if connectable { Self::Connectable } else { Self::Any }
   }
}

/// Current winners for one address.
#[derive(Debug, Clone, Default)]
pub struct DeviceView {
   pub best_connectable: Option<SharedAdvertisement>,
   pub best_any: Option<SharedAdvertisement>,
}

impl DeviceView {
   pub const fn slot(&self, class: DeviceClass) -> Option<&SharedAdvertisement> {
      match class {
         DeviceClass::Connectable => self.best_connectable.as_ref(),
         DeviceClass::Any => self.best_any.as_ref(),
      }
   }

   const fn slot_mut(&mut self, class: DeviceClass) -> &mut Option<SharedAdvertisement> {
      match class {
         DeviceClass::Connectable => &mut self.best_connectable,
         DeviceClass::Any => &mut self.best_any,
      }
   }

   const fn is_empty(&self) -> bool {
      self.best_connectable.is_none() && self.best_any.is_none()
   }
}

#[derive(Debug, Clone, Copy)]
struct Win {
   first_seen: bool,
   changed: bool,
}

#[derive(Debug, Default)]
struct Outcome {
   connectable: Option<Win>,
   any: Option<Win>,
}

impl Outcome {
   const fn get(&self, class: DeviceClass) -> Option<Win> {
      match class {
         DeviceClass::Connectable => self.connectable,
         DeviceClass::Any => self.any,
      }
   }

   const fn set(&mut self, class: DeviceClass, win: Win) {
      match class {
         DeviceClass::Connectable => self.connectable = Some(win),
         DeviceClass::Any => self.any = Some(win),
      }
   }
}

struct Listener {
   matcher: Matcher,
   callback: AdvertisementCallback,
}

struct UnavailableSubscription {
   address: Address,
   class: DeviceClass,
   callback: UnavailableCallback,
}

fn guarded(what: &str, f: impl FnOnce()) {
   if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
      error!("{what} callback panicked");
   }
}

pub struct FusionState {
   config: FusionConfig,
   scanners: ScannerRegistry,
   tracker: AdvertisementTracker,
   devices: HashMap<Address, DeviceView>,
   fallback_intervals: HashMap<Address, f64>,
   listeners: BTreeMap<u64, Listener>,
   unavailable: BTreeMap<u64, UnavailableSubscription>,
   next_id: u64,
   events: Vec<FusionEvent>,
}

impl FusionState {
   pub fn new(config: FusionConfig) -> Self {
      Self {
         tracker: AdvertisementTracker::new(config.advertising_times_needed),
         config,
         scanners: ScannerRegistry::new(),
         devices: HashMap::new(),
         fallback_intervals: HashMap::new(),
         listeners: BTreeMap::new(),
         unavailable: BTreeMap::new(),
         next_id: 0,
         events: Vec::new(),
      }
   }

   const fn next_id(&mut self) -> u64 {
      self.next_id += 1;
      self.next_id
   }

   /// Events produced since the last call.
   pub fn take_events(&mut self) -> Vec<FusionEvent> {
      std::mem::take(&mut self.events)
   }

   pub const fn scanners(&self) -> &ScannerRegistry {
      &self.scanners
   }

   pub const fn tracker(&self) -> &AdvertisementTracker {
      &self.tracker
   }

   pub const fn tracker_mut(&mut self) -> &mut AdvertisementTracker {
      &mut self.tracker
   }

   // === Scanners ===

   pub fn register_scanner(&mut self, info: ScannerInfo, now: f64) -> Result<u64> {
      let event = FusionEvent::ScannerRegistered {
         source: info.source.clone(),
         adapter: info.adapter.clone(),
         connectable: info.connectable,
      };
      let registration = self.scanners.register(info, now)?;
      self.events.push(event);
      Ok(registration)
   }

   /// Removes a scanner and re-homes every view it was serving.
   ///
   /// Views nobody else can serve are dropped and reported unavailable.
   pub fn unregister_scanner(&mut self, source: &str, registration: u64, now: f64) {
      if self.scanners.unregister(source, registration).is_none() {
         return;
      }
      self.tracker.remove_source(source);
      self.events.push(FusionEvent::ScannerUnregistered {
         source: SmolStr::new(source),
      });
      self.reassign_from(source, now, true);
   }

   /// Updates the scanning flag of a scanner.
   ///
   /// Views it was serving move to another scanner when one has a fresh
   /// enough sighting; otherwise they stay until they go stale.
   pub fn set_scanning(&mut self, source: &str, registration: u64, scanning: bool, now: f64) {
      if self
         .scanners
         .get(source)
         .is_none_or(|s| s.registration() != registration)
      {
         return;
      }
      self.scanners.set_scanning(source, scanning);
      if !scanning {
         self.reassign_from(source, now, false);
      }
   }

   fn reassign_from(&mut self, source: &str, now: f64, drop_orphans: bool) {
      let mut affected = Vec::new();
      for (address, view) in &self.devices {
         for class in DeviceClass::ALL {
            if view.slot(class).is_some_and(|adv| adv.source == source) {
               affected.push((*address, class));
            }
         }
      }

      for (address, class) in affected {
         if let Some(alt) = self.reselect(&address, class, now) {
            debug!("{address}: {class} view moved from {source} to {}", alt.source);
            self.set_slot(address, class, alt);
         } else if drop_orphans {
            debug!("{address}: no scanner left for {class} view after {source} went away");
            self.expire(address, class);
         }
      }
   }

   /// Marks silent scanners as stalled and queues an event for each.
   pub fn check_scanners(&mut self, now: f64) {
      let stalled = self.scanners.check_stalled(now, &self.config);
      self
         .events
         .extend(stalled.into_iter().map(FusionEvent::ScannerStalled));
   }

   // === Selection ===

   /// Time after which the view of `address` served by `source` is stale.
   pub fn stale_threshold(&self, address: &Address, source: &str) -> f64 {
      if let Some(fallback) = self.fallback_intervals.get(address) {
         return *fallback;
      }
      let default = match self.scanners.kind(source) {
         Some(ScannerKind::Remote) => self.config.remote_fallback_max_stale_secs,
         _ => self.config.fallback_max_stale_secs,
      };
      match self.tracker.interval(address) {
         Some(interval) => default.max(interval * self.config.stale_interval_multiplier),
         None => default,
      }
   }

   fn should_replace(&self, incumbent: Option<&SharedAdvertisement>, candidate: &Advertisement) -> bool {
      let Some(old) = incumbent else {
         return true;
      };
      if old.source == candidate.source {
         return true;
      }
      if !self.scanners.is_live(&old.source) {
         debug!(
            "{}: switching from {} (no longer scanning) to {}",
            candidate.address, old.source, candidate.source
         );
         return true;
      }
      let mut threshold = self.stale_threshold(&candidate.address, &old.source);
      if self.fallback_intervals.contains_key(&candidate.address) {
         // Buffered scanners deliver late; give the incumbent some slack.
         threshold += self.config.fallback_interval_wobble_secs;
      }
      if candidate.time - old.time > threshold {
         debug!(
            "{}: switching from {} (stale for {:.1}s) to {}",
            candidate.address,
            old.source,
            candidate.time - old.time,
            candidate.source
         );
         return true;
      }
      candidate.effective_rssi() > old.effective_rssi()
   }

   /// Best fresh sighting of `address` among the scanners that may serve
   /// `class`.
   fn reselect(&self, address: &Address, class: DeviceClass, now: f64) -> Option<SharedAdvertisement> {
      let connectable = class == DeviceClass::Connectable;
      self
         .scanners
         .iter_class(connectable)
         .filter(|scanner| scanner.scanning)
         .filter_map(|scanner| scanner.discovered(address))
         .filter(|adv| !connectable || adv.connectable)
         .filter(|adv| now - adv.time <= self.stale_threshold(address, &adv.source))
         .max_by(|a, b| {
            a.effective_rssi()
               .cmp(&b.effective_rssi())
               .then(a.time.total_cmp(&b.time))
         })
         .cloned()
   }

   fn set_slot(&mut self, address: Address, class: DeviceClass, adv: SharedAdvertisement) {
      *self.devices.entry(address).or_default().slot_mut(class) = Some(adv);
   }

   /// Removes a view and fires its unavailable subscriptions.
   fn expire(&mut self, address: Address, class: DeviceClass) {
      let Some(view) = self.devices.get_mut(&address) else {
         return;
      };
      let Some(last) = view.slot_mut(class).take() else {
         return;
      };
      if view.is_empty() {
         self.devices.remove(&address);
         self.tracker.remove_address(&address);
         self.fallback_intervals.remove(&address);
         self.scanners.forget_before(&address, f64::INFINITY);
      }

      info!("{address}: {class} view unavailable (last seen via {})", last.source);
      for sub in self.unavailable.values_mut() {
         if sub.address == address && sub.class == class {
            guarded("unavailable", || (sub.callback)(&last));
         }
      }
      self.events.push(FusionEvent::DeviceUnavailable {
         address,
         connectable: class == DeviceClass::Connectable,
      });
   }

   /// Feeds one advertisement through filtering, selection and dispatch.
   pub fn ingest(&mut self, adv: SharedAdvertisement) {
      if adv.is_noisy_apple() {
         return;
      }
      let Some(scanner) = self.scanners.get(&adv.source) else {
         debug!("Dropping advertisement for {} from unknown scanner {}", adv.address, adv.source);
         return;
      };
      let adv = if adv.connectable && !scanner.info.connectable {
         Arc::new(Advertisement {
            connectable: false,
            ..Advertisement::clone(&adv)
         })
      } else {
         adv
      };

      self.tracker.collect(&adv);
      self.scanners.record(&adv);

      let classes: &[DeviceClass] = if adv.connectable {
         &DeviceClass::ALL
      } else {
         &[DeviceClass::Any]
      };
      let mut outcome = Outcome::default();
      for &class in classes {
         let incumbent = self.devices.get(&adv.address).and_then(|v| v.slot(class));
         if !self.should_replace(incumbent, &adv) {
            continue;
         }
         let win = Win {
            first_seen: incumbent.is_none(),
            changed: incumbent.is_none_or(|old| old.source != adv.source || !old.same_payload(&adv)),
         };
         self.set_slot(adv.address, class, Arc::clone(&adv));
         outcome.set(class, win);
      }

      for listener in self.listeners.values_mut() {
         let class = DeviceClass::for_listener(listener.matcher.requires_connectable());
         let Some(win) = outcome.get(class) else {
            continue;
         };
         if !win.changed || !listener.matcher.matches(&adv) {
            continue;
         }
         let change = if win.first_seen {
            AdvertisementChange::FirstSeen
         } else {
            AdvertisementChange::Update
         };
         guarded("advertisement", || (listener.callback)(&adv, change));
      }
   }

   /// Expires every view that has been silent past its stale threshold.
   pub fn check_unavailable(&mut self, now: f64) {
      let mut expired = Vec::new();
      for (address, view) in &self.devices {
         for class in DeviceClass::ALL {
            if let Some(adv) = view.slot(class)
               && now - adv.time > self.stale_threshold(address, &adv.source)
            {
               expired.push((*address, class));
            }
         }
      }

      for (address, class) in expired {
         if let Some(alt) = self.reselect(&address, class, now) {
            debug!("{address}: {class} view taken over by {}", alt.source);
            self.set_slot(address, class, alt);
         } else {
            self.expire(address, class);
         }
      }
   }

   // === Queries ===

   pub fn best_device(&self, address: &Address, connectable: bool) -> Option<SharedAdvertisement> {
      let view = self.devices.get(address)?;
      if connectable {
         view.best_connectable.clone()
      } else {
         view
            .best_any
            .clone()
            .or_else(|| view.best_connectable.clone())
      }
   }

   pub fn discovered_devices(&self, connectable: bool) -> Vec<SharedAdvertisement> {
      self
         .devices
         .keys()
         .filter_map(|address| self.best_device(address, connectable))
         .collect()
   }

   pub fn scanner_discovered(&self, source: &str) -> Vec<SharedAdvertisement> {
      self
         .scanners
         .get(source)
         .map(|scanner| scanner.discovered_all().cloned().collect())
         .unwrap_or_default()
   }

   pub fn scanner_count(&self, connectable: bool) -> usize {
      self.scanners.count(connectable)
   }

   /// Overrides the stale threshold of `address` until it goes unavailable.
   pub fn set_fallback_interval(&mut self, address: Address, interval: f64) {
      self.fallback_intervals.insert(address, interval);
   }

   pub fn fallback_interval(&self, address: &Address) -> Option<f64> {
      self.fallback_intervals.get(address).copied()
   }

   pub fn learned_interval(&self, address: &Address) -> Option<f64> {
      self.tracker.interval(address)
   }

   // === Subscriptions ===

   /// Registers a listener and replays the current view to address
   /// matchers.
   pub fn register_listener(&mut self, matcher: Matcher, mut callback: AdvertisementCallback) -> u64 {
      if let Some(address) = matcher.address_filter()
         && let Some(adv) = self.best_device(&address, matcher.requires_connectable())
         && matcher.matches(&adv)
      {
         guarded("advertisement", || callback(&adv, AdvertisementChange::FirstSeen));
      }
      let id = self.next_id();
      self.listeners.insert(id, Listener { matcher, callback });
      id
   }

   pub fn unregister_listener(&mut self, id: u64) -> bool {
      self.listeners.remove(&id).is_some()
   }

   pub fn track_unavailable(
      &mut self,
      address: Address,
      connectable: bool,
      callback: UnavailableCallback,
   ) -> u64 {
      let id = self.next_id();
      self.unavailable.insert(
         id,
         UnavailableSubscription {
            address,
            class: DeviceClass::for_listener(connectable),
            callback,
         },
      );
      id
   }

   pub fn untrack_unavailable(&mut self, id: u64) -> bool {
      self.unavailable.remove(&id).is_some()
   }

   /// Drops every listener and subscription.
   pub fn clear_subscriptions(&mut self) {
      self.listeners.clear();
      self.unavailable.clear();
   }

   pub fn diagnostics(&self, now: f64) -> Diagnostics {
      let mut scanners: Vec<ScannerDiagnostics> = self
         .scanners
         .iter()
         .map(|scanner| ScannerDiagnostics::new(scanner, now))
         .collect();
      scanners.sort_by(|a, b| a.source.cmp(&b.source));

      let mut devices: Vec<DeviceDiagnostics> = self
         .devices
         .iter()
         .map(|(address, view)| {
            DeviceDiagnostics::new(
               *address,
               view,
               now,
               view.best_any
                  .as_ref()
                  .or(view.best_connectable.as_ref())
                  .map(|adv| self.stale_threshold(address, &adv.source)),
               self.tracker.interval(address),
            )
         })
         .collect();
      devices.sort_by(|a, b| a.address.cmp(&b.address));

      Diagnostics {
         scanners,
         devices,
         listeners: self.listeners.len(),
         unavailable_subscriptions: self.unavailable.len(),
         learned_intervals: self
            .tracker
            .intervals()
            .map(|(address, interval)| (address.to_string(), interval))
            .collect(),
         fallback_intervals: self
            .fallback_intervals
            .iter()
            .map(|(address, interval)| (address.to_string(), *interval))
            .collect(),
      }
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;

   const ADDR: Address = Address([0x44, 0x44, 0x33, 0x11, 0x23, 0x45]);
   const OTHER: Address = Address([0x44, 0x44, 0x33, 0x11, 0x23, 0x46]);

   fn state() -> FusionState {
      let mut state = FusionState::new(FusionConfig::default());
      state
         .register_scanner(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      state
         .register_scanner(ScannerInfo::local("hci1", "hci1", true), 0.0)
         .unwrap();
      state
   }

   fn adv(source: &str, rssi: i16, time: f64) -> SharedAdvertisement {
      Advertisement::new(ADDR, source, time)
         .with_name("wohand")
         .with_rssi(rssi)
         .into_shared()
   }

   type Seen = Arc<Mutex<Vec<(SmolStr, AdvertisementChange)>>>;

   fn recorder() -> (Seen, AdvertisementCallback) {
      let seen: Seen = Arc::default();
      let sink = Arc::clone(&seen);
      (
         seen,
         Box::new(move |adv: &SharedAdvertisement, change: AdvertisementChange| {
            sink.lock().push((adv.source.clone(), change));
         }),
      )
   }

   fn counter() -> (Arc<Mutex<usize>>, UnavailableCallback) {
      let count = Arc::new(Mutex::new(0));
      let sink = Arc::clone(&count);
      (count, Box::new(move |_: &SharedAdvertisement| *sink.lock() += 1))
   }

   fn best_source(state: &FusionState, connectable: bool) -> Option<SmolStr> {
      state
         .best_device(&ADDR, connectable)
         .map(|adv| adv.source.clone())
   }

   #[test]
   fn test_stronger_scanner_wins_and_loser_takes_over_on_unregister() {
      let mut state = state();
      state.ingest(adv("hci0", -100, 1.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));

      state.ingest(adv("hci1", -60, 2.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));
      assert_eq!(best_source(&state, false).as_deref(), Some("hci1"));

      let registration = state.scanners().get("hci1").unwrap().registration();
      state.unregister_scanner("hci1", registration, 3.0);
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));
      assert_eq!(state.scanner_count(true), 1);
   }

   #[test]
   fn test_weaker_or_equal_signal_does_not_switch() {
      let mut state = state();
      state.ingest(adv("hci0", -60, 1.0));
      state.ingest(adv("hci1", -60, 2.0));
      assert_eq!(best_source(&state, false).as_deref(), Some("hci0"));
      state.ingest(adv("hci1", -62, 3.0));
      assert_eq!(best_source(&state, false).as_deref(), Some("hci0"));
      state.ingest(adv("hci1", -59, 4.0));
      assert_eq!(best_source(&state, false).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_unknown_rssi_ranks_below_everything() {
      let mut state = state();
      state.ingest(adv("hci0", 0, 1.0));
      state.ingest(adv("hci1", -100, 2.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));
      state.ingest(adv("hci0", 0, 3.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_same_source_always_replaces() {
      let mut state = state();
      state.ingest(adv("hci0", -40, 1.0));
      state.ingest(adv("hci0", -90, 2.0));
      let best = state.best_device(&ADDR, false).unwrap();
      assert_eq!(best.rssi, -90);
      assert_eq!(best.time, 2.0);
   }

   #[test]
   fn test_stale_incumbent_is_replaced_by_weaker_scanner() {
      let mut state = state();
      state.ingest(adv("hci0", -60, 0.0));
      state.ingest(adv("hci1", -110, 59.0));
      assert_eq!(best_source(&state, false).as_deref(), Some("hci0"));
      state.ingest(adv("hci1", -110, 61.0));
      assert_eq!(best_source(&state, false).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_non_connectable_scanner_only_serves_any_class() {
      let mut state = state();
      state
         .register_scanner(ScannerInfo::remote("proxy", "esp32", false), 0.0)
         .unwrap();
      state.ingest(adv("proxy", -50, 1.0));

      assert!(state.best_device(&ADDR, true).is_none());
      let best = state.best_device(&ADDR, false).unwrap();
      assert_eq!(best.source, "proxy");
      assert!(!best.connectable);
      assert_eq!(state.discovered_devices(true).len(), 0);
      assert_eq!(state.discovered_devices(false).len(), 1);
   }

   #[test]
   fn test_connectable_and_any_views_diverge() {
      let mut state = state();
      state
         .register_scanner(ScannerInfo::remote("proxy", "esp32", false), 0.0)
         .unwrap();
      state.ingest(adv("hci0", -100, 1.0));
      state.ingest(adv("proxy", -60, 2.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));
      assert_eq!(best_source(&state, false).as_deref(), Some("proxy"));
   }

   #[test]
   fn test_unknown_source_and_noisy_apple_are_dropped() {
      let mut state = state();
      state.ingest(adv("hci9", -40, 1.0));
      assert!(state.best_device(&ADDR, false).is_none());

      let noisy = Advertisement::new(ADDR, "hci0", 1.0)
         .with_manufacturer_data(0x004C, [0xd8, 0x2e])
         .into_shared();
      state.ingest(noisy);
      assert!(state.best_device(&ADDR, false).is_none());
   }

   #[test]
   fn test_duplicate_registration_leaves_counts() {
      let mut state = state();
      assert!(
         state
            .register_scanner(ScannerInfo::local("hci0", "hci0", true), 0.0)
            .is_err()
      );
      let id = state
         .register_scanner(ScannerInfo::local("hci2", "hci2", true), 0.0)
         .unwrap();
      assert_eq!(state.scanner_count(true), 3);
      state.unregister_scanner("hci2", id, 1.0);
      assert_eq!(state.scanner_count(true), 2);
      assert_eq!(state.scanner_count(false), 2);
   }

   #[test]
   fn test_dispatch_first_seen_then_update_and_suppress_unchanged() {
      let mut state = state();
      let (seen, callback) = recorder();
      state.register_listener(Matcher::address(ADDR), callback);

      state.ingest(adv("hci0", -60, 1.0));
      state.ingest(adv("hci0", -61, 2.0));
      let changed = Advertisement::new(ADDR, "hci0", 3.0)
         .with_name("wohand")
         .with_rssi(-61)
         .with_manufacturer_data(2409, [0x01])
         .into_shared();
      state.ingest(changed);
      // Loses on signal; nothing to report.
      state.ingest(adv("hci1", -90, 4.0));

      let seen = seen.lock();
      assert_eq!(
         *seen,
         vec![
            (SmolStr::new("hci0"), AdvertisementChange::FirstSeen),
            (SmolStr::new("hci0"), AdvertisementChange::Update),
         ]
      );
   }

   #[test]
   fn test_connectable_listener_ignores_non_connectable_wins() {
      let mut state = state();
      state
         .register_scanner(ScannerInfo::remote("proxy", "esp32", false), 0.0)
         .unwrap();
      let (seen, callback) = recorder();
      state.register_listener(Matcher::address(ADDR).connectable(true), callback);

      state.ingest(adv("proxy", -50, 1.0));
      assert!(seen.lock().is_empty());
      state.ingest(adv("hci0", -80, 2.0));
      assert_eq!(seen.lock().len(), 1);
   }

   #[test]
   fn test_register_listener_replays_current_view() {
      let mut state = state();
      state.ingest(adv("hci0", -60, 1.0));

      let (seen, callback) = recorder();
      state.register_listener(Matcher::address(ADDR), callback);
      assert_eq!(seen.lock().len(), 1);

      let (others, callback) = recorder();
      state.register_listener(Matcher::address(OTHER), callback);
      assert!(others.lock().is_empty());
   }

   #[test]
   fn test_unregistered_listener_is_silent() {
      let mut state = state();
      let (seen, callback) = recorder();
      let id = state.register_listener(Matcher::any(), callback);
      assert!(state.unregister_listener(id));
      assert!(!state.unregister_listener(id));
      state.ingest(adv("hci0", -60, 1.0));
      assert!(seen.lock().is_empty());
   }

   #[test]
   fn test_panicking_listener_does_not_starve_others() {
      let mut state = state();
      state.register_listener(Matcher::any(), Box::new(|_: &SharedAdvertisement, _| panic!("boom")));
      let (seen, callback) = recorder();
      state.register_listener(Matcher::any(), callback);
      state.ingest(adv("hci0", -60, 1.0));
      assert_eq!(seen.lock().len(), 1);
   }

   #[test]
   fn test_unavailable_fires_once_and_rearms() {
      let mut state = state();
      let (fired, callback) = counter();
      state.track_unavailable(ADDR, false, callback);

      state.ingest(adv("hci0", -60, 0.0));
      state.check_unavailable(30.0);
      assert_eq!(*fired.lock(), 0);

      state.check_unavailable(61.0);
      assert_eq!(*fired.lock(), 1);
      assert!(state.best_device(&ADDR, false).is_none());
      state.check_unavailable(200.0);
      assert_eq!(*fired.lock(), 1);

      state.ingest(adv("hci0", -60, 300.0));
      state.check_unavailable(400.0);
      assert_eq!(*fired.lock(), 2);

      let events = state.take_events();
      assert!(events.contains(&FusionEvent::DeviceUnavailable {
         address: ADDR,
         connectable: false,
      }));
   }

   #[test]
   fn test_sweep_hands_view_to_scanner_that_still_hears_device() {
      let mut state = state();
      let (fired, callback) = counter();
      state.track_unavailable(ADDR, true, callback);

      state.ingest(adv("hci1", -50, 0.0));
      state.ingest(adv("hci0", -90, 30.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));

      state.check_unavailable(70.0);
      assert_eq!(*fired.lock(), 0);
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));
   }

   #[test]
   fn test_unregister_without_alternative_is_immediately_unavailable() {
      let mut state = state();
      let (fired, callback) = counter();
      state.track_unavailable(ADDR, true, callback);
      state.ingest(adv("hci0", -60, 1.0));

      let registration = state.scanners().get("hci0").unwrap().registration();
      state.unregister_scanner("hci0", registration, 2.0);
      assert_eq!(*fired.lock(), 1);
      assert!(state.best_device(&ADDR, true).is_none());
   }

   #[test]
   fn test_stopped_scanner_hands_over_or_keeps_view() {
      let mut state = state();
      state.ingest(adv("hci1", -50, 1.0));
      let hci1 = state.scanners().get("hci1").unwrap().registration();

      // No alternative: the stale view stays.
      state.set_scanning("hci1", hci1, false, 2.0);
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));

      // Any other scanner now wins regardless of signal.
      state.ingest(adv("hci0", -95, 3.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));

      state.set_scanning("hci1", hci1, true, 4.0);
      state.ingest(adv("hci1", -50, 5.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));
      state.set_scanning("hci1", hci1, false, 6.0);
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));
   }

   #[test]
   fn test_learned_interval_extends_threshold() {
      let config = FusionConfig {
         advertising_times_needed: 2,
         ..FusionConfig::default()
      };
      let mut state = FusionState::new(config);
      state
         .register_scanner(ScannerInfo::local("hci0", "hci0", true), 0.0)
         .unwrap();
      state.ingest(adv("hci0", -60, 0.0));
      state.ingest(adv("hci0", -60, 30.0));
      assert_eq!(state.learned_interval(&ADDR), Some(30.0));
      assert_eq!(state.stale_threshold(&ADDR, "hci0"), 120.0);

      state.check_unavailable(100.0);
      assert!(state.best_device(&ADDR, false).is_some());
      state.check_unavailable(151.0);
      assert!(state.best_device(&ADDR, false).is_none());
      assert!(state.learned_interval(&ADDR).is_none());
   }

   #[test]
   fn test_remote_scanner_default_threshold() {
      let mut state = FusionState::new(FusionConfig::default());
      state
         .register_scanner(ScannerInfo::remote("proxy", "esp32", true), 0.0)
         .unwrap();
      state.ingest(adv("proxy", -60, 0.0));
      assert_eq!(state.stale_threshold(&ADDR, "proxy"), 195.0);
      state.check_unavailable(100.0);
      assert!(state.best_device(&ADDR, false).is_some());
   }

   #[test]
   fn test_fallback_interval_overrides_and_is_forgotten() {
      let mut state = state();
      state.ingest(adv("hci0", -60, 0.0));
      state.set_fallback_interval(ADDR, 10.0);
      assert_eq!(state.fallback_interval(&ADDR), Some(10.0));

      state.check_unavailable(11.0);
      assert!(state.best_device(&ADDR, false).is_none());
      assert!(state.fallback_interval(&ADDR).is_none());
   }

   #[test]
   fn test_fallback_interval_switch_waits_for_wobble() {
      let mut state = state();
      state.ingest(adv("hci0", -90, 50.0));
      state.set_fallback_interval(ADDR, 10.0);

      state.ingest(adv("hci1", -99, 50.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));
      state.ingest(adv("hci1", -99, 61.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci0"));
      state.ingest(adv("hci1", -99, 66.0));
      assert_eq!(best_source(&state, true).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_watchdog_emits_stall_event() {
      let mut state = state();
      state.take_events();
      state.check_scanners(100.0);
      let events = state.take_events();
      assert_eq!(events.len(), 2);
      assert!(
         events
            .iter()
            .all(|e| matches!(e, FusionEvent::ScannerStalled(_)))
      );
      assert_eq!(state.scanner_count(false), 2);
   }

   #[test]
   fn test_diagnostics_snapshot() {
      let mut state = state();
      state.ingest(adv("hci0", -60, 1.0));
      let diagnostics = state.diagnostics(2.0);
      assert_eq!(diagnostics.scanners.len(), 2);
      assert_eq!(diagnostics.devices.len(), 1);
      assert_eq!(diagnostics.devices[0].stale_threshold, Some(60.0));
      assert_eq!(diagnostics.devices[0].unavailable_in, Some(59.0));
      let hci0 = diagnostics
         .scanners
         .iter()
         .find(|s| s.source == "hci0")
         .unwrap();
      assert_eq!(hci0.discovered_devices, vec![ADDR.to_string()]);
   }
}

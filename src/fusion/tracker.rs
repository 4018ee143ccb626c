//! Advertising interval tracker.
//!
//! Learns how often a device advertises by collecting a fixed window of
//! reception times from the first scanner that hears it. Once the window is
//! full the largest gap becomes the device's interval, which feeds the
//! adaptive stale/unavailable thresholds.

use std::collections::HashMap;

use bluer::Address;
use heapless::Deque;
use log::debug;
use smol_str::SmolStr;

use crate::advertisement::Advertisement;

/// Upper bound on the sample window.
pub const MAX_ADVERTISING_TIMES: usize = 32;

type Timings = Deque<f64, MAX_ADVERTISING_TIMES>;

#[derive(Debug)]
pub struct AdvertisementTracker {
   needed: usize,
   intervals: HashMap<Address, f64>,
   sources: HashMap<Address, SmolStr>,
   timings: HashMap<Address, Timings>,
   /// Unix time restored intervals were last confirmed, until heard again.
   restored: HashMap<Address, u64>,
   forgotten: Vec<Address>,
}

impl AdvertisementTracker {
   pub fn new(advertising_times_needed: usize) -> Self {
      Self {
         needed: advertising_times_needed.clamp(2, MAX_ADVERTISING_TIMES),
         intervals: HashMap::new(),
         sources: HashMap::new(),
         timings: HashMap::new(),
         restored: HashMap::new(),
         forgotten: Vec::new(),
      }
   }

   /// Records the reception time of `adv`.
   pub fn collect(&mut self, adv: &Advertisement) {
      let address = adv.address;
      if self.intervals.contains_key(&address) {
         if self.sources.get(&address) == Some(&adv.source) {
            self.restored.remove(&address);
         }
         return;
      }

      let Some(tracked_source) = self.sources.get(&address) else {
         self.sources.insert(address, adv.source.clone());
         let mut timings = Timings::new();
         let _ = timings.push_back(adv.time);
         self.timings.insert(address, timings);
         return;
      };
      if *tracked_source != adv.source {
         return;
      }

      let timings = self.timings.entry(address).or_default();
      if timings.back().is_some_and(|&last| adv.time < last) {
         // Clock went backwards for this source; start over.
         timings.clear();
      }
      if timings.is_full() {
         timings.pop_front();
      }
      let _ = timings.push_back(adv.time);
      if timings.len() < self.needed {
         return;
      }

      let max_gap = timings
         .iter()
         .zip(timings.iter().skip(1))
         .map(|(prev, next)| next - prev)
         .fold(0.0_f64, f64::max);
      debug!(
         "{address}: learned advertising interval {max_gap:.2}s from {} samples via {}",
         timings.len(),
         adv.source
      );
      self.intervals.insert(address, max_gap);
      self.timings.remove(&address);
   }

   /// Learned advertising interval for `address`.
   pub fn interval(&self, address: &Address) -> Option<f64> {
      self.intervals.get(address).copied()
   }

   /// Source the interval of `address` is (being) learned from.
   pub fn source(&self, address: &Address) -> Option<&SmolStr> {
      self.sources.get(address)
   }

   pub fn intervals(&self) -> impl Iterator<Item = (&Address, f64)> + '_ {
      self.intervals.iter().map(|(a, i)| (a, *i))
   }

   /// Seeds an interval from persistent storage, last confirmed at
   /// `last_updated` (unix seconds).
   pub fn restore(&mut self, address: Address, source: SmolStr, interval: f64, last_updated: u64) {
      self.sources.insert(address, source);
      self.timings.remove(&address);
      self.intervals.insert(address, interval);
      self.restored.insert(address, last_updated);
   }

   /// Stored timestamp of a restored interval its source has not confirmed
   /// since.
   pub fn restored_at(&self, address: &Address) -> Option<u64> {
      self.restored.get(address).copied()
   }

   /// Forgets everything about `address` so it is learned again.
   pub fn remove_address(&mut self, address: &Address) {
      if self.intervals.remove(address).is_some() {
         self.forgotten.push(*address);
      }
      self.sources.remove(address);
      self.timings.remove(address);
      self.restored.remove(address);
   }

   /// Addresses whose learned interval was dropped since the last call.
   pub fn take_forgotten(&mut self) -> Vec<Address> {
      std::mem::take(&mut self.forgotten)
   }

   /// Drops in-progress windows collected from `source`.
   ///
   /// Learned intervals are kept; they describe the device, not the scanner.
   pub fn remove_source(&mut self, source: &str) {
      let pending: Vec<Address> = self
         .sources
         .iter()
         .filter(|(address, s)| s.as_str() == source && !self.intervals.contains_key(*address))
         .map(|(address, _)| *address)
         .collect();
      for address in pending {
         self.sources.remove(&address);
         self.timings.remove(&address);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR: Address = Address([0x44, 0x44, 0x33, 0x11, 0x23, 0x12]);

   fn adv(source: &str, time: f64) -> Advertisement {
      Advertisement::new(ADDR, source, time)
   }

   #[test]
   fn test_learns_max_gap_once_window_is_full() {
      let mut tracker = AdvertisementTracker::new(6);
      let times = [0.0, 1.0, 2.0, 5.5, 6.0, 7.0];
      for (i, t) in times.iter().enumerate() {
         tracker.collect(&adv("hci0", *t));
         if i < times.len() - 1 {
            assert!(tracker.interval(&ADDR).is_none());
         }
      }
      assert_eq!(tracker.interval(&ADDR), Some(3.5));
   }

   #[test]
   fn test_ignores_other_sources() {
      let mut tracker = AdvertisementTracker::new(3);
      tracker.collect(&adv("hci0", 0.0));
      tracker.collect(&adv("hci1", 0.1));
      tracker.collect(&adv("hci1", 0.2));
      tracker.collect(&adv("hci0", 2.0));
      assert!(tracker.interval(&ADDR).is_none());
      tracker.collect(&adv("hci0", 4.0));
      assert_eq!(tracker.interval(&ADDR), Some(2.0));
      assert_eq!(tracker.source(&ADDR).map(SmolStr::as_str), Some("hci0"));
   }

   #[test]
   fn test_remove_source_drops_pending_window() {
      let mut tracker = AdvertisementTracker::new(3);
      tracker.collect(&adv("hci0", 0.0));
      tracker.collect(&adv("hci0", 1.0));
      tracker.remove_source("hci0");
      assert!(tracker.source(&ADDR).is_none());

      // Next advertisement from another scanner starts a fresh window.
      tracker.collect(&adv("hci1", 10.0));
      assert_eq!(tracker.source(&ADDR).map(SmolStr::as_str), Some("hci1"));
   }

   #[test]
   fn test_remove_address_relearns() {
      let mut tracker = AdvertisementTracker::new(2);
      tracker.collect(&adv("hci0", 0.0));
      tracker.collect(&adv("hci0", 5.0));
      assert_eq!(tracker.interval(&ADDR), Some(5.0));

      tracker.remove_address(&ADDR);
      assert!(tracker.interval(&ADDR).is_none());
      assert_eq!(tracker.take_forgotten(), vec![ADDR]);
      assert!(tracker.take_forgotten().is_empty());

      tracker.collect(&adv("hci1", 10.0));
      tracker.collect(&adv("hci1", 12.0));
      assert_eq!(tracker.interval(&ADDR), Some(2.0));
   }

   #[test]
   fn test_pending_window_is_not_reported_forgotten() {
      let mut tracker = AdvertisementTracker::new(4);
      tracker.collect(&adv("hci0", 0.0));
      tracker.remove_address(&ADDR);
      assert!(tracker.take_forgotten().is_empty());
   }

   #[test]
   fn test_restore_seeds_interval_until_confirmed() {
      let mut tracker = AdvertisementTracker::new(16);
      tracker.restore(ADDR, SmolStr::new_static("hci0"), 8.0, 1_000);
      assert_eq!(tracker.interval(&ADDR), Some(8.0));
      assert_eq!(tracker.restored_at(&ADDR), Some(1_000));

      tracker.collect(&adv("hci1", 0.0));
      assert_eq!(tracker.restored_at(&ADDR), Some(1_000));
      tracker.collect(&adv("hci0", 0.0));
      assert_eq!(tracker.interval(&ADDR), Some(8.0));
      assert!(tracker.restored_at(&ADDR).is_none());
   }
}

//! Passive coordinator: advertisement-driven data for a single device.

use std::{
   collections::BTreeMap,
   sync::{Arc, Weak},
};

use bluer::Address;
use log::{debug, info};
use parking_lot::Mutex;

use super::{CoordinatorHandle, CoordinatorState, CoordinatorUpdate, ListenerHandle};
use crate::{
   advertisement::SharedAdvertisement,
   error::{FusionError, Result},
   fusion::{FusionManager, Matcher},
};

type UpdateMethod<T> = Box<dyn Fn(&SharedAdvertisement) -> T + Send + Sync>;
type Listener<T> = Arc<dyn Fn(&CoordinatorUpdate<T>) + Send + Sync>;

struct PassiveState<T> {
   status: CoordinatorState,
   started: bool,
   data: Option<Arc<T>>,
   last_advertisement: Option<SharedAdvertisement>,
   last_seen: Option<f64>,
   listeners: BTreeMap<u64, Listener<T>>,
   next_listener: u64,
}

struct PassiveInner<T> {
   manager: FusionManager,
   address: Address,
   connectable: bool,
   update_method: UpdateMethod<T>,
   state: Mutex<PassiveState<T>>,
}

impl<T: Send + Sync + 'static> PassiveInner<T> {
   fn is_active(&self) -> bool {
      self.state.lock().started && !self.manager.is_shutting_down()
   }

   fn handle_advertisement(&self, adv: &SharedAdvertisement) {
      if !self.is_active() {
         return;
      }
      let data = Arc::new((self.update_method)(adv));
      let previous = {
         let mut state = self.state.lock();
         state.last_advertisement = Some(adv.clone());
         state.last_seen = Some(adv.time);
         std::mem::replace(&mut state.status, CoordinatorState::Available)
      };
      if previous == CoordinatorState::Unavailable {
         info!("{} is available again via {}", self.address, adv.source);
      }
      self.store_and_notify(data);
   }

   fn handle_unavailable(&self) {
      if !self.is_active() {
         return;
      }
      {
         let mut state = self.state.lock();
         if state.status == CoordinatorState::Unavailable {
            return;
         }
         state.status = CoordinatorState::Unavailable;
      }
      info!("{} is no longer seen", self.address);
      self.notify(&CoordinatorUpdate::Unavailable);
   }

   fn store_and_notify(&self, data: Arc<T>) {
      self.state.lock().data = Some(Arc::clone(&data));
      self.notify(&CoordinatorUpdate::Data(data));
   }

   fn notify(&self, update: &CoordinatorUpdate<T>) {
      // Listeners may add or remove listeners.
      let listeners: Vec<Listener<T>> = self.state.lock().listeners.values().cloned().collect();
      for listener in listeners {
         listener(update);
      }
   }
}

/// Keeps typed data for one device up to date from its advertisements.
///
/// Every fused advertisement for the address is run through the update
/// method and the result handed to all listeners. When the manager reports
/// the device unavailable, listeners are told so once until it reappears.
pub struct PassiveUpdateCoordinator<T> {
   inner: Arc<PassiveInner<T>>,
}

impl<T> Clone for PassiveUpdateCoordinator<T> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<T: Send + Sync + 'static> PassiveUpdateCoordinator<T> {
   pub fn new(
      manager: FusionManager,
      address: Address,
      connectable: bool,
      update_method: impl Fn(&SharedAdvertisement) -> T + Send + Sync + 'static,
   ) -> Self {
      Self {
         inner: Arc::new(PassiveInner {
            manager,
            address,
            connectable,
            update_method: Box::new(update_method),
            state: Mutex::new(PassiveState {
               status: CoordinatorState::NoData,
               started: false,
               data: None,
               last_advertisement: None,
               last_seen: None,
               listeners: BTreeMap::new(),
               next_listener: 0,
            }),
         }),
      }
   }

   pub fn address(&self) -> Address {
      self.inner.address
   }

   pub fn connectable(&self) -> bool {
      self.inner.connectable
   }

   pub fn manager(&self) -> &FusionManager {
      &self.inner.manager
   }

   pub fn state(&self) -> CoordinatorState {
      self.inner.state.lock().status
   }

   pub fn available(&self) -> bool {
      self.state() == CoordinatorState::Available
   }

   /// Manager time of the last advertisement seen.
   pub fn last_seen(&self) -> Option<f64> {
      self.inner.state.lock().last_seen
   }

   /// Last data handed to listeners. Retained across unavailability.
   pub fn data(&self) -> Option<Arc<T>> {
      self.inner.state.lock().data.clone()
   }

   pub fn last_advertisement(&self) -> Option<SharedAdvertisement> {
      self.inner.state.lock().last_advertisement.clone()
   }

   pub fn is_started(&self) -> bool {
      self.inner.is_active()
   }

   pub fn add_listener(
      &self,
      listener: impl Fn(&CoordinatorUpdate<T>) + Send + Sync + 'static,
   ) -> ListenerHandle {
      let id = {
         let mut state = self.inner.state.lock();
         let id = state.next_listener;
         state.next_listener += 1;
         state.listeners.insert(id, Arc::new(listener));
         id
      };
      let weak: Weak<PassiveInner<T>> = Arc::downgrade(&self.inner);
      ListenerHandle::new(move || {
         if let Some(inner) = weak.upgrade() {
            inner.state.lock().listeners.remove(&id);
         }
      })
   }

   /// Hands externally obtained data (e.g. a poll result) to listeners.
   pub(crate) fn push_data(&self, data: T) {
      if self.inner.is_active() {
         self.inner.store_and_notify(Arc::new(data));
      }
   }

   /// Attaches to the manager.
   ///
   /// A device the manager already knows about is delivered right away.
   pub async fn start(&self) -> Result<CoordinatorHandle> {
      {
         let mut state = self.inner.state.lock();
         if state.started {
            return Err(FusionError::AlreadyStarted);
         }
         state.started = true;
      }

      match self.subscribe().await {
         Ok(handle) => {
            debug!("Started coordinator for {}", self.inner.address);
            Ok(handle)
         },
         Err(e) => {
            self.inner.state.lock().started = false;
            Err(e)
         },
      }
   }

   async fn subscribe(&self) -> Result<CoordinatorHandle> {
      let matcher = Matcher::address(self.inner.address).connectable(self.inner.connectable);

      let weak = Arc::downgrade(&self.inner);
      let listener = self
         .inner
         .manager
         .register_callback(matcher, move |adv, _change| {
            if let Some(inner) = weak.upgrade() {
               inner.handle_advertisement(adv);
            }
         })
         .await?;

      let weak = Arc::downgrade(&self.inner);
      let unavailable = self
         .inner
         .manager
         .track_unavailable(self.inner.address, self.inner.connectable, move |_adv| {
            if let Some(inner) = weak.upgrade() {
               inner.handle_unavailable();
            }
         })
         .await?;

      let weak = Arc::downgrade(&self.inner);
      Ok(CoordinatorHandle::new(vec![listener, unavailable], move || {
         if let Some(inner) = weak.upgrade() {
            inner.state.lock().started = false;
            debug!("Stopped coordinator for {}", inner.address);
         }
      }))
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;
   use crate::{
      advertisement::Advertisement,
      config::FusionConfig,
      event::NullBus,
      fusion::{ScannerHandle, ScannerInfo},
   };

   const ADDR: Address = Address([0x44, 0x44, 0x33, 0x11, 0x23, 0x45]);

   type Log = Arc<Mutex<Vec<String>>>;

   async fn setup() -> (FusionManager, ScannerHandle, PassiveUpdateCoordinator<i16>) {
      let manager = FusionManager::new(FusionConfig::default(), Arc::new(NullBus), None);
      let hci0 = manager
         .register_scanner(ScannerInfo::local("hci0", "hci0", true))
         .await
         .unwrap();
      let coordinator = PassiveUpdateCoordinator::new(manager.clone(), ADDR, false, |adv| adv.rssi);
      (manager, hci0, coordinator)
   }

   fn record(coordinator: &PassiveUpdateCoordinator<i16>) -> (Log, ListenerHandle) {
      let log: Log = Arc::default();
      let sink = Arc::clone(&log);
      let handle = coordinator.add_listener(move |update| {
         sink.lock().push(match update {
            CoordinatorUpdate::Data(rssi) => format!("data:{rssi}"),
            CoordinatorUpdate::Unavailable => "unavailable".to_string(),
         });
      });
      (log, handle)
   }

   async fn advertise(manager: &FusionManager, scanner: &ScannerHandle, rssi: i16, tag: u8) {
      scanner.on_advertisement(
         Advertisement::new(ADDR, "", manager.now())
            .with_rssi(rssi)
            .with_manufacturer_data(0x0969, [tag]),
      );
      // Round-trip so the actor has dispatched.
      manager.scanner_count(false).await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_updates_reach_listeners() {
      let (manager, hci0, coordinator) = setup().await;
      let (log, _listener) = record(&coordinator);
      let _handle = coordinator.start().await.unwrap();
      assert_eq!(coordinator.state(), CoordinatorState::NoData);

      advertise(&manager, &hci0, -60, 1).await;
      advertise(&manager, &hci0, -61, 2).await;
      assert_eq!(*log.lock(), ["data:-60", "data:-61"]);
      assert!(coordinator.available());
      assert_eq!(coordinator.data().as_deref(), Some(&-61));
      assert!(coordinator.last_seen().is_some());
   }

   #[tokio::test(start_paused = true)]
   async fn test_known_device_is_delivered_on_start() {
      let (manager, hci0, coordinator) = setup().await;
      advertise(&manager, &hci0, -70, 1).await;

      let (log, _listener) = record(&coordinator);
      let _handle = coordinator.start().await.unwrap();
      assert_eq!(*log.lock(), ["data:-70"]);
      assert!(coordinator.available());
   }

   #[tokio::test(start_paused = true)]
   async fn test_unavailable_then_back() {
      let (manager, hci0, coordinator) = setup().await;
      let (log, _listener) = record(&coordinator);
      let _handle = coordinator.start().await.unwrap();

      advertise(&manager, &hci0, -60, 1).await;
      time::sleep(Duration::from_secs(301)).await;
      assert_eq!(coordinator.state(), CoordinatorState::Unavailable);
      // Last known data survives.
      assert_eq!(coordinator.data().as_deref(), Some(&-60));

      advertise(&manager, &hci0, -65, 2).await;
      assert!(coordinator.available());
      assert_eq!(*log.lock(), ["data:-60", "unavailable", "data:-65"]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_removed_listener_is_not_called() {
      let (manager, hci0, coordinator) = setup().await;
      let (log, listener) = record(&coordinator);
      let (other, _other_listener) = record(&coordinator);
      let _handle = coordinator.start().await.unwrap();

      advertise(&manager, &hci0, -60, 1).await;
      listener.remove();
      advertise(&manager, &hci0, -61, 2).await;
      assert_eq!(*log.lock(), ["data:-60"]);
      assert_eq!(*other.lock(), ["data:-60", "data:-61"]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_stop_and_restart() {
      let (manager, hci0, coordinator) = setup().await;
      let (log, _listener) = record(&coordinator);
      let handle = coordinator.start().await.unwrap();
      assert!(matches!(coordinator.start().await, Err(FusionError::AlreadyStarted)));

      handle.stop();
      advertise(&manager, &hci0, -60, 1).await;
      assert!(log.lock().is_empty());
      assert_eq!(coordinator.state(), CoordinatorState::NoData);

      let _handle = coordinator.start().await.unwrap();
      assert_eq!(*log.lock(), ["data:-60"]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_manager_shutdown_stops_delivery() {
      let (manager, _hci0, coordinator) = setup().await;
      let handle = coordinator.start().await.unwrap();
      manager.shutdown().await;
      assert!(!coordinator.is_started());

      handle.stop();
      assert!(matches!(
         coordinator.start().await,
         Err(FusionError::ManagerShutdown)
      ));
      assert_eq!(coordinator.state(), CoordinatorState::NoData);
   }
}

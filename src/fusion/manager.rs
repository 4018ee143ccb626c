//! Fusion manager actor.
//!
//! All fusion state lives in one task. Scanner handles push advertisements
//! into its bounded inbox, everything else talks to it with request/reply
//! commands. Unregistrations triggered from `Drop` go over a separate
//! unbounded control channel so they can never block or be lost to
//! backpressure.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant, MissedTickBehavior},
};

use super::{
   diagnostics::Diagnostics,
   matcher::Matcher,
   scanner::{ScannerHandle, ScannerInfo},
   state::{AdvertisementCallback, FusionState, UnavailableCallback},
   store::{self, StoredInterval, TrackerStore},
};
use crate::{
   advertisement::SharedAdvertisement,
   config::FusionConfig,
   error::{FusionError, Result},
   event::{AdvertisementChange, EventSender},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Monotonic clock shared by the manager and its scanners.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
   base: Instant,
}

impl Clock {
   fn new() -> Self {
      Self {
         base: Instant::now(),
      }
   }

   /// Seconds since the manager started.
   pub fn now(&self) -> f64 {
      self.base.elapsed().as_secs_f64()
   }
}

// === Commands ===

/// Fire-and-forget requests that must never be dropped.
#[derive(Debug)]
pub(crate) enum Control {
   UnregisterScanner {
      source: SmolStr,
      registration: u64,
   },
   SetScanning {
      source: SmolStr,
      registration: u64,
      scanning: bool,
   },
   UnregisterListener(u64),
   UntrackUnavailable(u64),
}

enum ManagerCommand {
   Ingest(SharedAdvertisement),
   RegisterScanner(ScannerInfo, oneshot::Sender<Result<u64>>),
   RegisterListener(Matcher, AdvertisementCallback, oneshot::Sender<u64>),
   TrackUnavailable(Address, bool, UnavailableCallback, oneshot::Sender<u64>),
   GetBestDevice(Address, bool, oneshot::Sender<Option<SharedAdvertisement>>),
   GetDiscovered(bool, oneshot::Sender<Vec<SharedAdvertisement>>),
   GetScannerDiscovered(SmolStr, oneshot::Sender<Vec<SharedAdvertisement>>),
   CountScanners(bool, oneshot::Sender<usize>),
   SetFallbackInterval(Address, f64),
   GetFallbackInterval(Address, oneshot::Sender<Option<f64>>),
   GetLearnedInterval(Address, oneshot::Sender<Option<f64>>),
   GetDiagnostics(oneshot::Sender<Diagnostics>),
   Shutdown(oneshot::Sender<()>),
}

/// Everything a handle needs to reach the actor.
#[derive(Clone)]
pub(crate) struct ManagerLink {
   inbox: mpsc::Sender<ManagerCommand>,
   control: mpsc::UnboundedSender<Control>,
   shutting_down: Arc<AtomicBool>,
   clock: Clock,
}

impl ManagerLink {
   pub(crate) fn submit(&self, adv: SharedAdvertisement) {
      if self.shutting_down.load(Ordering::Relaxed) {
         return;
      }
      match self.inbox.try_send(ManagerCommand::Ingest(adv)) {
         Ok(()) => {},
         Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel overflow, dropping advertisement");
         },
         Err(mpsc::error::TrySendError::Closed(_)) => {},
      }
   }

   pub(crate) fn now(&self) -> f64 {
      self.clock.now()
   }

   pub(crate) fn control(&self, control: Control) {
      let _ = self.control.send(control);
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| FusionError::ManagerShutdown)?;
      rx.await.map_err(|_| FusionError::ManagerShutdown)
   }

   pub(crate) async fn scanner_discovered(&self, source: SmolStr) -> Result<Vec<SharedAdvertisement>> {
      self
         .request(|tx| ManagerCommand::GetScannerDiscovered(source, tx))
         .await
   }
}

// === Subscriptions ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
   Listener,
   Unavailable,
}

/// Keeps a listener or unavailable callback registered.
///
/// Dropping it (or calling `cancel`) unregisters the callback.
pub struct Subscription {
   id: u64,
   kind: SubscriptionKind,
   link: ManagerLink,
}

impl Subscription {
   pub const fn id(&self) -> u64 {
      self.id
   }

   pub fn cancel(self) {}
}

impl Drop for Subscription {
   fn drop(&mut self) {
      self.link.control(match self.kind {
         SubscriptionKind::Listener => Control::UnregisterListener(self.id),
         SubscriptionKind::Unavailable => Control::UntrackUnavailable(self.id),
      });
   }
}

impl std::fmt::Debug for Subscription {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Subscription")
         .field("id", &self.id)
         .field("kind", &self.kind)
         .finish()
   }
}

// === Main Manager ===

/// Handle to the fusion manager.
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Clone)]
pub struct FusionManager {
   link: ManagerLink,
}

impl FusionManager {
   /// Spawns the manager actor on the current tokio runtime.
   pub fn new(config: FusionConfig, event_tx: EventSender, store: Option<TrackerStore>) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (control_tx, control_rx) = mpsc::unbounded_channel();
      let shutting_down = Arc::new(AtomicBool::new(false));
      let clock = Clock::new();

      let actor = ManagerActor {
         state: FusionState::new(config.clone()),
         config,
         event_tx,
         command_rx,
         control_rx,
         store,
         clock,
         shutdown_reply: None,
      };
      tokio::spawn(actor.run());

      Self {
         link: ManagerLink {
            inbox: command_tx,
            control: control_tx,
            shutting_down,
            clock,
         },
      }
   }

   pub const fn clock(&self) -> Clock {
      self.link.clock
   }

   /// Current monotonic time in seconds.
   pub fn now(&self) -> f64 {
      self.link.clock.now()
   }

   pub fn is_shutting_down(&self) -> bool {
      self.link.shutting_down.load(Ordering::Relaxed)
   }

   fn ensure_running(&self) -> Result<()> {
      if self.is_shutting_down() {
         Err(FusionError::ManagerShutdown)
      } else {
         Ok(())
      }
   }

   /// Registers a scanner. Fails if its source is already registered in the
   /// same connectable class.
   pub async fn register_scanner(&self, info: ScannerInfo) -> Result<ScannerHandle> {
      self.ensure_running()?;
      let registration = self
         .link
         .request(|tx| ManagerCommand::RegisterScanner(info.clone(), tx))
         .await??;
      Ok(ScannerHandle::new(info, registration, self.link.clone()))
   }

   /// Registers a listener for fused advertisements accepted by `matcher`.
   ///
   /// Address matchers are immediately replayed the current view.
   pub async fn register_callback(
      &self,
      matcher: Matcher,
      callback: impl FnMut(&SharedAdvertisement, AdvertisementChange) + Send + 'static,
   ) -> Result<Subscription> {
      self.ensure_running()?;
      let id = self
         .link
         .request(|tx| ManagerCommand::RegisterListener(matcher, Box::new(callback), tx))
         .await?;
      Ok(Subscription {
         id,
         kind: SubscriptionKind::Listener,
         link: self.link.clone(),
      })
   }

   /// Calls `callback` every time `address` stops being seen in the given
   /// class.
   pub async fn track_unavailable(
      &self,
      address: Address,
      connectable: bool,
      callback: impl FnMut(&SharedAdvertisement) + Send + 'static,
   ) -> Result<Subscription> {
      self.ensure_running()?;
      let id = self
         .link
         .request(|tx| ManagerCommand::TrackUnavailable(address, connectable, Box::new(callback), tx))
         .await?;
      Ok(Subscription {
         id,
         kind: SubscriptionKind::Unavailable,
         link: self.link.clone(),
      })
   }

   /// Best current view of `address`.
   ///
   /// With `connectable` only views from connectable scanners qualify;
   /// otherwise the best view of any scanner is returned.
   pub async fn get_best_device(&self, address: Address, connectable: bool) -> Option<SharedAdvertisement> {
      self
         .link
         .request(|tx| ManagerCommand::GetBestDevice(address, connectable, tx))
         .await
         .ok()
         .flatten()
   }

   pub async fn discovered_devices(&self, connectable: bool) -> Vec<SharedAdvertisement> {
      self
         .link
         .request(|tx| ManagerCommand::GetDiscovered(connectable, tx))
         .await
         .unwrap_or_default()
   }

   /// Latest advertisements heard by one scanner.
   pub async fn scanner_discovered(&self, source: impl Into<SmolStr>) -> Vec<SharedAdvertisement> {
      self
         .link
         .scanner_discovered(source.into())
         .await
         .unwrap_or_default()
   }

   /// Number of connectable scanners, or of all scanners.
   pub async fn scanner_count(&self, connectable: bool) -> usize {
      self
         .link
         .request(|tx| ManagerCommand::CountScanners(connectable, tx))
         .await
         .unwrap_or_default()
   }

   /// Pins the stale threshold of `address` until it next goes unavailable.
   pub async fn set_fallback_interval(&self, address: Address, interval: f64) -> Result<()> {
      self
         .link
         .inbox
         .send(ManagerCommand::SetFallbackInterval(address, interval))
         .await
         .map_err(|_| FusionError::ManagerShutdown)
   }

   pub async fn fallback_interval(&self, address: Address) -> Option<f64> {
      self
         .link
         .request(|tx| ManagerCommand::GetFallbackInterval(address, tx))
         .await
         .ok()
         .flatten()
   }

   pub async fn learned_interval(&self, address: Address) -> Option<f64> {
      self
         .link
         .request(|tx| ManagerCommand::GetLearnedInterval(address, tx))
         .await
         .ok()
         .flatten()
   }

   pub async fn diagnostics(&self) -> Result<Diagnostics> {
      self.link.request(ManagerCommand::GetDiagnostics).await
   }

   /// Waits for the first advertisement accepted by both `matcher` and
   /// `predicate`.
   pub async fn process_advertisements(
      &self,
      matcher: Matcher,
      mut predicate: impl FnMut(&SharedAdvertisement) -> bool + Send + 'static,
      timeout: Duration,
   ) -> Result<SharedAdvertisement> {
      let (tx, rx) = oneshot::channel();
      let mut tx = Some(tx);
      let _subscription = self
         .register_callback(matcher, move |adv, _| {
            if tx.is_some()
               && predicate(adv)
               && let Some(tx) = tx.take()
            {
               let _ = tx.send(Arc::clone(adv));
            }
         })
         .await?;

      match time::timeout(timeout, rx).await {
         Ok(Ok(adv)) => Ok(adv),
         Ok(Err(_)) => Err(FusionError::ManagerShutdown),
         Err(_) => Err(FusionError::Timeout),
      }
   }

   /// Stops the actor. Listeners are dropped and no further callbacks run.
   pub async fn shutdown(&self) {
      if self.link.shutting_down.swap(true, Ordering::SeqCst) {
         return;
      }
      let (tx, rx) = oneshot::channel();
      if self
         .link
         .inbox
         .send(ManagerCommand::Shutdown(tx))
         .await
         .is_ok()
      {
         let _ = rx.await;
      }
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: FusionConfig,
   state: FusionState,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   control_rx: mpsc::UnboundedReceiver<Control>,
   store: Option<TrackerStore>,
   clock: Clock,
   shutdown_reply: Option<oneshot::Sender<()>>,
}

fn ticker(period: Duration) -> time::Interval {
   let mut interval = time::interval_at(Instant::now() + period, period);
   interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
   interval
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Fusion manager starting up");
      self.restore_tracker();

      let mut unavailable_interval = ticker(self.config.unavailable_track_interval());
      let mut watchdog_interval = ticker(self.config.scanner_watchdog_interval());
      let mut save_interval = ticker(self.config.tracker_save_interval());

      // Main event loop
      loop {
         select! {
            biased;

            Some(control) = self.control_rx.recv() => {
               self.handle_control(control);
            }
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Fusion manager shutting down");
                  break;
               };
               if !self.handle_command(cmd) {
                  break;
               }
            }
            _ = unavailable_interval.tick() => {
               self.state.check_unavailable(self.clock.now());
            }
            _ = watchdog_interval.tick() => {
               self.state.check_scanners(self.clock.now());
            }
            _ = save_interval.tick() => {
               self.persist_tracker();
            }
         }
         self.flush_events();
      }

      self.cleanup();
      if let Some(reply) = self.shutdown_reply.take() {
         let _ = reply.send(());
      }
   }

   fn flush_events(&mut self) {
      for event in self.state.take_events() {
         self.event_tx.emit(event);
      }
   }

   fn handle_control(&mut self, control: Control) {
      let now = self.clock.now();
      match control {
         Control::UnregisterScanner {
            source,
            registration,
         } => self.state.unregister_scanner(&source, registration, now),
         Control::SetScanning {
            source,
            registration,
            scanning,
         } => self.state.set_scanning(&source, registration, scanning, now),
         Control::UnregisterListener(id) => {
            self.state.unregister_listener(id);
         },
         Control::UntrackUnavailable(id) => {
            self.state.untrack_unavailable(id);
         },
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Ingest(adv) => self.state.ingest(adv),
         ManagerCommand::RegisterScanner(info, reply) => {
            let _ = reply.send(self.state.register_scanner(info, self.clock.now()));
         },
         ManagerCommand::RegisterListener(matcher, callback, reply) => {
            let _ = reply.send(self.state.register_listener(matcher, callback));
         },
         ManagerCommand::TrackUnavailable(address, connectable, callback, reply) => {
            let _ = reply.send(self.state.track_unavailable(address, connectable, callback));
         },
         ManagerCommand::GetBestDevice(address, connectable, reply) => {
            let _ = reply.send(self.state.best_device(&address, connectable));
         },
         ManagerCommand::GetDiscovered(connectable, reply) => {
            let _ = reply.send(self.state.discovered_devices(connectable));
         },
         ManagerCommand::GetScannerDiscovered(source, reply) => {
            let _ = reply.send(self.state.scanner_discovered(&source));
         },
         ManagerCommand::CountScanners(connectable, reply) => {
            let _ = reply.send(self.state.scanner_count(connectable));
         },
         ManagerCommand::SetFallbackInterval(address, interval) => {
            debug!("{address}: fallback interval set to {interval:.1}s");
            self.state.set_fallback_interval(address, interval);
         },
         ManagerCommand::GetFallbackInterval(address, reply) => {
            let _ = reply.send(self.state.fallback_interval(&address));
         },
         ManagerCommand::GetLearnedInterval(address, reply) => {
            let _ = reply.send(self.state.learned_interval(&address));
         },
         ManagerCommand::GetDiagnostics(reply) => {
            let _ = reply.send(self.state.diagnostics(self.clock.now()));
         },
         ManagerCommand::Shutdown(reply) => {
            info!("Fusion manager shutting down");
            self.shutdown_reply = Some(reply);
            return false;
         },
      }
      true
   }

   fn restore_tracker(&mut self) {
      let Some(store) = &self.store else {
         return;
      };
      match store.load(self.config.tracker_max_age_secs) {
         Ok(records) => {
            let count = records.len();
            for (address, record) in records {
               self.state.tracker_mut().restore(
                  address,
                  record.source,
                  record.interval,
                  record.last_updated,
               );
            }
            info!("Restored {count} advertising intervals");
         },
         Err(e) => warn!("Failed to load advertising intervals: {e}"),
      }
   }

   fn persist_tracker(&mut self) {
      let forgotten = self.state.tracker_mut().take_forgotten();
      let Some(store) = &self.store else {
         return;
      };
      if !forgotten.is_empty() {
         match store.forget(&forgotten) {
            Ok(count) => debug!("Dropped {count} stored advertising intervals"),
            Err(e) => warn!("Failed to drop advertising intervals: {e}"),
         }
      }

      let now = store::unix_now();
      let tracker = self.state.tracker();
      let entries = tracker.intervals().filter_map(|(address, interval)| {
         let source = tracker.source(address)?;
         let record = StoredInterval {
            source: source.clone(),
            interval,
            last_updated: tracker.restored_at(address).unwrap_or(now),
         };
         Some((*address, record))
      });
      match store.save(entries) {
         Ok(count) => debug!("Saved {count} advertising intervals"),
         Err(e) => warn!("Failed to save advertising intervals: {e}"),
      }
   }

   fn cleanup(&mut self) {
      self.state.clear_subscriptions();
      self.persist_tracker();
      self.flush_events();
   }
}

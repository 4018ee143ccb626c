//! Active coordinator: passive updates plus debounced connection polls.
//!
//! After every advertisement the `needs_poll` predicate decides, from the
//! advertisement and the age of the last poll, whether the device should be
//! polled. Polls go through a cooldown debouncer so a chatty device cannot
//! trigger more than one poll per window.

use std::{
   future::Future,
   sync::{Arc, Weak},
   time::Duration,
};

use bluer::Address;
use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::time;

use super::{
   CoordinatorHandle, CoordinatorState, CoordinatorUpdate, ListenerHandle,
   debounce::Debouncer, passive::PassiveUpdateCoordinator,
};
use crate::{
   advertisement::SharedAdvertisement,
   config::PollConfig,
   error::{PollError, Result},
   fusion::{Clock, FusionManager, Matcher},
};

type NeedsPoll = Box<dyn Fn(&SharedAdvertisement, Option<f64>) -> bool + Send + Sync>;
type PollMethod<T> =
   Box<dyn Fn(SharedAdvertisement) -> BoxFuture<'static, std::result::Result<T, PollError>> + Send + Sync>;

/// How a finished poll moved the failure streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PollOutcome {
   Succeeded,
   /// First success after a failure streak; logged.
   Recovered,
   /// First failure of a streak; logged.
   Failed,
   /// Any later failure of the same streak; silent.
   FailedAgain,
}

/// Bookkeeping of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollStatus {
   /// Manager time the last poll finished, successful or not.
   pub last_poll: Option<f64>,
   pub last_poll_successful: bool,
   pub last_outcome: Option<PollOutcome>,
   pub failure_streak: u32,
   pub in_flight: bool,
}

impl Default for PollStatus {
   fn default() -> Self {
      Self {
         last_poll: None,
         last_poll_successful: true,
         last_outcome: None,
         failure_streak: 0,
         in_flight: false,
      }
   }
}

impl PollStatus {
   fn record(&mut self, success: bool) -> PollOutcome {
      let outcome = match (success, self.failure_streak) {
         (true, 0) => PollOutcome::Succeeded,
         (true, _) => PollOutcome::Recovered,
         (false, 0) => PollOutcome::Failed,
         (false, _) => PollOutcome::FailedAgain,
      };
      self.failure_streak = if success { 0 } else { self.failure_streak.saturating_add(1) };
      self.last_poll_successful = success;
      self.last_outcome = Some(outcome);
      outcome
   }
}

struct ActiveInner<T> {
   passive: PassiveUpdateCoordinator<T>,
   needs_poll: NeedsPoll,
   poll_method: PollMethod<T>,
   poll_timeout: Duration,
   status: Mutex<PollStatus>,
   debouncer: Debouncer,
}

/// Resets `in_flight` and stamps `last_poll` however the poll ends.
struct InFlight<'a> {
   status: &'a Mutex<PollStatus>,
   clock: Clock,
}

impl Drop for InFlight<'_> {
   fn drop(&mut self) {
      let mut status = self.status.lock();
      status.in_flight = false;
      status.last_poll = Some(self.clock.now());
   }
}

impl<T: Send + Sync + 'static> ActiveInner<T> {
   fn handle_advertisement(&self, adv: &SharedAdvertisement) {
      if !self.passive.is_started() {
         return;
      }
      let now = self.passive.manager().now();
      let poll_age = self.status.lock().last_poll.map(|last| now - last);
      if (self.needs_poll)(adv, poll_age) {
         self.debouncer.schedule();
      }
   }

   async fn poll(&self) {
      if !self.passive.is_started() {
         return;
      }
      let address = self.passive.address();
      let Some(adv) = self.passive.last_advertisement() else {
         debug!("{address}: no advertisement to poll with");
         return;
      };

      self.status.lock().in_flight = true;
      let guard = InFlight {
         status: &self.status,
         clock: self.passive.manager().clock(),
      };

      let result = time::timeout(self.poll_timeout, (self.poll_method)(adv))
         .await
         .unwrap_or(Err(PollError::Timeout));

      let outcome = self.status.lock().record(result.is_ok());
      match result {
         Ok(data) => {
            if outcome == PollOutcome::Recovered {
               info!("{address}: polling recovered");
            }
            self.passive.push_data(data);
         },
         Err(e) if outcome == PollOutcome::Failed => warn!("{address}: poll failed: {e}"),
         Err(e) => debug!("{address}: poll failed again: {e}"),
      }
      drop(guard);
   }
}

/// Passive coordinator that can also connect to the device for data the
/// advertisements do not carry.
pub struct ActiveUpdateCoordinator<T> {
   inner: Arc<ActiveInner<T>>,
}

impl<T> Clone for ActiveUpdateCoordinator<T> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<T: Send + Sync + 'static> ActiveUpdateCoordinator<T> {
   /// `needs_poll` receives the advertisement and the seconds since the last
   /// poll finished (`None` if it never ran). `poll_method` is handed the
   /// latest advertisement and must connect to the device itself.
   pub fn new<U, N, P, Fut>(
      manager: FusionManager,
      address: Address,
      connectable: bool,
      config: &PollConfig,
      update_method: U,
      needs_poll: N,
      poll_method: P,
   ) -> Self
   where
      U: Fn(&SharedAdvertisement) -> T + Send + Sync + 'static,
      N: Fn(&SharedAdvertisement, Option<f64>) -> bool + Send + Sync + 'static,
      P: Fn(SharedAdvertisement) -> Fut + Send + Sync + 'static,
      Fut: Future<Output = std::result::Result<T, PollError>> + Send + 'static,
   {
      let passive = PassiveUpdateCoordinator::new(manager, address, connectable, update_method);
      let inner = Arc::new_cyclic(|weak: &Weak<ActiveInner<T>>| {
         let weak = weak.clone();
         ActiveInner {
            passive,
            needs_poll: Box::new(needs_poll),
            poll_method: Box::new(move |adv| poll_method(adv).boxed()),
            poll_timeout: config.timeout(),
            status: Mutex::new(PollStatus::default()),
            debouncer: Debouncer::new(config.debounce_cooldown(), move || {
               let weak = weak.clone();
               async move {
                  if let Some(inner) = weak.upgrade() {
                     inner.poll().await;
                  }
               }
            }),
         }
      });
      Self { inner }
   }

   pub fn address(&self) -> Address {
      self.inner.passive.address()
   }

   pub fn state(&self) -> CoordinatorState {
      self.inner.passive.state()
   }

   pub fn available(&self) -> bool {
      self.inner.passive.available()
   }

   pub fn last_seen(&self) -> Option<f64> {
      self.inner.passive.last_seen()
   }

   pub fn data(&self) -> Option<Arc<T>> {
      self.inner.passive.data()
   }

   pub fn poll_status(&self) -> PollStatus {
      *self.inner.status.lock()
   }

   pub fn add_listener(
      &self,
      listener: impl Fn(&CoordinatorUpdate<T>) + Send + Sync + 'static,
   ) -> ListenerHandle {
      self.inner.passive.add_listener(listener)
   }

   /// Starts the passive path, then hooks the poll decision in after it.
   pub async fn start(&self) -> Result<CoordinatorHandle> {
      let mut handle = self.inner.passive.start().await?;

      let passive = &self.inner.passive;
      let matcher = Matcher::address(passive.address()).connectable(passive.connectable());
      let weak = Arc::downgrade(&self.inner);
      let subscription = passive
         .manager()
         .register_callback(matcher, move |adv, _change| {
            if let Some(inner) = weak.upgrade() {
               inner.handle_advertisement(adv);
            }
         })
         .await?;

      let weak = Arc::downgrade(&self.inner);
      handle.attach(subscription, move || {
         if let Some(inner) = weak.upgrade() {
            inner.debouncer.cancel();
         }
      });
      Ok(handle)
   }
}

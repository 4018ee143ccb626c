//! Per-device update coordinators built on top of the fusion manager.
//!
//! A passive coordinator turns fused advertisements for one address into
//! typed data for its listeners. An active coordinator additionally polls
//! the device over a connection when the advertisement says it should.

pub mod active;
pub mod debounce;
pub mod passive;

use std::sync::Arc;

pub use active::{ActiveUpdateCoordinator, PollOutcome, PollStatus};
pub use debounce::Debouncer;
pub use passive::PassiveUpdateCoordinator;

use crate::fusion::Subscription;

/// Availability of the device a coordinator follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CoordinatorState {
   /// Nothing received since the coordinator was created.
   NoData,
   Available,
   Unavailable,
}

/// What listeners receive.
#[derive(Debug)]
pub enum CoordinatorUpdate<T> {
   Data(Arc<T>),
   Unavailable,
}

/// Keeps a coordinator listener registered until dropped.
#[must_use = "the listener is removed when the handle is dropped"]
pub struct ListenerHandle {
   remove: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
   pub(crate) fn new(remove: impl FnOnce() + Send + 'static) -> Self {
      Self {
         remove: Some(Box::new(remove)),
      }
   }

   pub fn remove(self) {}
}

impl Drop for ListenerHandle {
   fn drop(&mut self) {
      if let Some(remove) = self.remove.take() {
         remove();
      }
   }
}

/// Keeps a started coordinator attached to the manager.
///
/// Dropping it (or calling `stop`) unregisters the manager callbacks and
/// cancels any pending poll.
#[must_use = "the coordinator stops when the handle is dropped"]
pub struct CoordinatorHandle {
   subscriptions: Vec<Subscription>,
   on_stop: Vec<Box<dyn FnOnce() + Send>>,
}

impl CoordinatorHandle {
   pub(crate) fn new(subscriptions: Vec<Subscription>, on_stop: impl FnOnce() + Send + 'static) -> Self {
      Self {
         subscriptions,
         on_stop: vec![Box::new(on_stop)],
      }
   }

   pub(crate) fn attach(&mut self, subscription: Subscription, on_stop: impl FnOnce() + Send + 'static) {
      self.subscriptions.push(subscription);
      self.on_stop.push(Box::new(on_stop));
   }

   pub fn stop(self) {}
}

impl Drop for CoordinatorHandle {
   fn drop(&mut self) {
      self.subscriptions.clear();
      // Outer layers first.
      while let Some(on_stop) = self.on_stop.pop() {
         on_stop();
      }
   }
}

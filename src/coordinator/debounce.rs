//! Cooldown debouncer with immediate first call.
//!
//! The first `schedule` runs the function right away and opens a cooldown
//! window. Any `schedule` while the function is running or cooling down is
//! coalesced into a single trailing run at the end of the window.

use std::{future::Future, sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

type DebouncedFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
   Idle,
   Scheduled,
   Running,
   Cooldown,
}

struct DebounceState {
   phase: Phase,
   pending: bool,
   shutdown: bool,
   generation: u64,
   task: Option<JoinHandle<()>>,
}

struct Inner {
   cooldown: Duration,
   function: DebouncedFn,
   state: Mutex<DebounceState>,
}

pub struct Debouncer {
   inner: Arc<Inner>,
}

impl Debouncer {
   pub fn new<F, Fut>(cooldown: Duration, function: F) -> Self
   where
      F: Fn() -> Fut + Send + Sync + 'static,
      Fut: Future<Output = ()> + Send + 'static,
   {
      Self {
         inner: Arc::new(Inner {
            cooldown,
            function: Box::new(move || function().boxed()),
            state: Mutex::new(DebounceState {
               phase: Phase::Idle,
               pending: false,
               shutdown: false,
               generation: 0,
               task: None,
            }),
         }),
      }
   }

   pub fn phase(&self) -> Phase {
      self.inner.state.lock().phase
   }

   /// Requests a call. Returns `false` once the debouncer has been shut
   /// down.
   pub fn schedule(&self) -> bool {
      let mut state = self.inner.state.lock();
      if state.shutdown {
         return false;
      }
      match state.phase {
         Phase::Idle => {
            state.phase = Phase::Scheduled;
            state.pending = false;
            state.generation += 1;
            let driver = Self::drive(Arc::clone(&self.inner), state.generation);
            state.task = Some(tokio::spawn(driver));
         },
         Phase::Scheduled => {},
         Phase::Running | Phase::Cooldown => state.pending = true,
      }
      true
   }

   async fn drive(inner: Arc<Inner>, generation: u64) {
      loop {
         {
            let mut state = inner.state.lock();
            if state.generation != generation {
               return;
            }
            state.phase = Phase::Running;
            state.pending = false;
         }
         (inner.function)().await;

         {
            let mut state = inner.state.lock();
            if state.generation != generation {
               return;
            }
            state.phase = Phase::Cooldown;
         }
         time::sleep(inner.cooldown).await;

         let mut state = inner.state.lock();
         if state.generation != generation {
            return;
         }
         if !state.pending || state.shutdown {
            state.phase = Phase::Idle;
            state.pending = false;
            state.task = None;
            return;
         }
      }
   }

   /// Drops any pending call and aborts a running one.
   pub fn cancel(&self) {
      let mut state = self.inner.state.lock();
      if let Some(task) = state.task.take() {
         task.abort();
      }
      // A driver that outlives its abort must not touch the next one's state.
      state.generation += 1;
      state.phase = Phase::Idle;
      state.pending = false;
   }

   /// Cancels and refuses all future schedules.
   pub fn shutdown(&self) {
      self.inner.state.lock().shutdown = true;
      self.cancel();
   }
}

impl Drop for Debouncer {
   fn drop(&mut self) {
      self.cancel();
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use super::*;

   fn counting(cooldown: u64) -> (Debouncer, Arc<AtomicUsize>) {
      let calls = Arc::new(AtomicUsize::new(0));
      let counter = Arc::clone(&calls);
      let debouncer = Debouncer::new(Duration::from_secs(cooldown), move || {
         let counter = Arc::clone(&counter);
         async move {
            counter.fetch_add(1, Ordering::SeqCst);
         }
      });
      (debouncer, calls)
   }

   #[tokio::test(start_paused = true)]
   async fn test_first_call_is_immediate() {
      let (debouncer, calls) = counting(10);
      assert!(debouncer.schedule());
      time::sleep(Duration::from_millis(1)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert_eq!(debouncer.phase(), Phase::Cooldown);

      time::sleep(Duration::from_secs(11)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert_eq!(debouncer.phase(), Phase::Idle);
   }

   #[tokio::test(start_paused = true)]
   async fn test_calls_in_cooldown_coalesce_into_one_trailing_run() {
      let (debouncer, calls) = counting(10);
      debouncer.schedule();
      time::sleep(Duration::from_millis(1)).await;
      for _ in 0..5 {
         debouncer.schedule();
         time::sleep(Duration::from_secs(1)).await;
      }
      assert_eq!(calls.load(Ordering::SeqCst), 1);

      time::sleep(Duration::from_secs(6)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 2);

      time::sleep(Duration::from_secs(30)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 2);
      assert_eq!(debouncer.phase(), Phase::Idle);
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_drops_trailing_run() {
      let (debouncer, calls) = counting(10);
      debouncer.schedule();
      time::sleep(Duration::from_millis(1)).await;
      debouncer.schedule();
      debouncer.cancel();
      time::sleep(Duration::from_secs(30)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);

      // Usable again after a cancel.
      assert!(debouncer.schedule());
      time::sleep(Duration::from_millis(1)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_shutdown_refuses_new_calls() {
      let (debouncer, calls) = counting(10);
      debouncer.shutdown();
      assert!(!debouncer.schedule());
      time::sleep(Duration::from_secs(1)).await;
      assert_eq!(calls.load(Ordering::SeqCst), 0);
   }
}

//! blefuse D-Bus daemon
//!
//! Fuses BLE advertisements from every local adapter into a single view per
//! device and exposes it, together with availability and scanner health
//! signals, over the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use blefuse::{
   bluetooth::adapter::AdapterSupervisor,
   config::Config,
   dbus::{FusionService, FusionServiceSignals},
   error::Result,
   event::{EventBus, FusionEvent},
   fusion::{FusionManager, store::TrackerStore},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting blefuse D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration (fallback stale {}s, sweep every {}s)",
      config.fusion.fallback_max_stale_secs, config.fusion.unavailable_track_secs
   );

   let store = if config.tracker_persistence {
      match TrackerStore::open() {
         Ok(store) => Some(store),
         Err(e) => {
            warn!("Advertising intervals will not be persisted: {e}");
            None
         },
      }
   } else {
      None
   };

   // Create event channel
   let event_bus = EventProcessor::new();

   let manager = FusionManager::new(config.fusion.clone(), event_bus.clone(), store);
   let adapters = AdapterSupervisor::new(manager.clone(), &config).await?;

   // Create D-Bus service
   let service = FusionService::new(manager.clone(), adapters.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.blefuse")?
      .serve_at("/org/blefuse/manager", service)?
      .build()
      .await?;

   info!("blefuse D-Bus service started at org.blefuse");

   // Start event processor
   event_bus.spawn_dispatcher(connection, adapters.clone()).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down blefuse service...");

   if let Err(e) = adapters.shutdown().await {
      warn!("Adapter supervisor did not shut down cleanly: {e}");
   }
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<FusionEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<FusionEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<FusionService>,
      adapters: &AdapterSupervisor,
      event: FusionEvent,
   ) -> Result<()> {
      match event {
         FusionEvent::ScannerRegistered {
            source,
            adapter,
            connectable,
         } => {
            info!("Scanner {source} on {adapter} registered (connectable: {connectable})");
         },
         FusionEvent::ScannerUnregistered { source } => {
            info!("Scanner {source} unregistered");
         },
         FusionEvent::ScannerStalled(stalled) => {
            warn!(
               "Scanner {} ({}) silent for {:.0}s",
               stalled.source, stalled.kind, stalled.silent_for
            );
            iface
               .scanner_stalled(&stalled.source, &stalled.adapter, stalled.silent_for)
               .await?;
            adapters.restart_discovery(&stalled.adapter);
         },
         FusionEvent::DeviceUnavailable {
            address,
            connectable,
         } => {
            iface
               .device_unavailable(&address.to_string(), connectable)
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      connection: Connection,
      adapters: AdapterSupervisor,
   ) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, FusionService>("/org/blefuse/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, &adapters, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: FusionEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

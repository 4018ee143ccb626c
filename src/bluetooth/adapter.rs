//! Local Bluetooth adapters as fusion scanners.
//!
//! Every adapter BlueZ exposes is registered with the fusion manager as a
//! local connectable scanner. A monitor task per adapter runs LE discovery
//! and turns device property changes into advertisements. Adapters that
//! disappear are unregistered and recovered with a jittered backoff.

use std::{
   collections::{HashMap, HashSet},
   pin::pin,
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
   Uuid,
};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   advertisement::Advertisement,
   config::Config,
   error::{FusionError, Result},
   fusion::{FusionManager, ScannerHandle, ScannerInfo},
};

/// Delay before retrying to power on an adapter
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum adapter recovery delay
const MAX_RECOVERY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 100;

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

/// Snapshot of one adapter for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
   pub name: SmolStr,
   pub state: AdapterState,
   pub retry_count: u32,
   pub registered: bool,
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   scanner: Option<ScannerHandle>,
   retry_count: u32,
}

impl AdapterInfo {
   fn stop(&mut self) {
      if let Some(handle) = self.monitor_handle.take() {
         handle.abort();
      }
      // Dropping the last handle unregisters the scanner.
      self.scanner = None;
   }
}

/// Device properties BlueZ reports after an advertisement.
#[derive(Debug, Default, Clone, PartialEq)]
struct DeviceSnapshot {
   name: Option<String>,
   rssi: Option<i16>,
   tx_power: Option<i16>,
   uuids: HashSet<Uuid>,
   service_data: HashMap<Uuid, Vec<u8>>,
   manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl DeviceSnapshot {
   async fn read(device: &bluer::Device) -> bluer::Result<Self> {
      Ok(Self {
         name: device.name().await?,
         rssi: device.rssi().await?,
         tx_power: device.tx_power().await?,
         uuids: device.uuids().await?.unwrap_or_default(),
         service_data: device.service_data().await?.unwrap_or_default(),
         manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
      })
   }

   /// `None` for cached devices that are not currently heard.
   fn into_advertisement(self, address: Address, source: &SmolStr, time: f64) -> Option<Advertisement> {
      let rssi = self.rssi?;
      let mut adv = Advertisement::new(address, source.clone(), time).with_rssi(rssi);
      adv.name = self.name.map(SmolStr::from);
      adv.tx_power = self.tx_power;
      adv.service_uuids = self.uuids.into_iter().collect();
      adv.service_data = self.service_data.into_iter().collect();
      adv.manufacturer_data = self.manufacturer_data.into_iter().collect();
      Some(adv)
   }
}

fn le_filter() -> DiscoveryFilter {
   DiscoveryFilter {
      transport: DiscoveryTransport::Le,
      duplicate_data: true,
      ..Default::default()
   }
}

// === Commands ===

#[derive(Debug)]
enum SupervisorCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String), // adapter_name, error

   // User commands
   RestartDiscovery(SmolStr),
   GetAdapters(oneshot::Sender<Vec<AdapterStatus>>),
   Shutdown(oneshot::Sender<()>),
}

// === Supervisor ===

/// Keeps every local adapter registered with the fusion manager.
#[derive(Clone)]
pub struct AdapterSupervisor {
   inbox: mpsc::Sender<SupervisorCommand>,
}

impl AdapterSupervisor {
   pub async fn new(fusion: FusionManager, config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = SupervisorActor {
         fusion,
         session,
         check_interval: Duration::from_secs(config.adapter_check_interval_secs.max(1)),
         command_rx,
         loopback_rx,
         loopback_tx,
         adapters: HashMap::new(),
      };
      tokio::spawn(actor.run());
      Ok(Self { inbox: command_tx })
   }

   /// Restarts discovery on `adapter`, e.g. after its scanner stalled.
   pub fn restart_discovery(&self, adapter: &str) {
      if let Err(e) = self
         .inbox
         .try_send(SupervisorCommand::RestartDiscovery(adapter.into()))
      {
         warn!("Dropping discovery restart for {adapter}: {e}");
      }
   }

   pub async fn adapters(&self) -> Vec<AdapterStatus> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(SupervisorCommand::GetAdapters(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   /// Stops discovery everywhere and unregisters all scanners.
   pub async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SupervisorCommand::Shutdown(tx))
         .await
         .map_err(|_| FusionError::ManagerShutdown)?;
      rx.await.map_err(|_| FusionError::ManagerShutdown)
   }
}

// === Supervisor Actor ===

struct SupervisorActor {
   fusion: FusionManager,
   session: Session,
   check_interval: Duration,
   command_rx: mpsc::Receiver<SupervisorCommand>,
   loopback_rx: mpsc::Receiver<SupervisorCommand>,
   loopback_tx: mpsc::Sender<SupervisorCommand>,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
}

impl SupervisorActor {
   async fn run(mut self) {
      info!("Adapter supervisor starting up");

      self.initialize_adapters().await;

      let mut adapter_check_interval = time::interval(self.check_interval);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut shutdown_reply = None;
      loop {
         select! {
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Adapter supervisor shutting down");
                     break;
                 };
                 if let SupervisorCommand::Shutdown(reply) = cmd {
                     shutdown_reply = Some(reply);
                     break;
                 }
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
      if let Some(reply) = shutdown_reply {
         let _ = reply.send(());
      }
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      if self.adapters.is_empty() {
         warn!("No Bluetooth adapters found, waiting for one to appear");
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      let adapter = match self.session.adapter(&name) {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
            return;
         },
      };
      info!("Initializing adapter: {name}");

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {name}: {e}");
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               time::sleep(ADAPTER_RECOVERY_DELAY).await;
               let _ = loopback
                  .send(SupervisorCommand::AdapterAvailable(name, adapter))
                  .await;
            });
            return;
         }
         info!("Powered on adapter: {name}");
      }

      let retry_count = self.adapters.get(&name).map_or(0, |info| info.retry_count);
      let mut info = AdapterInfo {
         adapter,
         state: AdapterState::Active,
         monitor_handle: None,
         scanner: None,
         retry_count,
      };
      self.attach(&name, &mut info).await;
      self.adapters.insert(name, info);
   }

   /// Registers the scanner and starts discovery if either is missing.
   async fn attach(&self, name: &SmolStr, info: &mut AdapterInfo) {
      if info.scanner.is_none() {
         match self
            .fusion
            .register_scanner(ScannerInfo::local(name.clone(), name.clone(), true))
            .await
         {
            Ok(scanner) => info.scanner = Some(scanner),
            Err(e) => {
               error!("Failed to register scanner for {name}: {e}");
               info.state = AdapterState::Failed(e.to_string());
               return;
            },
         }
      }

      if info.monitor_handle.is_none()
         && let Some(scanner) = &info.scanner
      {
         info.monitor_handle = Some(Self::start_discovery_monitor(
            self.loopback_tx.clone(),
            name.clone(),
            info.adapter.clone(),
            scanner.clone(),
         ));
      }
   }

   fn start_discovery_monitor(
      loopback: mpsc::Sender<SupervisorCommand>,
      name: SmolStr,
      adapter: Adapter,
      scanner: ScannerHandle,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         if let Err(e) = adapter.set_discovery_filter(le_filter()).await {
            warn!("Failed to set discovery filter on {name}: {e}");
         }

         let events = match adapter.discover_devices_with_changes().await {
            Ok(events) => events,
            Err(e) => {
               if let Err(e) = loopback
                  .send(SupervisorCommand::AdapterError(
                     name.clone(),
                     format!("Failed to start discovery: {e}"),
                  ))
                  .await
               {
                  warn!("Channel overflow sending adapter error: {e}");
               }
               return;
            },
         };
         let mut events = pin!(events);
         scanner.set_scanning(true);
         debug!("Discovery running on {name}");

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  let Ok(device) = adapter.device(addr) else {
                     continue;
                  };
                  match DeviceSnapshot::read(&device).await {
                     Ok(snapshot) => {
                        if let Some(adv) = snapshot.into_advertisement(addr, scanner.source(), scanner.now()) {
                           scanner.on_advertisement(adv);
                        }
                     },
                     Err(e) => debug!("Failed to read {addr} on {name}: {e}"),
                  }
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
               },
               AdapterEvent::PropertyChanged(AdapterProperty::Discovering(discovering)) => {
                  scanner.set_scanning(discovering);
               },
               AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
                  scanner.set_scanning(false);
               },
               _ => {},
            }
         }

         // If we exit the event loop, adapter is probably gone
         scanner.set_scanning(false);
         if let Err(e) = loopback.send(SupervisorCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   async fn handle_command(&mut self, cmd: SupervisorCommand) {
      match cmd {
         SupervisorCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         SupervisorCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         SupervisorCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         SupervisorCommand::RestartDiscovery(name) => {
            self.restart_discovery(name).await;
         },
         SupervisorCommand::GetAdapters(reply) => {
            let mut adapters: Vec<AdapterStatus> = self
               .adapters
               .iter()
               .map(|(name, info)| AdapterStatus {
                  name: name.clone(),
                  state: info.state.clone(),
                  retry_count: info.retry_count,
                  registered: info.scanner.is_some(),
               })
               .collect();
            adapters.sort_by(|a, b| a.name.cmp(&b.name));
            let _ = reply.send(adapters);
         },
         SupervisorCommand::Shutdown(reply) => {
            let _ = reply.send(());
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      let Some(mut info) = self.adapters.remove(&name) else {
         self.initialize_adapter(name).await;
         return;
      };
      info.adapter = adapter;
      info.state = AdapterState::Active;
      info.retry_count = 0; // Reset retry count on success
      self.attach(&name, &mut info).await;
      self.adapters.insert(name, info);
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;
      info.stop();

      // Schedule adapter recovery with exponential backoff
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(info.retry_count);

      tokio::spawn(async move {
         time::sleep(delay).await;

         match session.adapter(&name) {
            Ok(adapter) => {
               let _ = loopback
                  .send(SupervisorCommand::AdapterAvailable(name, adapter))
                  .await;
            },
            Err(e) => {
               let _ = loopback
                  .send(SupervisorCommand::AdapterError(
                     name,
                     format!("Recovery failed: {e}"),
                  ))
                  .await;
            },
         }
      });
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.stop();
         info.state = AdapterState::Failed(error);
      }
   }

   async fn restart_discovery(&mut self, name: SmolStr) {
      let Some(mut info) = self.adapters.remove(&name) else {
         debug!("Ignoring discovery restart for unknown adapter {name}");
         return;
      };
      if info.state == AdapterState::Active {
         info!("Restarting discovery on {name}");
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
         }
         self.attach(&name, &mut info).await;
      }
      self.adapters.insert(name, info);
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up adapter supervisor");

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            // Give it a moment to finish
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
         info.scanner = None;
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RECOVERY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

use std::str::FromStr;

use bluer::Address;
use log::info;
use serde::Serialize;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::adapter::AdapterSupervisor,
   fusion::{FusionManager, diagnostics::AdvertisementSummary},
};

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn to_json(value: &impl Serialize) -> zbus::fdo::Result<String> {
   serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

pub struct FusionService {
   manager: FusionManager,
   adapters: AdapterSupervisor,
}

impl FusionService {
   pub const fn new(manager: FusionManager, adapters: AdapterSupervisor) -> Self {
      Self { manager, adapters }
   }
}

#[interface(name = "org.blefuse.Manager")]
impl FusionService {
   async fn get_devices(&self, connectable: bool) -> zbus::fdo::Result<String> {
      let now = self.manager.now();
      let devices: Vec<AdvertisementSummary> = self
         .manager
         .discovered_devices(connectable)
         .await
         .iter()
         .map(|adv| AdvertisementSummary::new(adv, now))
         .collect();
      to_json(&devices)
   }

   async fn get_device(&self, address: String, connectable: bool) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let adv = self
         .manager
         .get_best_device(addr, connectable)
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("Device not found".into()))?;
      to_json(&AdvertisementSummary::new(&adv, self.manager.now()))
   }

   async fn get_scanner_devices(&self, source: String) -> zbus::fdo::Result<String> {
      let now = self.manager.now();
      let devices: Vec<AdvertisementSummary> = self
         .manager
         .scanner_discovered(source)
         .await
         .iter()
         .map(|adv| AdvertisementSummary::new(adv, now))
         .collect();
      to_json(&devices)
   }

   async fn get_diagnostics(&self) -> zbus::fdo::Result<String> {
      let diagnostics = self
         .manager
         .diagnostics()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      to_json(&diagnostics)
   }

   async fn get_adapters(&self) -> zbus::fdo::Result<String> {
      to_json(&self.adapters.adapters().await)
   }

   async fn scanner_count(&self, connectable: bool) -> u32 {
      self.manager.scanner_count(connectable).await as u32
   }

   async fn set_fallback_interval(&self, address: String, interval: f64) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      if !interval.is_finite() || interval <= 0.0 {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Invalid interval: {interval}"
         )));
      }
      self
         .manager
         .set_fallback_interval(addr, interval)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      info!("Set fallback availability interval of {address} to {interval}s");
      Ok(true)
   }

   async fn get_fallback_interval(&self, address: String) -> zbus::fdo::Result<f64> {
      let addr = parse_address(&address)?;
      self
         .manager
         .fallback_interval(addr)
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("No fallback interval set".into()))
   }

   async fn get_learned_interval(&self, address: String) -> zbus::fdo::Result<f64> {
      let addr = parse_address(&address)?;
      self
         .manager
         .learned_interval(addr)
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("No interval learned yet".into()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_unavailable(
      emitter: &SignalEmitter<'_>,
      address: &str,
      connectable: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scanner_stalled(
      emitter: &SignalEmitter<'_>,
      source: &str,
      adapter: &str,
      silent_for: f64,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices(false).await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connectable_scanner_count(&self) -> u32 {
      self.scanner_count(true).await
   }
}

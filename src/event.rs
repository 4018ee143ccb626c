//! Event handling for fusion state changes.
//!
//! Listener callbacks receive fused advertisements directly on the manager
//! loop. Everything else the daemon may want to surface (devices going
//! unavailable, scanners stalling) is emitted through an `EventBus`.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::fusion::scanner::ScannerKind;

/// What a listener is being told about a fused advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AdvertisementChange {
   /// First view of the device for this listener's class.
   FirstSeen,
   /// Newer data for an already known device.
   Update,
}

/// A scanner that has not reported anything for longer than its watchdog
/// timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledScanner {
   pub source: SmolStr,
   pub adapter: SmolStr,
   pub kind: ScannerKind,
   pub silent_for: f64,
}

/// Events that can be emitted by the fusion manager.
#[derive(Debug, Clone, PartialEq)]
pub enum FusionEvent {
   ScannerRegistered {
      source: SmolStr,
      adapter: SmolStr,
      connectable: bool,
   },
   ScannerUnregistered {
      source: SmolStr,
   },
   ScannerStalled(StalledScanner),
   DeviceUnavailable {
      address: Address,
      connectable: bool,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: FusionEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Bus that drops everything, for embedders that only use listeners.
pub struct NullBus;

impl EventBus for NullBus {
   fn emit(&self, _event: FusionEvent) {}
}

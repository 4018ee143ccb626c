//! Error types for the advertisement fusion service.
//!
//! `FusionError` covers everything that can fail while registering
//! scanners and listeners, talking to the manager actor, persisting the
//! tracker and running the daemon. `PollError` is what user-supplied poll
//! functions return; it never propagates out of a coordinator.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the fusion service.
#[derive(Error, Debug)]
pub enum FusionError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Scanner source {source_id} is already registered (connectable: {connectable})")]
   DuplicateSource {
      source_id: SmolStr,
      connectable: bool,
   },

   #[error("Invalid matcher: {0}")]
   InvalidMatcher(String),

   #[error("Timed out waiting for advertisement")]
   Timeout,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Coordinator already started")]
   AlreadyStarted,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Tracker store error: {0}")]
   Store(#[from] crate::fusion::store::Error),
}

/// Failure of a single active poll.
///
/// Transport and protocol failures are treated identically by the
/// coordinator: logged once per failure streak, last-known data retained.
#[derive(Error, Debug, Clone)]
pub enum PollError {
   #[error("transport error: {0}")]
   Transport(String),

   #[error("protocol error: {0}")]
   Protocol(String),

   #[error("poll timed out")]
   Timeout,
}

impl From<bluer::Error> for PollError {
   fn from(err: bluer::Error) -> Self {
      Self::Transport(err.to_string())
   }
}

/// Convenience type alias for Results with `FusionError`.
pub type Result<T> = std::result::Result<T, FusionError>;

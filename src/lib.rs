//! BLE advertisement fusion.
//!
//! Many scanners (local HCI adapters, remote proxies) report advertisements
//! for the same devices. The [`fusion::FusionManager`] keeps one best view
//! per device and connectable class, tracks availability from learned
//! advertising intervals, and hands the result to listeners and per-device
//! [`coordinator`]s.

pub mod advertisement;
pub mod bluetooth;
pub mod config;
pub mod coordinator;
pub mod dbus;
pub mod error;
pub mod event;
pub mod fusion;

//! Bluetooth layer for local adapters.
//!
//! This module registers the host's HCI adapters as fusion scanners and
//! keeps them discovering.

pub mod adapter;

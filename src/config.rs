//! Configuration management for the fusion service.
//!
//! This module handles loading and saving configuration from disk. All
//! timing knobs of the fusion manager, the scanner watchdog and the active
//! poll debouncer live here.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   #[serde(default)]
   pub fusion: FusionConfig,

   #[serde(default)]
   pub poll: PollConfig,

   #[serde(default = "default_tracker_persistence")]
   pub tracker_persistence: bool,

   #[serde(default = "default_adapter_check_interval")]
   pub adapter_check_interval_secs: u64,
}

/// Timings used by the fusion manager and its watchdogs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FusionConfig {
   /// Number of consecutive advertisements needed to learn an interval.
   #[serde(default = "default_advertising_times_needed")]
   pub advertising_times_needed: usize,

   /// Stale threshold for local scanners without a learned interval.
   #[serde(default = "default_fallback_max_stale")]
   pub fallback_max_stale_secs: f64,

   /// Stale threshold for remote proxies without a learned interval.
   #[serde(default = "default_remote_fallback_max_stale")]
   pub remote_fallback_max_stale_secs: f64,

   /// Slack added to a per-address fallback interval before another
   /// scanner may take over a view.
   #[serde(default = "default_fallback_interval_wobble")]
   pub fallback_interval_wobble_secs: f64,

   #[serde(default = "default_stale_interval_multiplier")]
   pub stale_interval_multiplier: f64,

   #[serde(default = "default_unavailable_track")]
   pub unavailable_track_secs: u64,

   #[serde(default = "default_watchdog_interval")]
   pub scanner_watchdog_interval_secs: u64,

   #[serde(default = "default_watchdog_timeout")]
   pub scanner_watchdog_timeout_secs: f64,

   #[serde(default = "default_remote_watchdog_timeout")]
   pub remote_scanner_watchdog_timeout_secs: f64,

   #[serde(default = "default_tracker_save_interval")]
   pub tracker_save_interval_secs: u64,

   #[serde(default = "default_tracker_max_age")]
   pub tracker_max_age_secs: u64,
}

/// Settings for active polling coordinators.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PollConfig {
   #[serde(default = "default_poll_debounce_cooldown")]
   pub debounce_cooldown_secs: f64,

   #[serde(default = "default_poll_timeout")]
   pub timeout_secs: f64,
}

const fn default_tracker_persistence() -> bool {
   true
}

const fn default_adapter_check_interval() -> u64 {
   10
}

const fn default_advertising_times_needed() -> usize {
   16
}

const fn default_fallback_max_stale() -> f64 {
   60.0
}

const fn default_remote_fallback_max_stale() -> f64 {
   195.0
}

const fn default_fallback_interval_wobble() -> f64 {
   5.0
}

const fn default_stale_interval_multiplier() -> f64 {
   4.0
}

const fn default_unavailable_track() -> u64 {
   5 * 60
}

const fn default_watchdog_interval() -> u64 {
   30
}

const fn default_watchdog_timeout() -> f64 {
   90.0
}

const fn default_remote_watchdog_timeout() -> f64 {
   300.0
}

const fn default_tracker_save_interval() -> u64 {
   5 * 60
}

const fn default_tracker_max_age() -> u64 {
   7 * 24 * 60 * 60
}

const fn default_poll_debounce_cooldown() -> f64 {
   10.0
}

const fn default_poll_timeout() -> f64 {
   30.0
}

impl Default for Config {
   fn default() -> Self {
      Self {
         fusion: FusionConfig::default(),
         poll: PollConfig::default(),
         tracker_persistence: default_tracker_persistence(),
         adapter_check_interval_secs: default_adapter_check_interval(),
      }
   }
}

impl Default for FusionConfig {
   fn default() -> Self {
      Self {
         advertising_times_needed: default_advertising_times_needed(),
         fallback_max_stale_secs: default_fallback_max_stale(),
         remote_fallback_max_stale_secs: default_remote_fallback_max_stale(),
         fallback_interval_wobble_secs: default_fallback_interval_wobble(),
         stale_interval_multiplier: default_stale_interval_multiplier(),
         unavailable_track_secs: default_unavailable_track(),
         scanner_watchdog_interval_secs: default_watchdog_interval(),
         scanner_watchdog_timeout_secs: default_watchdog_timeout(),
         remote_scanner_watchdog_timeout_secs: default_remote_watchdog_timeout(),
         tracker_save_interval_secs: default_tracker_save_interval(),
         tracker_max_age_secs: default_tracker_max_age(),
      }
   }
}

impl Default for PollConfig {
   fn default() -> Self {
      Self {
         debounce_cooldown_secs: default_poll_debounce_cooldown(),
         timeout_secs: default_poll_timeout(),
      }
   }
}

impl FusionConfig {
   pub fn unavailable_track_interval(&self) -> Duration {
      Duration::from_secs(self.unavailable_track_secs.max(1))
   }

   pub fn scanner_watchdog_interval(&self) -> Duration {
      Duration::from_secs(self.scanner_watchdog_interval_secs.max(1))
   }

   pub fn tracker_save_interval(&self) -> Duration {
      Duration::from_secs(self.tracker_save_interval_secs.max(1))
   }
}

/// Upper bound for poll timings; `inf` in the config file lands here.
const MAX_POLL_SECS: f64 = 24.0 * 60.0 * 60.0;

fn poll_duration(secs: f64) -> Duration {
   // `max` and `min` both discard NaN.
   Duration::from_secs_f64(secs.max(0.0).min(MAX_POLL_SECS))
}

impl PollConfig {
   pub fn debounce_cooldown(&self) -> Duration {
      poll_duration(self.debounce_cooldown_secs)
   }

   pub fn timeout(&self) -> Duration {
      poll_duration(self.timeout_secs)
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(blefuse_home) = env::var("BLEFUSE_HOME") {
         PathBuf::from(blefuse_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(FusionError::ConfigDirNotFound);
      };

      Ok(config_dir.join("blefuse").join("config.toml"))
   }
}

//! Configuration management for the lock service.
//!
//! This module handles loading and saving configuration from disk,
//! including the target device identity and session behaviour.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
   error::{LockError, Result},
   target::TargetDevice,
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub target: TargetConfig,

   /// BlueZ adapter to watch, e.g. `hci0`. The default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_true")]
   pub status_indicator: bool,

   #[serde(default = "default_true")]
   pub resume_after_restart: bool,
}

/// Identity of the device to watch, as written in the config file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetConfig {
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub name: Option<String>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub address: Option<String>,
}

impl Default for TargetConfig {
   fn default() -> Self {
      Self {
         name: Some("Airdopes 148".to_string()),
         address: Some("5D:1F:6F:FA:A5:CA".to_string()),
      }
   }
}

const fn default_true() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         target: TargetConfig::default(),
         adapter: None,
         status_indicator: default_true(),
         resume_after_restart: default_true(),
      }
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
      let config_dir = if let Ok(btlock_home) = env::var("BTLOCK_HOME") {
         PathBuf::from(btlock_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(LockError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btlock").join("config.toml"))
   }

   /// Validates the configured identity and returns the matcher for it.
   pub fn target_device(&self) -> Result<TargetDevice> {
      TargetDevice::new(self.target.name.as_deref(), self.target.address.as_deref())
   }
}

//! Error types for the lock service.
//!
//! This module defines every error that can surface while monitoring the
//! target device, talking to BlueZ/logind/polkit over D-Bus, or touching
//! the configuration and run-state files.

use thiserror::Error;

/// Main error type for the lock service.
#[derive(Error, Debug)]
pub enum LockError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Lock permission not granted, run `btlockd grant` first")]
   PermissionDenied,

   #[error("Failed to subscribe to connection events: {0}")]
   SubscriptionFailed(String),

   #[error("Invalid target device: {0}")]
   InvalidTarget(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Run-state store error: {0}")]
   Store(#[from] heed::Error),

   #[error("Monitor has been shut down")]
   MonitorShutdown,

   #[error("btlockd is not running on the session bus")]
   DaemonNotRunning,
}

/// Convenience type alias for Results with `LockError`.
pub type Result<T> = std::result::Result<T, LockError>;

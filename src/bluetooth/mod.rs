//! Bluetooth event source.
//!
//! This module turns BlueZ device property changes into connection events
//! for the monitor.

pub mod watcher;

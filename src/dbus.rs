use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   error::LockError,
   monitor::{Monitor, MonitorState},
   target::TargetDevice,
};

/// Well-known name the daemon owns on the session bus.
pub const BUS_NAME: &str = "org.btlock";
/// Object path of the control interface.
pub const OBJECT_PATH: &str = "/org/btlock/monitor";

pub struct MonitorService {
   monitor: Monitor,
   target: TargetDevice,
}

impl MonitorService {
   pub const fn new(monitor: Monitor, target: TargetDevice) -> Self {
      Self { monitor, target }
   }
}

fn to_fdo(e: LockError) -> zbus::fdo::Error {
   match e {
      LockError::PermissionDenied => zbus::fdo::Error::AccessDenied(e.to_string()),
      other => zbus::fdo::Error::Failed(other.to_string()),
   }
}

#[interface(name = "org.btlock.Monitor1")]
impl MonitorService {
   async fn start_monitor(&self) -> zbus::fdo::Result<()> {
      self.monitor.start().await.map_err(to_fdo)?;
      info!("Start requested over D-Bus");
      Ok(())
   }

   async fn stop_monitor(&self) -> zbus::fdo::Result<()> {
      self.monitor.stop().await.map_err(to_fdo)?;
      info!("Stop requested over D-Bus");
      Ok(())
   }

   async fn request_grant(&self) -> zbus::fdo::Result<bool> {
      self.monitor.request_grant().await.map_err(to_fdo)
   }

   /// Returns `(granted, running)`.
   async fn status(&self) -> zbus::fdo::Result<(bool, bool)> {
      let status = self.monitor.status().await.map_err(to_fdo)?;
      Ok((status.granted, status.running()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn monitor_started(emitter: &SignalEmitter<'_>, target: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn monitor_stopped(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn lock_requested(
      emitter: &SignalEmitter<'_>,
      address: &str,
      kind: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self
         .monitor
         .state()
         .await
         .unwrap_or(MonitorState::Stopped)
         .to_string()
   }

   #[zbus(property)]
   async fn target(&self) -> String {
      self.target.to_string()
   }
}

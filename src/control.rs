//! Client side of the control surface.
//!
//! Each CLI command talks to the running daemon over the session bus. When
//! the daemon is not on the bus the run-state flag is read directly, but only
//! as a hint: without a live daemon nothing can be monitoring.

use core::fmt;

use log::warn;
use serde::Serialize;
use zbus::{Connection, fdo::DBusProxy, names::BusName, proxy};

use crate::{
   dbus::BUS_NAME,
   error::{LockError, Result},
   lock::LockBackend,
   store::{HeedStore, RunStateStore},
   system::HostLock,
   target::TargetDevice,
};

#[proxy(
   interface = "org.btlock.Monitor1",
   default_service = "org.btlock",
   default_path = "/org/btlock/monitor"
)]
pub trait MonitorControl {
   fn start_monitor(&self) -> zbus::Result<()>;

   fn stop_monitor(&self) -> zbus::Result<()>;

   fn request_grant(&self) -> zbus::Result<bool>;

   fn status(&self) -> zbus::Result<(bool, bool)>;
}

/// What `btlockd status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
   pub target: String,
   pub granted: bool,
   pub running: bool,
   pub daemon_alive: bool,
   /// The flag claims a session although no daemon is alive.
   pub stale_flag: bool,
}

impl StatusReport {
   /// Status as answered by a live daemon.
   pub fn from_daemon(target: &TargetDevice, granted: bool, running: bool) -> Self {
      Self {
         target: target.to_string(),
         granted,
         running,
         daemon_alive: true,
         stale_flag: false,
      }
   }

   /// Status reconstructed from the persisted flag when no daemon is alive.
   pub fn from_flag(target: &TargetDevice, granted: bool, flag: bool) -> Self {
      Self {
         target: target.to_string(),
         granted,
         running: false,
         daemon_alive: false,
         stale_flag: flag,
      }
   }
}

impl fmt::Display for StatusReport {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let yes_no = |b: bool, yes: &'static str, no: &'static str| if b { yes } else { no };
      writeln!(
         f,
         "Lock permission: {}",
         yes_no(self.granted, "granted", "not granted")
      )?;
      writeln!(f, "Monitor: {}", yes_no(self.running, "running", "stopped"))?;
      writeln!(f, "Target device: {}", self.target)?;

      if !self.daemon_alive {
         writeln!(f, "Daemon: not running")?;
      }
      if self.stale_flag {
         writeln!(
            f,
            "Note: the last session ended without shutting down cleanly"
         )?;
      }
      if !self.granted {
         writeln!(f, "Run `btlockd grant` to allow locking the session.")?;
      }
      Ok(())
   }
}

/// Maps an error returned by the daemon back onto our own taxonomy.
fn remote_error(e: zbus::Error) -> LockError {
   if let zbus::Error::MethodError(name, _, _) = &e
      && name.as_str() == "org.freedesktop.DBus.Error.AccessDenied"
   {
      return LockError::PermissionDenied;
   }
   match zbus::fdo::Error::from(e) {
      zbus::fdo::Error::AccessDenied(_) => LockError::PermissionDenied,
      other => LockError::DBusConnection(other),
   }
}

async fn daemon_alive(connection: &Connection) -> Result<bool> {
   let name = BusName::try_from(BUS_NAME).map_err(zbus::Error::from)?;
   Ok(DBusProxy::new(connection).await?.name_has_owner(name).await?)
}

/// Proxy to the daemon, or `None` if it does not own its bus name.
async fn daemon(connection: &Connection) -> Result<Option<MonitorControlProxy<'_>>> {
   if !daemon_alive(connection).await? {
      return Ok(None);
   }
   Ok(Some(MonitorControlProxy::new(connection).await?))
}

pub async fn start() -> Result<()> {
   let connection = Connection::session().await?;
   let proxy = daemon(&connection).await?.ok_or(LockError::DaemonNotRunning)?;
   proxy.start_monitor().await.map_err(remote_error)?;
   println!("Monitor started");
   Ok(())
}

pub async fn stop() -> Result<()> {
   let connection = Connection::session().await?;
   match daemon(&connection).await? {
      Some(proxy) => {
         proxy.stop_monitor().await.map_err(remote_error)?;
         println!("Monitor stopped");
      },
      None => println!("Monitor is not running"),
   }
   Ok(())
}

pub async fn grant() -> Result<()> {
   let connection = Connection::session().await?;
   let granted = match daemon(&connection).await? {
      Some(proxy) => proxy.request_grant().await.map_err(remote_error)?,
      None => HostLock::connect().await?.request_grant().await?,
   };

   if granted {
      println!("Lock permission granted");
   } else {
      println!("Lock permission not granted");
   }
   Ok(())
}

pub async fn status(target: &TargetDevice, json: bool) -> Result<()> {
   let connection = Connection::session().await?;
   let report = match daemon(&connection).await? {
      Some(proxy) => {
         let (granted, running) = proxy.status().await.map_err(remote_error)?;
         StatusReport::from_daemon(target, granted, running)
      },
      None => {
         let flag = HeedStore::open()?.get_running()?;
         if flag {
            warn!("Run-state flag is set but btlockd is not on the bus");
         }
         let granted = HostLock::connect().await?.is_granted().await;
         StatusReport::from_flag(target, granted, flag)
      },
   };

   if json {
      println!(
         "{}",
         serde_json::to_string(&report).map_err(|e| LockError::Io(e.into()))?
      );
   } else {
      print!("{report}");
   }
   Ok(())
}

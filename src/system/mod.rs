//! Host integration over D-Bus.
//!
//! logind provides the lock primitive, polkit owns the grant that allows
//! calling it, and the desktop notification service hosts the status
//! indicator.

pub mod logind;
pub mod notifications;
pub mod polkit;

use log::debug;
use zbus::Connection;

use crate::{error::Result, lock::LockBackend};

use self::logind::Login1ManagerProxy;

/// Locks every session through logind, gated by polkit.
#[derive(Clone, Debug)]
pub struct HostLock {
   connection: Connection,
}

impl HostLock {
   /// Connects to the system bus.
   pub async fn connect() -> Result<Self> {
      Ok(Self {
         connection: Connection::system().await?,
      })
   }
}

impl LockBackend for HostLock {
   async fn is_granted(&self) -> bool {
      match polkit::check_lock_authorization(&self.connection, false).await {
         Ok(granted) => granted,
         Err(e) => {
            debug!("Could not query lock authorization: {e}");
            false
         },
      }
   }

   async fn request_grant(&self) -> Result<bool> {
      polkit::check_lock_authorization(&self.connection, true).await
   }

   async fn lock_now(&self) -> Result<()> {
      Login1ManagerProxy::new(&self.connection)
         .await?
         .lock_sessions()
         .await?;
      Ok(())
   }
}

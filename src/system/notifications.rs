//! Persistent status indicator shown while a monitoring session runs.

use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::Mutex;
use zbus::{Connection, proxy, zvariant::Value};

use crate::error::Result;

const APP_NAME: &str = "btlockd";
const ICON: &str = "system-lock-screen";
/// Freedesktop urgency level "low".
const URGENCY_LOW: u8 = 0;
/// Expiry value meaning "never expires".
const NEVER_EXPIRE: i32 = 0;

#[proxy(
   interface = "org.freedesktop.Notifications",
   default_service = "org.freedesktop.Notifications",
   default_path = "/org/freedesktop/Notifications"
)]
pub trait Notifications {
   fn notify(
      &self,
      app_name: &str,
      replaces_id: u32,
      app_icon: &str,
      summary: &str,
      body: &str,
      actions: &[&str],
      hints: &HashMap<&str, &Value<'_>>,
      expire_timeout: i32,
   ) -> zbus::Result<u32>;

   fn close_notification(&self, id: u32) -> zbus::Result<()>;
}

/// Resident, low-urgency desktop notification naming the watched device.
pub struct StatusIndicator {
   proxy: NotificationsProxy<'static>,
   body: String,
   shown: Mutex<Option<u32>>,
}

impl StatusIndicator {
   pub async fn new(connection: &Connection, target: &str) -> Result<Self> {
      Ok(Self {
         proxy: NotificationsProxy::new(connection).await?,
         body: format!("Monitoring {target}"),
         shown: Mutex::new(None),
      })
   }

   /// Shows the indicator, replacing a previous one if still on screen.
   pub async fn show(&self) {
      let urgency = Value::from(URGENCY_LOW);
      let resident = Value::from(true);
      let hints = HashMap::from([("urgency", &urgency), ("resident", &resident)]);
      let replaces = self.shown.lock().unwrap_or(0);

      match self
         .proxy
         .notify(
            APP_NAME,
            replaces,
            ICON,
            "Bluetooth auto lock active",
            &self.body,
            &[],
            &hints,
            NEVER_EXPIRE,
         )
         .await
      {
         Ok(id) => {
            debug!("Status indicator shown (id {id})");
            *self.shown.lock() = Some(id);
         },
         Err(e) => warn!("Failed to show status indicator: {e}"),
      }
   }

   pub async fn hide(&self) {
      let Some(id) = self.shown.lock().take() else {
         return;
      };
      if let Err(e) = self.proxy.close_notification(id).await {
         debug!("Failed to close status indicator {id}: {e}");
      }
   }
}

//! polkit authority, used to read and request the lock capability.

use std::collections::HashMap;

use log::debug;
use zbus::{Connection, proxy, zvariant::Value};

use crate::error::{LockError, Result};

/// polkit action guarding `LockSessions`.
pub const LOCK_SESSIONS_ACTION: &str = "org.freedesktop.login1.lock-sessions";

/// `CheckAuthorization` flag letting polkit prompt through the user's agent.
const ALLOW_USER_INTERACTION: u32 = 0x1;

#[proxy(
   interface = "org.freedesktop.PolicyKit1.Authority",
   default_service = "org.freedesktop.PolicyKit1",
   default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
pub trait Authority {
   fn check_authorization(
      &self,
      subject: &(&str, HashMap<&str, Value<'_>>),
      action_id: &str,
      details: &HashMap<&str, &str>,
      flags: u32,
      cancellation_id: &str,
   ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

/// Checks whether the process behind `connection` may lock sessions.
///
/// With `interactive` set polkit may show an authentication dialog, and the
/// call only returns once the user has answered it.
pub async fn check_lock_authorization(connection: &Connection, interactive: bool) -> Result<bool> {
   let bus_name = connection.unique_name().ok_or_else(|| {
      LockError::DBus(zbus::Error::Failure("connection has no unique name".into()))
   })?;

   let subject = (
      "system-bus-name",
      HashMap::from([("name", Value::from(bus_name.as_str()))]),
   );
   let flags = if interactive { ALLOW_USER_INTERACTION } else { 0 };

   let authority = AuthorityProxy::new(connection).await?;
   let (authorized, challenge, _details) = authority
      .check_authorization(&subject, LOCK_SESSIONS_ACTION, &HashMap::new(), flags, "")
      .await?;

   if !authorized && challenge {
      debug!("Lock capability requires authentication");
   }
   Ok(authorized)
}

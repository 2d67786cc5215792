//! systemd-logind manager interface.

use zbus::proxy;

#[proxy(
   interface = "org.freedesktop.login1.Manager",
   default_service = "org.freedesktop.login1",
   default_path = "/org/freedesktop/login1"
)]
pub trait Login1Manager {
   /// Asks every session to lock its screen.
   fn lock_sessions(&self) -> zbus::Result<()>;
}

//! The privileged lock action.
//!
//! Locking is best-effort: a missing grant turns the call into a no-op and a
//! failing host call is logged and absorbed.

use std::{future::Future, sync::Arc};

use log::{debug, info, warn};

use crate::error::Result;

/// Host capability able to lock the screen immediately.
pub trait LockBackend: Send + Sync + 'static {
   /// Whether the host currently grants this program the lock capability.
   fn is_granted(&self) -> impl Future<Output = bool> + Send;

   /// Runs the host consent flow; resolves to the resulting grant state.
   fn request_grant(&self) -> impl Future<Output = Result<bool>> + Send;

   /// Locks now. Locking an already locked session is a no-op on the host.
   fn lock_now(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Checks the grant and calls the lock primitive once per request.
#[derive(Debug)]
pub struct LockAction<B> {
   backend: Arc<B>,
}

impl<B> Clone for LockAction<B> {
   fn clone(&self) -> Self {
      Self {
         backend: self.backend.clone(),
      }
   }
}

impl<B: LockBackend> LockAction<B> {
   pub const fn new(backend: Arc<B>) -> Self {
      Self { backend }
   }

   pub const fn backend(&self) -> &Arc<B> {
      &self.backend
   }

   /// Locks the session unless the grant has been revoked.
   ///
   /// Returns whether the host was asked to lock, regardless of whether it
   /// succeeded.
   pub async fn lock(&self, reason: &str) -> bool {
      if !self.backend.is_granted().await {
         debug!("Lock skipped, capability not granted: {reason}");
         return false;
      }

      info!("Locking session: {reason}");
      if let Err(e) = self.backend.lock_now().await {
         warn!("Lock request failed: {e}");
      }
      true
   }
}

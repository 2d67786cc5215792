//! Persistent run-state flag using heed (LMDB).
//!
//! A single boolean under `service_running` records whether a monitoring
//! session is believed to be active. It is a hint for the control surface,
//! not ground truth: a killed daemon leaves it stale.

use std::{
   future::Future,
   path::{Path, PathBuf},
};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::{debug, warn};

use crate::error::{LockError, Result};

/// Key of the run-state flag.
pub const RUN_STATE_KEY: &str = "service_running";

/// Durable key/value storage for the run-state flag.
pub trait RunStateStore: Send + Sync {
   /// Reads the flag, `false` if it was never written.
   fn get_running(&self) -> Result<bool>;

   fn set_running(&self, running: bool) -> Result<()>;
}

/// LMDB-backed run-state store.
#[derive(Clone, Debug)]
pub struct HeedStore {
   env: Env,
   flags: Database<Str, SerdeBincode<bool>>,
}

impl HeedStore {
   /// Opens or creates the store at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024)
            .max_dbs(1)
            .open(path)?
      };

      let mut wtxn = env.write_txn()?;
      let flags = env.create_database(&mut wtxn, Some("run_state"))?;
      wtxn.commit()?;

      debug!("Opened run-state store at {}", path.display());
      Ok(Self { env, flags })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BTLOCK_STATE_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/btlock/state.db
      let base = dirs::data_local_dir().ok_or(LockError::DataDirectoryNotFound)?;
      Ok(base.join("btlock").join("state.db"))
   }
}

impl RunStateStore for HeedStore {
   fn get_running(&self) -> Result<bool> {
      let rtxn = self.env.read_txn()?;
      Ok(self.flags.get(&rtxn, RUN_STATE_KEY)?.unwrap_or(false))
   }

   fn set_running(&self, running: bool) -> Result<()> {
      let mut wtxn = self.env.write_txn()?;
      self.flags.put(&mut wtxn, RUN_STATE_KEY, &running)?;
      wtxn.commit()?;
      Ok(())
   }
}

/// Reads the flag and clears it if it was left set.
///
/// Must only be called when no session can be alive, see
/// [`claim_and_reconcile`].
/// Returns whether a stale `true` was found.
pub fn take_stale_flag(store: &dyn RunStateStore) -> Result<bool> {
   if !store.get_running()? {
      return Ok(false);
   }
   warn!("Run-state flag was left set by a session that did not shut down cleanly");
   store.set_running(false)?;
   Ok(true)
}

/// Claims the daemon role with `claim`, then clears a flag left stale.
///
/// The flag is left alone when the claim fails: another daemon may own it.
/// Returns the claim's output and whether a stale flag was found.
pub async fn claim_and_reconcile<T, F>(store: &dyn RunStateStore, claim: F) -> Result<(T, bool)>
where
   F: Future<Output = Result<T>>,
{
   let claimed = claim.await?;
   let stale = take_stale_flag(store).unwrap_or_else(|e| {
      warn!("Could not reconcile run-state flag: {e}");
      false
   });
   Ok((claimed, stale))
}

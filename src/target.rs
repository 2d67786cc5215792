//! Target device identity and matching.
//!
//! The service watches exactly one peripheral. A connection event belongs to
//! it when either the reported name or the hardware address is an exact
//! match for the configured value.

use core::fmt;
use std::str::FromStr;

use bluer::Address;
use smol_str::SmolStr;

use crate::error::{LockError, Result};

/// The single peripheral whose connect/disconnect events trigger a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
   name: Option<SmolStr>,
   address: Option<Address>,
}

impl TargetDevice {
   /// Builds a target from its configured name and/or address string.
   ///
   /// At least one of the two must be present; empty strings count as absent.
   pub fn new(name: Option<&str>, address: Option<&str>) -> Result<Self> {
      let name = name.map(str::trim).filter(|n| !n.is_empty()).map(SmolStr::new);
      let address = match address.map(str::trim).filter(|a| !a.is_empty()) {
         Some(a) => Some(
            Address::from_str(a)
               .map_err(|e| LockError::InvalidTarget(format!("bad address {a:?}: {e}")))?,
         ),
         None => None,
      };

      if name.is_none() && address.is_none() {
         return Err(LockError::InvalidTarget(
            "either a name or an address is required".into(),
         ));
      }
      Ok(Self { name, address })
   }

   pub fn name(&self) -> Option<&str> {
      self.name.as_deref()
   }

   pub const fn address(&self) -> Option<Address> {
      self.address
   }

   /// Returns true if the candidate is the target device.
   ///
   /// A candidate without a readable name can still match on its address.
   pub fn matches(&self, candidate_name: Option<&str>, candidate_address: Address) -> bool {
      let name_match = matches!(
         (self.name.as_deref(), candidate_name),
         (Some(expected), Some(actual)) if expected == actual
      );
      name_match || self.address == Some(candidate_address)
   }
}

impl fmt::Display for TargetDevice {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match (&self.name, &self.address) {
         (Some(name), Some(addr)) => write!(f, "{name} ({addr})"),
         (Some(name), None) => f.write_str(name),
         (None, Some(addr)) => write!(f, "{addr}"),
         (None, None) => f.write_str("<unset>"),
      }
   }
}

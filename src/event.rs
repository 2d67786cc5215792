//! Event types flowing into and out of the connection monitor.
//!
//! Inbound, an [`EventSource`] pushes [`ConnectionEvent`]s onto a channel for
//! the lifetime of a [`Subscription`]. Outbound, the monitor reports its
//! lifecycle through an [`EventBus`].

use std::{future::Future, sync::Arc};

use bluer::Address;
use smol_str::SmolStr;
use strum::{Display, IntoStaticStr};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::error::Result;

/// Kind of link change reported by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionKind {
   Connected,
   Disconnected,
}

/// A peripheral connected or disconnected. Consumed once, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
   pub kind: ConnectionKind,
   /// `None` when the host could not or would not report a name.
   pub name: Option<SmolStr>,
   pub address: Address,
}

impl ConnectionEvent {
   /// Human readable reason used when locking because of this event.
   pub fn reason(&self) -> String {
      let who = self
         .name
         .as_ref()
         .map_or_else(|| self.address.to_string(), SmolStr::to_string);
      match self.kind {
         ConnectionKind::Connected => format!("Connected to {who}"),
         ConnectionKind::Disconnected => format!("Disconnected from {who}"),
      }
   }
}

/// Why a monitoring session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
   Requested,
   SubscriptionLost,
   Shutdown,
}

/// Events that can be emitted by the connection monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
   Started,
   Stopped(StopReason),
   /// A target event was handed to the lock action.
   LockRequested(ConnectionEvent),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: MonitorEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// A producer of connection events, e.g. the BlueZ device watcher.
pub trait EventSource: Send + Sync + 'static {
   /// Registers for connected/disconnected notifications.
   ///
   /// Events flow until the returned subscription is dropped.
   fn subscribe(&self) -> impl Future<Output = Result<Subscription>> + Send;
}

/// An active registration with an [`EventSource`].
///
/// Dropping it unsubscribes: the producing task is aborted and no further
/// events are delivered.
#[derive(Debug)]
pub struct Subscription {
   events: mpsc::Receiver<ConnectionEvent>,
   task: Option<JoinHandle<()>>,
}

impl Subscription {
   pub const fn new(events: mpsc::Receiver<ConnectionEvent>, task: Option<JoinHandle<()>>) -> Self {
      Self { events, task }
   }

   /// Waits for the next event; `None` once the source has gone away.
   pub async fn recv(&mut self) -> Option<ConnectionEvent> {
      self.events.recv().await
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      if let Some(task) = self.task.take() {
         task.abort();
      }
   }
}

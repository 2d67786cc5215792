//! Connection monitor.
//!
//! The monitor owns the session state machine. A single actor task receives
//! control commands and, while a session runs, the connection events of the
//! active subscription. Matching events are handed to the lock action inline,
//! one at a time, in delivery order.

use std::sync::Arc;

use log::{debug, info, warn};
use strum::{Display, IntoStaticStr};
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use crate::{
   error::{LockError, Result},
   event::{ConnectionEvent, EventSender, EventSource, MonitorEvent, StopReason, Subscription},
   lock::{LockAction, LockBackend},
   store::RunStateStore,
   target::TargetDevice,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Lifecycle of a monitoring session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum MonitorState {
   Stopped,
   Starting,
   Running,
   Stopping,
}

/// Snapshot answered to `query status`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
   pub state: MonitorState,
   pub granted: bool,
}

impl MonitorStatus {
   pub fn running(&self) -> bool {
      self.state == MonitorState::Running
   }
}

// === Commands ===

#[derive(Debug)]
enum MonitorCommand {
   Start(oneshot::Sender<Result<()>>),
   Stop(oneshot::Sender<()>),
   State(oneshot::Sender<MonitorState>),
   Status(oneshot::Sender<MonitorStatus>),
   RequestGrant(oneshot::Sender<Result<bool>>),
   Shutdown(oneshot::Sender<()>),
}

// === Handle ===

/// Control handle for the connection monitor.
///
/// Cloning is cheap. When the last handle is dropped the actor stops any
/// running session and exits.
#[derive(Clone, Debug)]
pub struct Monitor {
   inbox: mpsc::Sender<MonitorCommand>,
}

impl Monitor {
   pub fn new<S, B>(
      target: TargetDevice,
      source: S,
      backend: Arc<B>,
      store: Arc<dyn RunStateStore>,
      event_tx: EventSender,
   ) -> Self
   where
      S: EventSource,
      B: LockBackend,
   {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = MonitorActor {
         target,
         source,
         lock: LockAction::new(backend),
         store,
         event_tx,
         command_rx,
         state: MonitorState::Stopped,
         subscription: None,
      };
      tokio::spawn(actor.run());
      Self { inbox: command_tx }
   }

   /// Starts a session. A no-op if one is already running.
   pub async fn start(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(MonitorCommand::Start(tx))
         .await
         .map_err(|_| LockError::MonitorShutdown)?;
      rx.await.map_err(|_| LockError::MonitorShutdown)?
   }

   /// Stops the running session. A no-op if none is running.
   pub async fn stop(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(MonitorCommand::Stop(tx))
         .await
         .map_err(|_| LockError::MonitorShutdown)?;
      rx.await.map_err(|_| LockError::MonitorShutdown)
   }

   /// Current session state, answered without asking the host anything.
   pub async fn state(&self) -> Result<MonitorState> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(MonitorCommand::State(tx))
         .await
         .map_err(|_| LockError::MonitorShutdown)?;
      rx.await.map_err(|_| LockError::MonitorShutdown)
   }

   /// Session state together with the current grant.
   ///
   /// The grant lookup runs beside the actor, so it never delays events.
   pub async fn status(&self) -> Result<MonitorStatus> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(MonitorCommand::Status(tx))
         .await
         .map_err(|_| LockError::MonitorShutdown)?;
      rx.await.map_err(|_| LockError::MonitorShutdown)
   }

   /// Asks the host to run its consent flow for the lock capability.
   ///
   /// The flow may wait on the user; the monitor keeps handling events
   /// meanwhile.
   pub async fn request_grant(&self) -> Result<bool> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(MonitorCommand::RequestGrant(tx))
         .await
         .map_err(|_| LockError::MonitorShutdown)?;
      rx.await.map_err(|_| LockError::MonitorShutdown)?
   }

   /// Stops any running session and terminates the actor.
   ///
   /// Every handle reports `MonitorShutdown` afterwards.
   pub async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(MonitorCommand::Shutdown(tx))
         .await
         .map_err(|_| LockError::MonitorShutdown)?;
      rx.await.map_err(|_| LockError::MonitorShutdown)
   }
}

// === Monitor Actor ===

struct MonitorActor<S, B> {
   target: TargetDevice,
   source: S,
   lock: LockAction<B>,
   store: Arc<dyn RunStateStore>,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<MonitorCommand>,

   // State
   state: MonitorState,
   subscription: Option<Subscription>,
}

impl<S: EventSource, B: LockBackend> MonitorActor<S, B> {
   async fn run(mut self) {
      debug!("Connection monitor ready for {}", self.target);

      loop {
         select! {
            biased;

            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            event = next_event(&mut self.subscription) => {
               match event {
                  Some(event) => self.handle_event(event).await,
                  None => self.stop_session(StopReason::SubscriptionLost),
               }
            }
         }
      }

      self.stop_session(StopReason::Shutdown);
      debug!("Connection monitor exited");
   }

   async fn handle_command(&mut self, cmd: MonitorCommand) -> bool {
      match cmd {
         MonitorCommand::Start(reply) => {
            let result = self.start_session().await;
            let _ = reply.send(result);
         },
         MonitorCommand::Stop(reply) => {
            self.stop_session(StopReason::Requested);
            let _ = reply.send(());
         },
         MonitorCommand::State(reply) => {
            let _ = reply.send(self.state);
         },
         MonitorCommand::Status(reply) => {
            let state = self.state;
            let backend = self.lock.backend().clone();
            tokio::spawn(async move {
               let granted = backend.is_granted().await;
               let _ = reply.send(MonitorStatus { state, granted });
            });
         },
         MonitorCommand::RequestGrant(reply) => {
            let backend = self.lock.backend().clone();
            tokio::spawn(async move {
               let _ = reply.send(backend.request_grant().await);
            });
         },
         MonitorCommand::Shutdown(reply) => {
            self.stop_session(StopReason::Shutdown);
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   async fn start_session(&mut self) -> Result<()> {
      if self.state == MonitorState::Running {
         debug!("Start requested while already running");
         return Ok(());
      }

      if !self.lock.backend().is_granted().await {
         warn!("Refusing to start monitor: lock capability not granted");
         return Err(LockError::PermissionDenied);
      }

      self.state = MonitorState::Starting;
      self.persist(true);

      match self.source.subscribe().await {
         Ok(subscription) => {
            self.subscription = Some(subscription);
            self.state = MonitorState::Running;
            info!("Monitoring {} for connection changes", self.target);
            self.event_tx.emit(MonitorEvent::Started);
            Ok(())
         },
         Err(e) => {
            warn!("Failed to subscribe to connection events: {e}");
            self.persist(false);
            self.state = MonitorState::Stopped;
            Err(match e {
               LockError::SubscriptionFailed(_) => e,
               other => LockError::SubscriptionFailed(other.to_string()),
            })
         },
      }
   }

   fn stop_session(&mut self, reason: StopReason) {
      if self.state != MonitorState::Running {
         if reason == StopReason::Requested {
            debug!("Stop requested while not running");
         }
         return;
      }

      self.state = MonitorState::Stopping;
      self.subscription = None;
      self.persist(false);
      self.state = MonitorState::Stopped;

      match reason {
         StopReason::SubscriptionLost => {
            warn!("Connection event source went away, monitor stopped");
         },
         _ => info!("Monitor stopped ({reason})"),
      }
      self.event_tx.emit(MonitorEvent::Stopped(reason));
   }

   async fn handle_event(&mut self, event: ConnectionEvent) {
      if !self.target.matches(event.name.as_deref(), event.address) {
         debug!("Ignoring {} event for {}", event.kind, event.address);
         return;
      }

      if self.lock.lock(&event.reason()).await {
         self.event_tx.emit(MonitorEvent::LockRequested(event));
      }
   }

   fn persist(&self, running: bool) {
      if let Err(e) = self.store.set_running(running) {
         warn!("Failed to persist run-state flag ({running}): {e}");
      }
   }
}

/// Next event of the active subscription; pends forever without one.
async fn next_event(subscription: &mut Option<Subscription>) -> Option<ConnectionEvent> {
   match subscription {
      Some(subscription) => subscription.recv().await,
      None => std::future::pending().await,
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;
   use crate::{
      event::ConnectionKind,
      testing::{
         FakeBackend, FakeSource, MemoryStore, OTHER_ADDRESS, RecordingBus, TARGET_ADDRESS, event,
         next_event,
      },
   };

   struct Harness {
      monitor: Monitor,
      source: FakeSource,
      backend: FakeBackend,
      store: Arc<MemoryStore>,
      events: mpsc::UnboundedReceiver<MonitorEvent>,
   }

   fn harness(granted: bool) -> Harness {
      let target = TargetDevice::new(Some("Airdopes 148"), Some("5D:1F:6F:FA:A5:CA")).unwrap();
      let source = FakeSource::default();
      let backend = FakeBackend::new(granted);
      let store = Arc::new(MemoryStore::default());
      let (bus, events) = RecordingBus::new();
      let monitor = Monitor::new(
         target,
         source.clone(),
         Arc::new(backend.clone()),
         store.clone(),
         bus,
      );
      Harness {
         monitor,
         source,
         backend,
         store,
         events,
      }
   }

   /// Returns once the actor has finished handling everything sent so far.
   async fn handled(monitor: &Monitor, sender: &mpsc::Sender<ConnectionEvent>) {
      while sender.capacity() < sender.max_capacity() {
         tokio::task::yield_now().await;
      }
      // The actor handles one message at a time, so this answer comes after
      // the last event taken off the channel.
      monitor.state().await.unwrap();
   }

   async fn running_harness() -> Harness {
      let mut h = harness(true);
      h.monitor.start().await.unwrap();
      assert_eq!(next_event(&mut h.events).await, MonitorEvent::Started);
      h
   }

   #[tokio::test]
   async fn test_start_without_grant_is_rejected() {
      let h = harness(false);

      let result = h.monitor.start().await;
      assert!(matches!(result, Err(LockError::PermissionDenied)));

      let status = h.monitor.status().await.unwrap();
      assert_eq!(status.state, MonitorState::Stopped);
      assert!(!status.granted);
      assert!(!h.store.get_running().unwrap());
      assert!(h.store.writes().is_empty());
      assert_eq!(h.source.subscribe_count(), 0);
   }

   #[tokio::test]
   async fn test_start_subscribes_and_sets_flag() {
      let h = running_harness().await;

      let status = h.monitor.status().await.unwrap();
      assert!(status.running());
      assert!(status.granted);
      assert!(h.store.get_running().unwrap());
      assert_eq!(h.source.subscribe_count(), 1);
   }

   #[tokio::test]
   async fn test_address_only_match_locks_once() {
      let mut h = running_harness().await;

      let connected = event(ConnectionKind::Connected, None, TARGET_ADDRESS);
      h.source.sender().send(connected.clone()).await.unwrap();

      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::LockRequested(connected)
      );
      assert_eq!(h.backend.lock_calls(), 1);
   }

   #[tokio::test]
   async fn test_unrelated_device_never_locks() {
      let mut h = running_harness().await;
      let sender = h.source.sender();

      sender
         .send(event(
            ConnectionKind::Connected,
            Some("Random Earbuds"),
            OTHER_ADDRESS,
         ))
         .await
         .unwrap();
      let by_name = event(ConnectionKind::Connected, Some("Airdopes 148"), OTHER_ADDRESS);
      sender.send(by_name.clone()).await.unwrap();

      // Events are handled in order, so the unrelated one was already dropped.
      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::LockRequested(by_name)
      );
      assert_eq!(h.backend.lock_calls(), 1);
   }

   #[tokio::test]
   async fn test_rapid_connect_disconnect_locks_twice() {
      let mut h = running_harness().await;
      let sender = h.source.sender();

      sender
         .send(event(ConnectionKind::Connected, Some("Airdopes 148"), TARGET_ADDRESS))
         .await
         .unwrap();
      sender
         .send(event(
            ConnectionKind::Disconnected,
            Some("Airdopes 148"),
            TARGET_ADDRESS,
         ))
         .await
         .unwrap();

      for _ in 0..2 {
         assert!(matches!(
            next_event(&mut h.events).await,
            MonitorEvent::LockRequested(_)
         ));
      }
      assert_eq!(h.backend.lock_calls(), 2);
      assert!(h.monitor.status().await.unwrap().running());
   }

   #[tokio::test]
   async fn test_revoked_grant_skips_lock_silently() {
      let mut h = running_harness().await;
      h.backend.set_granted(false);

      let sender = h.source.sender();
      sender
         .send(event(ConnectionKind::Connected, None, TARGET_ADDRESS))
         .await
         .unwrap();
      handled(&h.monitor, &sender).await;

      assert_eq!(h.backend.lock_calls(), 0);
      assert!(h.events.try_recv().is_err());
      assert!(h.monitor.status().await.unwrap().running());
   }

   #[tokio::test]
   async fn test_state_does_not_consult_grant() {
      let h = running_harness().await;
      let checks = h.backend.grant_checks();

      assert_eq!(h.monitor.state().await.unwrap(), MonitorState::Running);
      assert_eq!(h.backend.grant_checks(), checks);
   }

   #[tokio::test]
   async fn test_slow_grant_check_does_not_block_actor() {
      let h = running_harness().await;
      let gate = h.backend.hold_grant_checks();
      let checks = h.backend.grant_checks();

      let monitor = h.monitor.clone();
      let status = tokio::spawn(async move { monitor.status().await });
      while h.backend.grant_checks() == checks {
         tokio::task::yield_now().await;
      }

      // The grant check is parked, the actor still answers.
      let state = time::timeout(Duration::from_secs(1), h.monitor.state()).await;
      assert_eq!(state.unwrap().unwrap(), MonitorState::Running);

      drop(gate);
      let status = status.await.unwrap().unwrap();
      assert!(status.running());
      assert!(status.granted);
   }
   #[tokio::test]
   async fn test_stop_clears_flag_and_unsubscribes() {
      let mut h = running_harness().await;
      let sender = h.source.sender();

      h.monitor.stop().await.unwrap();

      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::Stopped(StopReason::Requested)
      );
      assert!(sender.is_closed());
      assert!(!h.store.get_running().unwrap());
      assert_eq!(h.store.writes(), vec![true, false]);
      assert_eq!(
         h.monitor.status().await.unwrap().state,
         MonitorState::Stopped
      );
   }

   #[tokio::test]
   async fn test_stop_when_stopped_is_noop() {
      let mut h = harness(true);

      h.monitor.stop().await.unwrap();
      h.monitor.stop().await.unwrap();

      assert!(h.store.writes().is_empty());
      assert!(h.events.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_start_when_running_is_noop() {
      let mut h = running_harness().await;

      h.monitor.start().await.unwrap();

      assert_eq!(h.source.subscribe_count(), 1);
      assert_eq!(h.store.writes(), vec![true]);
      assert!(h.events.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_session_can_restart() {
      let mut h = running_harness().await;
      h.monitor.stop().await.unwrap();
      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::Stopped(StopReason::Requested)
      );

      h.monitor.start().await.unwrap();
      assert_eq!(next_event(&mut h.events).await, MonitorEvent::Started);
      assert_eq!(h.source.subscribe_count(), 2);
      assert_eq!(h.store.writes(), vec![true, false, true]);
   }

   #[tokio::test]
   async fn test_subscription_failure_rolls_back_flag() {
      let h = harness(true);
      h.source.fail_subscribe(true);

      let result = h.monitor.start().await;
      assert!(matches!(result, Err(LockError::SubscriptionFailed(_))));

      assert_eq!(
         h.monitor.status().await.unwrap().state,
         MonitorState::Stopped
      );
      assert!(!h.store.get_running().unwrap());
      assert_eq!(h.store.writes(), vec![true, false]);
   }

   #[tokio::test]
   async fn test_lost_subscription_stops_session() {
      let mut h = running_harness().await;

      h.source.close();

      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::Stopped(StopReason::SubscriptionLost)
      );
      assert!(!h.store.get_running().unwrap());
      assert!(!h.monitor.status().await.unwrap().running());
   }

   #[tokio::test]
   async fn test_dropping_last_handle_stops_session() {
      let mut h = running_harness().await;

      drop(h.monitor);

      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::Stopped(StopReason::Shutdown)
      );
      assert!(!h.store.get_running().unwrap());
   }

   #[tokio::test]
   async fn test_shutdown_stops_session_and_actor() {
      let mut h = running_harness().await;

      h.monitor.shutdown().await.unwrap();

      assert_eq!(
         next_event(&mut h.events).await,
         MonitorEvent::Stopped(StopReason::Shutdown)
      );
      assert!(!h.store.get_running().unwrap());
      assert!(matches!(
         h.monitor.status().await,
         Err(LockError::MonitorShutdown)
      ));
   }

   #[tokio::test]
   async fn test_request_grant_goes_to_host() {
      let h = harness(false);
      h.backend.grant_on_request(true);

      assert!(h.monitor.request_grant().await.unwrap());
      assert!(h.monitor.status().await.unwrap().granted);
      h.monitor.start().await.unwrap();
   }
}

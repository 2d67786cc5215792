//! In-memory stand-ins for the host collaborators, shared by unit tests.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   sync::{OwnedRwLockWriteGuard, RwLock, mpsc},
   time,
};

use crate::{
   error::{LockError, Result},
   event::{
      ConnectionEvent, ConnectionKind, EventBus, EventSource, MonitorEvent, Subscription,
   },
   lock::LockBackend,
   store::RunStateStore,
};

pub const TARGET_ADDRESS: Address = Address([0x5D, 0x1F, 0x6F, 0xFA, 0xA5, 0xCA]);
pub const OTHER_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

pub fn event(kind: ConnectionKind, name: Option<&str>, address: Address) -> ConnectionEvent {
   ConnectionEvent {
      kind,
      name: name.map(SmolStr::new),
      address,
   }
}

#[derive(Default)]
struct SourceState {
   sender: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
   subscribes: AtomicUsize,
   fail: AtomicBool,
}

/// Event source fed by the test through [`FakeSource::sender`].
#[derive(Clone, Default)]
pub struct FakeSource(Arc<SourceState>);

impl FakeSource {
   pub fn fail_subscribe(&self, fail: bool) {
      self.0.fail.store(fail, Ordering::SeqCst);
   }

   pub fn subscribe_count(&self) -> usize {
      self.0.subscribes.load(Ordering::SeqCst)
   }

   /// Sender of the most recent subscription.
   pub fn sender(&self) -> mpsc::Sender<ConnectionEvent> {
      self.0.sender.lock().clone().expect("not subscribed")
   }

   /// Simulates the host event stream going away.
   pub fn close(&self) {
      self.0.sender.lock().take();
   }
}

impl EventSource for FakeSource {
   async fn subscribe(&self) -> Result<Subscription> {
      self.0.subscribes.fetch_add(1, Ordering::SeqCst);
      if self.0.fail.load(Ordering::SeqCst) {
         return Err(LockError::Io(std::io::Error::other("no adapter")));
      }
      let (tx, rx) = mpsc::channel(16);
      *self.0.sender.lock() = Some(tx);
      Ok(Subscription::new(rx, None))
   }
}

#[derive(Default)]
struct BackendState {
   granted: AtomicBool,
   grant_on_request: AtomicBool,
   fail: AtomicBool,
   locked: AtomicBool,
   lock_calls: AtomicUsize,
   grant_checks: AtomicUsize,
   gate: Arc<RwLock<()>>,
}

/// Lock backend that records calls instead of locking anything.
#[derive(Clone, Default)]
pub struct FakeBackend(Arc<BackendState>);

impl FakeBackend {
   pub fn new(granted: bool) -> Self {
      let backend = Self::default();
      backend.set_granted(granted);
      backend
   }

   pub fn set_granted(&self, granted: bool) {
      self.0.granted.store(granted, Ordering::SeqCst);
   }

   pub fn grant_on_request(&self, grant: bool) {
      self.0.grant_on_request.store(grant, Ordering::SeqCst);
   }

   pub fn fail_locks(&self, fail: bool) {
      self.0.fail.store(fail, Ordering::SeqCst);
   }

   pub fn grant_checks(&self) -> usize {
      self.0.grant_checks.load(Ordering::SeqCst)
   }

   /// Parks every grant check until the returned guard is dropped.
   pub fn hold_grant_checks(&self) -> OwnedRwLockWriteGuard<()> {
      self.0.gate.clone().try_write_owned().expect("grant checks already held")
   }

   pub fn lock_calls(&self) -> usize {
      self.0.lock_calls.load(Ordering::SeqCst)
   }

   pub fn is_locked(&self) -> bool {
      self.0.locked.load(Ordering::SeqCst)
   }
}

impl LockBackend for FakeBackend {
   async fn is_granted(&self) -> bool {
      self.0.grant_checks.fetch_add(1, Ordering::SeqCst);
      let _gate = self.0.gate.read().await;
      self.0.granted.load(Ordering::SeqCst)
   }

   async fn request_grant(&self) -> Result<bool> {
      let granted = self.0.grant_on_request.load(Ordering::SeqCst);
      self.set_granted(granted);
      Ok(granted)
   }

   async fn lock_now(&self) -> Result<()> {
      self.0.lock_calls.fetch_add(1, Ordering::SeqCst);
      if self.0.fail.load(Ordering::SeqCst) {
         return Err(LockError::DBus(zbus::Error::Failure("lock refused".into())));
      }
      self.0.locked.store(true, Ordering::SeqCst);
      Ok(())
   }
}

/// Run-state store that keeps the flag in memory and logs every write.
#[derive(Default)]
pub struct MemoryStore {
   running: AtomicBool,
   writes: Mutex<Vec<bool>>,
}

impl MemoryStore {
   pub fn writes(&self) -> Vec<bool> {
      self.writes.lock().clone()
   }
}

impl RunStateStore for MemoryStore {
   fn get_running(&self) -> Result<bool> {
      Ok(self.running.load(Ordering::SeqCst))
   }

   fn set_running(&self, running: bool) -> Result<()> {
      self.running.store(running, Ordering::SeqCst);
      self.writes.lock().push(running);
      Ok(())
   }
}

/// Event bus forwarding everything to a channel the test can await.
pub struct RecordingBus(mpsc::UnboundedSender<MonitorEvent>);

impl RecordingBus {
   pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MonitorEvent>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (Arc::new(Self(tx)), rx)
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, event: MonitorEvent) {
      let _ = self.0.send(event);
   }
}

/// Waits for the next monitor event, failing the test after a second.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
   time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .expect("timed out waiting for monitor event")
      .expect("event bus closed")
}

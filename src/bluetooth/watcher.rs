//! BlueZ connection event source.
//!
//! One task follows the adapter's device list; every known device gets a
//! watcher task that turns changes of its `Connected` property into
//! [`ConnectionEvent`]s. All of them live in a `JoinSet` owned by the
//! adapter task, so dropping the subscription tears everything down.

use std::collections::HashMap;

use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{Stream, pin_mut, stream::StreamExt};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   task::{AbortHandle, JoinSet},
};

use crate::{
   error::Result,
   event::{ConnectionEvent, ConnectionKind, EventSource, Subscription},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Connection events of all devices known to one BlueZ adapter.
#[derive(Debug, Clone)]
pub struct BluezEvents {
   adapter: Option<SmolStr>,
}

impl BluezEvents {
   /// Watches `adapter` (e.g. `hci0`), or the default adapter if `None`.
   pub const fn new(adapter: Option<SmolStr>) -> Self {
      Self { adapter }
   }

   async fn open_adapter(&self, session: &Session) -> Result<Adapter> {
      let adapter = match &self.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      if let Ok(false) = adapter.is_powered().await {
         warn!(
            "Adapter {} is powered off, no events until it is powered on",
            adapter.name()
         );
      }
      Ok(adapter)
   }
}

impl EventSource for BluezEvents {
   async fn subscribe(&self) -> Result<Subscription> {
      let session = Session::new().await?;
      let adapter = self.open_adapter(&session).await?;

      let adapter_events = adapter.events().await?;
      let known = adapter.device_addresses().await?;
      info!(
         "Watching {} known devices on adapter {}",
         known.len(),
         adapter.name()
      );

      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let task = tokio::spawn(watch_adapter(session, adapter, adapter_events, known, tx));
      Ok(Subscription::new(rx, Some(task)))
   }
}

async fn watch_adapter(
   session: Session,
   adapter: Adapter,
   events: impl Stream<Item = AdapterEvent>,
   known: Vec<Address>,
   tx: mpsc::Sender<ConnectionEvent>,
) {
   // The adapter proxies need the session to stay connected.
   let _session = session;
   pin_mut!(events);

   let mut watchers = JoinSet::new();
   let mut handles: HashMap<Address, AbortHandle> = HashMap::new();

   for addr in known {
      spawn_watcher(&adapter, addr, &tx, &mut watchers, &mut handles);
   }

   loop {
      select! {
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(addr)) => {
               debug!("Device added on {}: {addr}", adapter.name());
               spawn_watcher(&adapter, addr, &tx, &mut watchers, &mut handles);
            },
            Some(AdapterEvent::DeviceRemoved(addr)) => {
               debug!("Device removed on {}: {addr}", adapter.name());
               if let Some(handle) = handles.remove(&addr) {
                  handle.abort();
               }
            },
            Some(_) => {},
            None => {
               warn!("Event stream of adapter {} ended", adapter.name());
               break;
            },
         },
         () = tx.closed() => break,
         Some(_) = watchers.join_next(), if !watchers.is_empty() => {},
      }
   }
}

fn spawn_watcher(
   adapter: &Adapter,
   addr: Address,
   tx: &mpsc::Sender<ConnectionEvent>,
   watchers: &mut JoinSet<()>,
   handles: &mut HashMap<Address, AbortHandle>,
) {
   if handles.get(&addr).is_some_and(|h| !h.is_finished()) {
      return;
   }
   match adapter.device(addr) {
      Ok(device) => {
         let handle = watchers.spawn(watch_device(device, tx.clone()));
         handles.insert(addr, handle);
      },
      Err(e) => debug!("Cannot open device {addr}: {e}"),
   }
}

async fn watch_device(device: Device, tx: mpsc::Sender<ConnectionEvent>) {
   let address = device.address();
   let events = match device.events().await {
      Ok(events) => events,
      Err(e) => {
         debug!("Cannot watch device {address}: {e}");
         return;
      },
   };
   pin_mut!(events);

   while let Some(event) = events.next().await {
      let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event else {
         continue;
      };
      let event = connection_event(address, connected, device.name().await);
      debug!("Device {address} {} (name: {:?})", event.kind, event.name);

      if tx.send(event).await.is_err() {
         break;
      }
   }
}

/// Translates a `Connected` property change into a connection event.
///
/// A name that cannot be read is reported as absent.
fn connection_event(
   address: Address,
   connected: bool,
   name: bluer::Result<Option<String>>,
) -> ConnectionEvent {
   let kind = if connected {
      ConnectionKind::Connected
   } else {
      ConnectionKind::Disconnected
   };
   ConnectionEvent {
      kind,
      name: name.ok().flatten().map(SmolStr::from),
      address,
   }
}

//! Bluetooth auto-lock daemon
//!
//! Watches BlueZ for one configured device and locks every session through
//! logind whenever that device connects or disconnects. The daemon exposes
//! its control surface on the session bus; the other subcommands are thin
//! clients of it.

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   signal::{
      self,
      unix::{SignalKind, signal as unix_signal},
   },
   sync::Notify,
   task::JoinHandle,
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::watcher::BluezEvents;
use dbus::MonitorService;
use event::{EventBus, MonitorEvent};
use monitor::Monitor;
use store::{HeedStore, RunStateStore};
use system::{HostLock, notifications::StatusIndicator};

mod bluetooth;
mod config;
mod control;
mod dbus;
mod error;
mod event;
mod lock;
mod monitor;
mod store;
mod system;
mod target;
#[cfg(test)]
mod testing;

use crate::{
   dbus::MonitorServiceSignals,
   error::{LockError, Result},
};

/// How long pending signals may take to flush on shutdown.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "btlockd", version)]
#[command(about = "Lock the session when a Bluetooth device connects or disconnects")]
struct Cli {
   #[command(subcommand)]
   command: Option<Commands>,

   /// Enable debug logging
   #[arg(short, long, global = true)]
   debug: bool,
}

#[derive(Subcommand)]
enum Commands {
   /// Run the daemon (default)
   Run,
   /// Start monitoring the target device
   Start,
   /// Stop monitoring
   Stop,
   /// Ask the system for permission to lock sessions
   Grant,
   /// Show whether locking is permitted and monitoring is active
   Status {
      /// Print the status as JSON
      #[arg(long)]
      json: bool,
   },
}

#[tokio::main]
async fn main() -> ExitCode {
   let cli = Cli::parse();

   let default_level = if cli.debug { "debug" } else { "info" };
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
      .init();

   let result = match cli.command.unwrap_or(Commands::Run) {
      Commands::Run => run_daemon().await,
      Commands::Start => control::start().await,
      Commands::Stop => control::stop().await,
      Commands::Grant => control::grant().await,
      Commands::Status { json } => match config::Config::load().and_then(|c| c.target_device()) {
         Ok(target) => control::status(&target, json).await,
         Err(e) => Err(e),
      },
   };

   match result {
      Ok(()) => ExitCode::SUCCESS,
      Err(e) => {
         error!("{e}");
         ExitCode::FAILURE
      },
   }
}

async fn run_daemon() -> Result<()> {
   info!("Starting btlockd...");

   // Load configuration
   let config = config::Config::load()?;
   let target = config.target_device()?;
   info!("Target device: {target}");

   let store: Arc<dyn RunStateStore> = Arc::new(HeedStore::open()?);

   let host = Arc::new(HostLock::connect().await?);
   let source = BluezEvents::new(config.adapter.as_deref().map(SmolStr::new));

   // Create event channel
   let event_bus = EventProcessor::new();
   let monitor = Monitor::new(
      target.clone(),
      source,
      host,
      store.clone(),
      event_bus.clone(),
   );

   // Build D-Bus connection. Owning the bus name proves no other daemon is
   // alive, only then is the run-state flag ours to reconcile.
   let service = MonitorService::new(monitor.clone(), target.clone());
   let claim = async {
      Ok::<_, LockError>(
         connection::Builder::session()?
            .name(dbus::BUS_NAME)?
            .serve_at(dbus::OBJECT_PATH, service)?
            .build()
            .await?,
      )
   };
   let (connection, stale) = store::claim_and_reconcile(store.as_ref(), claim).await?;

   info!("btlockd D-Bus service started at {}", dbus::BUS_NAME);

   let indicator = if config.status_indicator {
      match StatusIndicator::new(&connection, &target.to_string()).await {
         Ok(indicator) => Some(indicator),
         Err(e) => {
            warn!("Status indicator unavailable: {e}");
            None
         },
      }
   } else {
      None
   };

   // Start event processor
   let dispatcher = event_bus
      .spawn_dispatcher(connection, indicator, target.to_string())
      .await?;

   if stale && config.resume_after_restart {
      info!("Resuming monitoring session interrupted by an unclean exit");
      if let Err(e) = monitor.start().await {
         warn!("Could not resume monitoring: {e}");
      }
   }

   // Wait for shutdown signal
   wait_for_shutdown().await?;
   info!("Shutting down btlockd...");

   if let Err(e) = monitor.shutdown().await {
      warn!("Monitor did not shut down cleanly: {e}");
   }
   let _ = time::timeout(DISPATCH_DRAIN_TIMEOUT, dispatcher).await;

   Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
   let mut terminate = unix_signal(SignalKind::terminate())?;
   select! {
      result = signal::ctrl_c() => result?,
      _ = terminate.recv() => {},
   }
   Ok(())
}

struct EventProcessor {
   queue: SegQueue<MonitorEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<MonitorEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      iface: &InterfaceRef<MonitorService>,
      indicator: Option<&StatusIndicator>,
      target: &str,
      event: MonitorEvent,
   ) -> Result<()> {
      match event {
         MonitorEvent::Started => {
            if let Some(indicator) = indicator {
               indicator.show().await;
            }
            iface.monitor_started(target).await?;
            iface.get().await.state_changed(iface.signal_emitter()).await?;
         },
         MonitorEvent::Stopped(reason) => {
            if let Some(indicator) = indicator {
               indicator.hide().await;
            }
            iface.monitor_stopped(reason.into()).await?;
            iface.get().await.state_changed(iface.signal_emitter()).await?;
         },
         MonitorEvent::LockRequested(event) => {
            iface
               .lock_requested(&event.address.to_string(), event.kind.into())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      connection: Connection,
      indicator: Option<StatusIndicator>,
      target: String,
   ) -> Result<JoinHandle<()>> {
      let iface = connection
         .object_server()
         .interface::<_, MonitorService>(dbus::OBJECT_PATH)
         .await?;
      Ok(tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = Self::dispatch(&iface, indicator.as_ref(), &target, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
         // Keep the bus connection open until the last signal went out.
         drop(connection);
      }))
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: MonitorEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

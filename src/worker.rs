//! Background worker: the message-driven driver that binds the engine
//! together.
//!
//! The worker consumes messages from the foreground application and the host
//! platform, dispatching each to a small idempotent handler. Handlers never
//! hold state across messages that is not already committed to the durable
//! store; the only in-memory flag is the current connectivity reading, which
//! the next probe re-derives after a restart.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lifecycle::{ActivationReport, LifecycleManager};
use crate::net::Origin;
use crate::push::{NotificationAction, NotificationDescriptor, NotificationSink, PushReaction, PushRouter};
use crate::store::Store;
use crate::sync::{DrainReport, SyncCoordinator};

/// Messages the foreground application and host platform send the worker.
#[derive(Debug)]
pub enum WorkerMessage {
  /// Skip waiting and activate the installed cache version now.
  ForceActivate,
  /// Bulk overwrite of one named entity cache after a successful foreground
  /// fetch.
  ReplaceCachedEntities {
    entity_type: String,
    entities: Vec<(String, Value)>,
  },
  /// Drain the pending-mutation queue.
  DrainQueue,
  /// Connectivity reading from the platform probe; a transition to online
  /// triggers a drain.
  ConnectivityChanged { online: bool },
  /// Inbound push payload, already decrypted by the platform.
  Push { payload: Vec<u8> },
  /// User interaction with a rendered notification.
  NotificationInteraction {
    notification: NotificationDescriptor,
    action: NotificationAction,
  },
  /// Stop the worker loop.
  Shutdown,
}

/// Events the engine emits for the foreground application. Advisory: a
/// foreground that is not listening misses nothing it cannot re-derive from
/// the store.
#[derive(Debug, Clone)]
pub enum EngineEvent {
  /// A named entity cache changed; the foreground may re-render from it.
  EntitiesChanged { entity_type: String },
  /// A drain pass finished.
  QueueDrained(DrainReport),
  /// A notification interaction asked for the app to open a deep link.
  NavigationRequested { link: String },
  /// A cache version was activated and superseded partitions purged.
  Activated(ActivationReport),
}

/// Cloneable sender half handed to the foreground and the platform glue.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
  /// Send a message; returns false once the worker has stopped.
  pub fn send(&self, message: WorkerMessage) -> bool {
    self.tx.send(message).is_ok()
  }

  pub fn force_activate(&self) -> bool {
    self.send(WorkerMessage::ForceActivate)
  }

  pub fn replace_entities(&self, entity_type: impl Into<String>, entities: Vec<(String, Value)>) -> bool {
    self.send(WorkerMessage::ReplaceCachedEntities {
      entity_type: entity_type.into(),
      entities,
    })
  }

  pub fn drain_queue(&self) -> bool {
    self.send(WorkerMessage::DrainQueue)
  }

  pub fn connectivity_changed(&self, online: bool) -> bool {
    self.send(WorkerMessage::ConnectivityChanged { online })
  }

  pub fn push(&self, payload: Vec<u8>) -> bool {
    self.send(WorkerMessage::Push { payload })
  }

  pub fn notification_interaction(
    &self,
    notification: NotificationDescriptor,
    action: NotificationAction,
  ) -> bool {
    self.send(WorkerMessage::NotificationInteraction {
      notification,
      action,
    })
  }

  pub fn shutdown(&self) -> bool {
    self.send(WorkerMessage::Shutdown)
  }
}

pub struct Worker<O: Origin, S: NotificationSink> {
  store: Arc<Store>,
  lifecycle: LifecycleManager,
  sync: SyncCoordinator<O>,
  push: PushRouter<S>,
  online: bool,
  rx: mpsc::UnboundedReceiver<WorkerMessage>,
  events: mpsc::UnboundedSender<EngineEvent>,
}

impl<O: Origin, S: NotificationSink> Worker<O, S> {
  /// Create the worker plus the handle and event stream the embedder keeps.
  pub fn new(
    store: Arc<Store>,
    origin: Arc<O>,
    sink: Arc<S>,
    lifecycle: LifecycleManager,
  ) -> (Self, WorkerHandle, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let worker = Self {
      sync: SyncCoordinator::new(Arc::clone(&store), origin),
      push: PushRouter::new(Arc::clone(&store), sink),
      store,
      lifecycle,
      online: false,
      rx,
      events: events_tx,
    };

    (worker, WorkerHandle { tx }, events_rx)
  }

  /// Run until shutdown or until every handle is dropped. Handler failures
  /// are logged, never fatal to the loop.
  pub async fn run(mut self) {
    info!("worker running");
    while let Some(message) = self.rx.recv().await {
      if matches!(message, WorkerMessage::Shutdown) {
        break;
      }
      if let Err(error) = self.handle_message(message).await {
        warn!(%error, "worker message handler failed");
      }
    }
    info!("worker stopped");
  }

  async fn handle_message(&mut self, message: WorkerMessage) -> Result<()> {
    match message {
      WorkerMessage::ForceActivate => {
        let report = self.lifecycle.activate()?;
        self.emit(EngineEvent::Activated(report));
      }
      WorkerMessage::ReplaceCachedEntities {
        entity_type,
        entities,
      } => {
        self.store.replace_entities(&entity_type, &entities)?;
        debug!(%entity_type, count = entities.len(), "entity cache replaced");
        self.emit(EngineEvent::EntitiesChanged { entity_type });
      }
      WorkerMessage::DrainQueue => {
        self.drain().await?;
      }
      WorkerMessage::ConnectivityChanged { online } => {
        let was_online = self.online;
        self.online = online;
        if online && !was_online {
          debug!("connectivity restored, draining queue");
          self.drain().await?;
        }
      }
      WorkerMessage::Push { payload } => {
        self.push.handle_push(&payload).await?;
      }
      WorkerMessage::NotificationInteraction {
        notification,
        action,
      } => match self.push.handle_interaction(&notification, action)? {
        PushReaction::Enqueued { mutation_id } => {
          debug!(%mutation_id, "notification interaction queued a mutation");
          // Opportunistic drain; offline enqueues wait for the next trigger
          if self.online {
            self.drain().await?;
          }
        }
        PushReaction::Navigate { link } => {
          self.emit(EngineEvent::NavigationRequested { link });
        }
      },
      WorkerMessage::Shutdown => {}
    }
    Ok(())
  }

  async fn drain(&self) -> Result<()> {
    let report = self.sync.drain().await?;
    self.emit(EngineEvent::QueueDrained(report));
    Ok(())
  }

  fn emit(&self, event: EngineEvent) {
    // Nobody listening is fine
    let _ = self.events.send(event);
  }
}

//! Push router: inbound payloads become local notifications, interactions
//! become queued actions or navigation requests.
//!
//! The host platform requires every inbound push to end in a visible
//! notification, so malformed payloads degrade to a generic fallback instead
//! of being dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{PendingMutation, PushSubscriptionRecord, Store};

/// Action identifiers rendered with every notification.
pub const PRIMARY_ACTION: &str = "primary-action";
pub const SECONDARY_ACTION: &str = "secondary-action";

/// Parsed, renderable form of one inbound push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationDescriptor {
  pub title: String,
  pub body: String,
  /// Correlation tag chosen by the sender; the platform replaces an earlier
  /// notification carrying the same tag.
  #[serde(default)]
  pub tag: String,
  /// Opaque blob carried through to interaction handling.
  #[serde(default)]
  pub data: Value,
}

impl NotificationDescriptor {
  /// Generic notification shown when a payload cannot be parsed.
  pub fn fallback() -> Self {
    Self {
      title: "medsync".to_string(),
      body: "You have a new notification.".to_string(),
      tag: "fallback".to_string(),
      data: Value::Null,
    }
  }
}

/// The two fixed actions every notification renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
  Primary,
  Secondary,
}

impl NotificationAction {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Primary => PRIMARY_ACTION,
      Self::Secondary => SECONDARY_ACTION,
    }
  }

  pub fn from_id(id: &str) -> Option<Self> {
    match id {
      PRIMARY_ACTION => Some(Self::Primary),
      SECONDARY_ACTION => Some(Self::Secondary),
      _ => None,
    }
  }
}

/// Where rendered notifications go. Injectable so embedders supply the
/// platform notifier and tests intercept it.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
  async fn show(&self, notification: &NotificationDescriptor) -> Result<()>;
}

/// Sink that only logs. Default for the headless worker binary.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
  async fn show(&self, notification: &NotificationDescriptor) -> Result<()> {
    info!(title = %notification.title, tag = %notification.tag, "notification");
    Ok(())
  }
}

/// What a notification interaction resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum PushReaction {
  /// A mutation was synthesized and enqueued. The worker drains the queue
  /// opportunistically when connectivity is available.
  Enqueued { mutation_id: Uuid },
  /// The foreground app should be focused at this deep link.
  Navigate { link: String },
}

/// Wire shape of an inbound push payload.
#[derive(Debug, Deserialize)]
struct PushPayload {
  title: String,
  body: String,
  #[serde(default)]
  tag: String,
  #[serde(default)]
  data: Value,
}

/// Interaction directives carried in the payload's data blob.
#[derive(Debug, Default, Deserialize)]
struct PushDirectives {
  #[serde(default)]
  mutation: Option<MutationSpec>,
  #[serde(default)]
  link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MutationSpec {
  action: String,
  #[serde(default)]
  payload: Value,
}

pub struct PushRouter<S: NotificationSink> {
  store: Arc<Store>,
  sink: Arc<S>,
}

impl<S: NotificationSink> PushRouter<S> {
  pub fn new(store: Arc<Store>, sink: Arc<S>) -> Self {
    Self { store, sink }
  }

  /// Parse and render one inbound push.
  pub async fn handle_push(&self, payload: &[u8]) -> Result<NotificationDescriptor> {
    let notification = match serde_json::from_slice::<PushPayload>(payload) {
      Ok(parsed) => NotificationDescriptor {
        title: parsed.title,
        body: parsed.body,
        tag: parsed.tag,
        data: parsed.data,
      },
      Err(error) => {
        warn!(%error, "malformed push payload, rendering fallback notification");
        NotificationDescriptor::fallback()
      }
    };

    self.sink.show(&notification).await?;
    Ok(notification)
  }

  /// Map a user interaction on a rendered notification back onto the engine:
  /// the primary action prefers the mutation directive, everything else
  /// resolves to the payload's deep link (root when absent).
  pub fn handle_interaction(
    &self,
    notification: &NotificationDescriptor,
    action: NotificationAction,
  ) -> Result<PushReaction> {
    let directives: PushDirectives =
      serde_json::from_value(notification.data.clone()).unwrap_or_default();

    if action == NotificationAction::Primary {
      if let Some(spec) = directives.mutation {
        let mutation = PendingMutation::new(spec.action, spec.payload);
        self.store.enqueue(&mutation)?;
        debug!(id = %mutation.id, action = %mutation.action, "interaction enqueued mutation");
        return Ok(PushReaction::Enqueued {
          mutation_id: mutation.id,
        });
      }
    }

    Ok(PushReaction::Navigate {
      link: directives.link.unwrap_or_else(|| "/".to_string()),
    })
  }

  /// Persist the registration the platform handed back, replacing any older
  /// record for the same endpoint.
  pub fn register_subscription(&self, record: &PushSubscriptionRecord) -> Result<()> {
    self.store.put_subscription(record)?;
    info!(endpoint = %record.endpoint, "push subscription registered");
    Ok(())
  }

  pub fn unregister_subscription(&self, endpoint: &str) -> Result<()> {
    self.store.delete_subscription(endpoint)?;
    info!(%endpoint, "push subscription removed");
    Ok(())
  }
}
